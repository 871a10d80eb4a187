//! Per-resource mutual exclusion backed by the shared store.
//!
//! A lock is a lease row in the `locks` table keyed by `<kind>:<id>`. The
//! lease carries an expiry (`hold` timeout) so a holder that dies without
//! releasing cannot block the resource forever. Unrelated resources never
//! contend: there is no global lock.
//!
//! ```text
//! acquire(kind, id, wait, hold)
//!   loop:
//!     write txn: row absent or expired → insert own lease, commit, return guard
//!     waited ≥ wait → LockTimeout
//!     sleep(poll_interval)
//! ```

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use redb::TableDefinition;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::LockConfig;
use crate::error::{db_err, PerpetualError, Result};
use crate::store::{encode, read_json, JsonTable, Store};

const LOCKS: JsonTable = TableDefinition::new("locks");

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Lease {
    holder: Uuid,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// ResourceLocker
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ResourceLocker {
    store: Store,
    poll_interval: Duration,
}

impl ResourceLocker {
    pub fn new(store: Store, config: &LockConfig) -> Result<Self> {
        store.ensure_table(LOCKS)?;
        Ok(Self {
            store,
            poll_interval: config.poll_interval(),
        })
    }

    /// Block until the lock on `(kind, id)` is held or `wait` elapses.
    ///
    /// The returned guard releases the lock when dropped. If the holder
    /// outlives `hold`, the lease expires and another caller may take it.
    pub fn acquire(&self, kind: &str, id: &str, wait: Duration, hold: Duration) -> Result<LockGuard> {
        let key = lock_key(kind, id);
        let holder = Uuid::new_v4();
        // A wait too long to represent as an Instant never times out.
        let deadline = Instant::now().checked_add(wait);
        loop {
            if self.try_claim(&key, holder, hold)? {
                tracing::debug!(resource = %key, "lock acquired");
                return Ok(self.guard(key, holder));
            }
            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(PerpetualError::LockTimeout { resource: key });
                    }
                    self.poll_interval.min(deadline - now)
                }
                None => self.poll_interval,
            };
            std::thread::sleep(pause);
        }
    }

    /// Take the lock only if it is free right now.
    pub fn try_acquire(&self, kind: &str, id: &str, hold: Duration) -> Result<Option<LockGuard>> {
        let key = lock_key(kind, id);
        let holder = Uuid::new_v4();
        if self.try_claim(&key, holder, hold)? {
            Ok(Some(self.guard(key, holder)))
        } else {
            Ok(None)
        }
    }

    fn guard(&self, key: String, holder: Uuid) -> LockGuard {
        LockGuard {
            store: self.store.clone(),
            key,
            holder,
            released: false,
        }
    }

    fn try_claim(&self, key: &str, holder: Uuid, hold: Duration) -> Result<bool> {
        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(hold)
            .ok()
            .and_then(|hold| now.checked_add_signed(hold))
            .ok_or_else(|| PerpetualError::validation(format!("lock hold of {hold:?} is out of range")))?;
        let wt = self.store.db().begin_write().map_err(db_err)?;
        let claimed = {
            let mut table = wt.open_table(LOCKS).map_err(db_err)?;
            let current: Option<Lease> = read_json(&table, key)?;
            match current {
                Some(lease) if lease.expires_at > now => false,
                stale => {
                    if let Some(lease) = stale {
                        tracing::warn!(resource = %key, holder = %lease.holder, "evicting expired lock lease");
                    }
                    let lease = Lease {
                        holder,
                        acquired_at: now,
                        expires_at,
                    };
                    table.insert(key, encode(&lease)?.as_slice()).map_err(db_err)?;
                    true
                }
            }
        };
        wt.commit().map_err(db_err)?;
        Ok(claimed)
    }
}

fn lock_key(kind: &str, id: &str) -> String {
    format!("{kind}:{id}")
}

fn release_lease(store: &Store, key: &str, holder: Uuid) -> Result<()> {
    let wt = store.db().begin_write().map_err(db_err)?;
    {
        let mut table = wt.open_table(LOCKS).map_err(db_err)?;
        let current: Option<Lease> = read_json(&table, key)?;
        // Only remove our own lease; an expired lease may already belong to
        // someone else.
        if current.is_some_and(|l| l.holder == holder) {
            table.remove(key).map_err(db_err)?;
        }
    }
    wt.commit().map_err(db_err)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// LockGuard
// ---------------------------------------------------------------------------

/// Held lock. Released on drop, on every exit path.
pub struct LockGuard {
    store: Store,
    key: String,
    holder: Uuid,
    released: bool,
}

impl LockGuard {
    pub fn resource(&self) -> &str {
        &self.key
    }

    /// Release explicitly and surface any store error.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        release_lease(&self.store, &self.key, self.holder)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = release_lease(&self.store, &self.key, self.holder) {
            tracing::warn!(resource = %self.key, error = %e, "failed to release lock; lease will expire");
        }
    }
}
