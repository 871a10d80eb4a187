use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use perpetual_core::registry::{Subscription, SubscriptionDb};
use perpetual_core::store::Store;
use std::path::{Path, PathBuf};

#[derive(Subcommand)]
pub enum SubscriptionSubcommand {
    /// List an account's subscriptions
    List {
        /// Database file
        #[arg(long, env = "PERPETUAL_DB", default_value = "perpetual.redb")]
        db: PathBuf,

        /// Account id
        #[arg(long)]
        account: String,
    },
}

pub fn run(subcmd: SubscriptionSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        SubscriptionSubcommand::List { db, account } => list(&db, &account, json),
    }
}

fn list(db: &Path, account: &str, json: bool) -> anyhow::Result<()> {
    let store = Store::open(db).with_context(|| format!("failed to open {}", db.display()))?;
    let rows = SubscriptionDb::new(store)?.list(account)?;

    if json {
        return print_json(&rows);
    }
    if rows.is_empty() {
        println!("No subscriptions for account '{account}'.");
        return Ok(());
    }
    print_table(
        &["ID", "TYPE", "SCOPE", "SIGNATURES", "TASK", "FAILED", "LAST KEY"],
        rows.iter().map(row).collect(),
    );
    Ok(())
}

fn row(s: &Subscription) -> Vec<String> {
    vec![
        s.id.clone(),
        format!("{:?}", s.kind).to_uppercase(),
        s.scope.to_string(),
        s.signatures.len().to_string(),
        s.perpetual_task_id.clone().unwrap_or_else(|| "-".to_string()),
        s.failed_attempts.to_string(),
        s.polled_keys.last().cloned().unwrap_or_else(|| "-".to_string()),
    ]
}
