use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use perpetual_core::store::Store;
use perpetual_core::task::{PerpetualTask, TaskDb};
use std::path::{Path, PathBuf};

#[derive(Subcommand)]
pub enum TaskSubcommand {
    /// List an account's perpetual tasks
    List {
        /// Database file
        #[arg(long, env = "PERPETUAL_DB", default_value = "perpetual.redb")]
        db: PathBuf,

        /// Account id
        #[arg(long)]
        account: String,
    },
}

pub fn run(subcmd: TaskSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        TaskSubcommand::List { db, account } => list(&db, &account, json),
    }
}

fn list(db: &Path, account: &str, json: bool) -> anyhow::Result<()> {
    let store = Store::open(db).with_context(|| format!("failed to open {}", db.display()))?;
    let tasks = TaskDb::new(store)?.list(account)?;

    if json {
        return print_json(&tasks);
    }
    if tasks.is_empty() {
        println!("No perpetual tasks for account '{account}'.");
        return Ok(());
    }
    print_table(
        &["ID", "TYPE", "INTERVAL", "WORKER", "LAST RUN", "ENABLED"],
        tasks.iter().map(row).collect(),
    );
    Ok(())
}

fn row(t: &PerpetualTask) -> Vec<String> {
    vec![
        t.id.clone(),
        t.task_type.to_string(),
        format!("{}s", t.schedule.interval.as_secs()),
        t.assigned_worker.clone().unwrap_or_else(|| "-".to_string()),
        t.last_run_at
            .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string()),
        if t.enabled { "yes" } else { "no" }.to_string(),
    ]
}
