use anyhow::Context;
use clap::Args;
use perpetual_agent::{
    CommandExecutor, HttpControlPlane, RunnerConfig, WorkerExit, WorkerIdentity, WorkerRunner,
};
use perpetual_core::config::{Config, WorkerConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Args)]
pub struct WorkerArgs {
    /// Control-plane base URL
    #[arg(long, env = "PERPETUAL_URL", default_value = "http://localhost:7470")]
    url: String,

    /// Bearer token presented on every call
    #[arg(long, env = "PERPETUAL_WORKER_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Account whose tasks this worker pulls
    #[arg(long, env = "PERPETUAL_ACCOUNT")]
    account: String,

    /// Stable worker id; defaults to the host name. A fresh instance id is
    /// generated per process.
    #[arg(long, env = "PERPETUAL_WORKER_ID")]
    worker_id: Option<String>,

    /// Per-task collector timeout in seconds
    #[arg(long, default_value_t = 120)]
    task_timeout: u64,

    /// Per-request HTTP timeout in seconds
    #[arg(long, default_value_t = 30)]
    request_timeout: u64,

    /// Keep the worker id registered after a clean shutdown
    #[arg(long)]
    keep_registration: bool,

    /// Collector program, followed by its arguments
    #[arg(required = true, trailing_var_arg = true, value_name = "PROGRAM")]
    exec: Vec<String>,
}

pub fn run(config_path: Option<&Path>, args: WorkerArgs) -> anyhow::Result<()> {
    let config = Config::resolve(config_path).context("failed to load config")?;
    let runner_config = runner_config(&config.worker, args.keep_registration);

    let mut exec = args.exec.into_iter();
    let program = exec.next().map(PathBuf::from).context("no collector program given")?;
    let executor = Arc::new(CommandExecutor::new(
        program,
        exec.collect(),
        Duration::from_secs(args.task_timeout),
    ));
    let transport = Arc::new(
        HttpControlPlane::new(args.url, args.token, Duration::from_secs(args.request_timeout))
            .context("failed to build control-plane client")?,
    );
    let worker_id = args
        .worker_id
        .or_else(|| std::env::var("HOSTNAME").ok())
        .filter(|id| !id.trim().is_empty())
        .context("no worker id given and HOSTNAME is not set")?;
    let identity = WorkerIdentity::new(worker_id, args.account);

    let rt = tokio::runtime::Runtime::new()?;
    let exit = rt.block_on(async move {
        let runner = WorkerRunner::new(transport, identity, executor, runner_config);
        runner
            .run(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await
    })?;

    match exit {
        WorkerExit::Shutdown => Ok(()),
        WorkerExit::SelfDestructed => {
            anyhow::bail!("worker credentials were rejected; worker shut itself down")
        }
    }
}

fn runner_config(worker: &WorkerConfig, keep_registration: bool) -> RunnerConfig {
    RunnerConfig {
        poll_interval: worker.poll_interval(),
        heartbeat_interval: worker.heartbeat_interval(),
        heartbeat_timeout: worker.heartbeat_timeout(),
        max_concurrent_tasks: worker.max_concurrent_tasks.max(1),
        max_acquire_attempts: worker.max_acquire_attempts,
        unregister_on_shutdown: !keep_registration,
    }
}
