mod cmd;
mod output;

use clap::{Parser, Subcommand};
use cmd::{
    config::ConfigSubcommand, subscription::SubscriptionSubcommand, task::TaskSubcommand,
    worker::WorkerArgs,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "perpetual",
    about = "Perpetual task control plane: subscriptions, task assignment and pull-based workers",
    version,
    propagate_version = true
)]
struct Cli {
    /// Config file (YAML). Missing file means defaults.
    #[arg(long, global = true, env = "PERPETUAL_CONFIG")]
    config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control-plane HTTP server
    Serve {
        /// Database file
        #[arg(long, env = "PERPETUAL_DB", default_value = "perpetual.redb")]
        db: PathBuf,

        /// Port to listen on
        #[arg(long, env = "PERPETUAL_PORT", default_value_t = 7470)]
        port: u16,
    },

    /// Run a worker that pulls tasks from a control plane
    Worker(WorkerArgs),

    /// Inspect and validate configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Inspect stored subscriptions
    Subscription {
        #[command(subcommand)]
        subcommand: SubscriptionSubcommand,
    },

    /// Inspect stored perpetual tasks
    Task {
        #[command(subcommand)]
        subcommand: TaskSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Serve { .. } | Commands::Worker(_) => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let config = cli.config.as_deref();

    let result = match cli.command {
        Commands::Serve { db, port } => cmd::serve::run(config, &db, port),
        Commands::Worker(args) => cmd::worker::run(config, args),
        Commands::Config { subcommand } => cmd::config::run(config, subcommand, cli.json),
        Commands::Subscription { subcommand } => cmd::subscription::run(subcommand, cli.json),
        Commands::Task { subcommand } => cmd::task::run(subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
