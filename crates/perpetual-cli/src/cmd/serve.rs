use anyhow::Context;
use perpetual_core::config::{Config, WarnLevel};
use perpetual_server::state::AppState;
use std::path::Path;

pub fn run(config_path: Option<&Path>, db: &Path, port: u16) -> anyhow::Result<()> {
    let config = Config::resolve(config_path).context("failed to load config")?;
    for w in config.validate() {
        match w.level {
            WarnLevel::Warning => tracing::warn!("{}", w.message),
            WarnLevel::Error => anyhow::bail!("invalid config: {}", w.message),
        }
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        // Opened inside the runtime so the HTTP trigger sink can spawn.
        let state = AppState::open(db, config)
            .with_context(|| format!("failed to open database {}", db.display()))?;
        perpetual_server::serve(state, port).await
    })
}
