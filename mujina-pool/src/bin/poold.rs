//! Main entry point for the mujina-pool daemon.

use std::env;

use mujina_pool::{config::Config, daemon::Daemon, tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing::init_journald_or_stdout();

    let path = env::args().nth(1).unwrap_or_else(|| "pool.json".to_owned());
    let config = Config::load(&path)?;

    let daemon = Daemon::new(config);
    daemon.run().await
}
