use anyhow::Context;

use driftnet::{Config, Manager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Config::load().context("load configuration")?;
    let manager = Manager::new(config).await.context("start crawler")?;

    loop {
        tokio::select! {
            result = manager.recv() => {
                let Some(result) = result else { break };
                tracing::info!(
                    hash = %result.info_hash,
                    name = %result.name,
                    files = result.files.len(),
                    size = result.files.iter().map(|f| f.length).sum::<u64>(),
                    peers = result.peers.len(),
                    "torrent indexed"
                );
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("listen for ctrl-c")?;
                tracing::info!("shutting down");
                manager.terminate().await;
                break;
            }
        }
    }

    Ok(())
}
