use anyhow::Result;
use tracing_subscriber::EnvFilter;

use glovebox::{run_server, AppConfig, Services};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = AppConfig::from_env();
    let services = Services::build(config).await?;

    // First tick fires immediately, so stale sessions go at startup too.
    let _purge = services
        .sessions
        .spawn_purge_task(services.config.session_purge_interval);

    if services.store.has_index() {
        let ingestor = services.ingestor.clone();
        tokio::spawn(async move {
            match ingestor.reconcile().await {
                Ok(report) if !report.repaired.is_empty() || !report.still_degraded.is_empty() => {
                    tracing::info!(
                        repaired = report.repaired.len(),
                        still_degraded = report.still_degraded.len(),
                        "startup reconcile finished"
                    )
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(error = %format!("{err:#}"), "startup reconcile failed"),
            }
        });
    }

    run_server(services).await
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
