//! streampoll HTTP service entry point.

use streampoll::app::run_with_shutdown;
use streampoll::config::ServiceConfig;
use streampoll::observability::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = ServiceConfig::from_env_or_yaml()?;
    tracing::info!(?config, "starting streampoll");

    run_with_shutdown(config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}
