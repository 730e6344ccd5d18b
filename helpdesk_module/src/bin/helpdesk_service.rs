use helpdesk_module::service::{run_server, ServiceConfig};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_target(false).init();

    let config = ServiceConfig::from_env()?;
    info!(
        "starting helpdesk service queue_backend={} accounts_config={}",
        config.queue_backend,
        config.accounts_config_path.display()
    );

    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("failed to listen for shutdown signal: {}", err);
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
    };
    run_server(config, shutdown).await
}
