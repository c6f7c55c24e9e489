use log::{error, info};
use presence_sync::{PresenceConfig, PresenceServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = PresenceConfig::from_env();
    config.validate()?;

    info!(
        "Starting presence server on {} (window {} ms, tick {} ms, {:?} mode)",
        config.bind_addr, config.window_size_ms, config.tick_interval_ms, config.broadcast_mode
    );

    let server = PresenceServer::new(config);
    let listener = server.bind().await?;

    let shutdown = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => {
                error!("Failed to listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    server.serve(listener, shutdown).await?;
    Ok(())
}
