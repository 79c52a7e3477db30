use anyhow::Result;
use fanout_server::config::FanoutConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let config = FanoutConfig::load()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting fanout server...");

    let (app, sfu) = fanout_server::create_app(config.clone()).await?;

    let listener = tokio::net::TcpListener::bind(&config.http.bind_address).await?;
    tracing::info!("Listening on {}", config.http.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    sfu.close();
    tracing::info!("Fanout server stopped");

    Ok(())
}
