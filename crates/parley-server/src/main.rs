use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Parley signaling server...");

    let config = parley_server::state::Config::load()?;
    let bind_address = config.bind_address.clone();

    let (app, state) = parley_server::create_app(config);

    if !state
        .engine
        .wait_connected(std::time::Duration::from_secs(5))
        .await
    {
        tracing::warn!("media engine not reachable yet; joins will fail until it comes up");
    }

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!("Listening on {}", bind_address);

    axum::serve(listener, app).await?;

    Ok(())
}
