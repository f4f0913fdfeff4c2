//! rdp-relay: RDP relay server binary

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rdp_relay::{RelayServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting rdp-relay");

    let config = ServerConfig::load()?;
    let server = RelayServer::new(config).await?;

    if let Err(e) = server.run().await {
        error!("Server error: {:#}", e);
        return Err(e);
    }

    info!("rdp-relay stopped");
    Ok(())
}
