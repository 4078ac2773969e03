//! Scriptdrop server
//!
//! Delivers script files to channel members in exchange for coins

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use scriptdrop::config::Config;
use scriptdrop::delivery::DeliveryPipeline;
use scriptdrop::pg_storage::PgStorage;
use scriptdrop::telegram::TelegramClient;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "scriptdrop-server", version, about)]
struct Args {
    /// Path to the configuration file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Bind host override
    #[arg(long, env = "SCRIPTDROP_HOST")]
    host: Option<String>,

    /// Bind port override
    #[arg(long, env = "SCRIPTDROP_PORT")]
    port: Option<u16>,

    /// Seed this user id into the admin set at startup
    #[arg(long, env = "SCRIPTDROP_ADMIN_ID")]
    admin_id: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    info!("Starting Scriptdrop server");

    let config = Config::load_from(&args.config)?;

    // PostgreSQL storage (required)
    let database_url = std::env::var("DATABASE_URL").map_err(|_| {
        error!("DATABASE_URL environment variable is required");
        anyhow::anyhow!("DATABASE_URL not set")
    })?;

    let storage = Arc::new(PgStorage::new(&database_url).await?);
    info!("PostgreSQL storage initialized");

    if let Some(admin_id) = &args.admin_id {
        storage.add_admin(admin_id).await?;
    }

    // One Telegram client serves as both membership oracle and transport
    let telegram = Arc::new(TelegramClient::new(&config.telegram.api_base));
    if !telegram.is_authenticated() {
        warn!("TELEGRAM_BOT_TOKEN not set - deliveries will fail until it is provided");
    }

    let pipeline = Arc::new(DeliveryPipeline::new(
        storage.clone(),
        storage.clone(),
        telegram.clone(),
        telegram,
        &config.delivery,
    ));
    info!(
        "Delivery pipeline ready (price: {} coins, channel: {})",
        config.delivery.price_coins, config.delivery.channel
    );

    let host = args.host.unwrap_or(config.server.host);
    let port = args.port.unwrap_or(config.server.port);

    scriptdrop::server::run_server(&host, port, storage, pipeline).await?;

    Ok(())
}
