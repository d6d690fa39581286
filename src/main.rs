mod api;
mod config;
mod provider;
mod registry;
mod update;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use log::{info, warn};

use crate::provider::cloudflare::CloudflareClient;
use crate::registry::Registry;
use crate::update::Updater;

#[derive(Parser, Debug)]
#[command(name = "ddns-bridge")]
#[command(about = "A dynamic DNS update bridge for Cloudflare")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration first (before logger init)
    let config = config::Config::load(&args.config)?;

    // Initialize logger with config log level (env var takes precedence)
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&config.server.log_level)
    ).init();

    info!("Loading configuration from: {}", args.config);

    let registry = Registry::load(&config.registry.path)?;
    if registry.is_empty() {
        warn!("No domains loaded from {}", config.registry.path);
    } else {
        info!("Loaded {} domain(s) from {}", registry.len(), config.registry.path);
    }

    let provider = CloudflareClient::new(&config.cloudflare)?;
    let updater = Updater::new(Arc::new(registry), Arc::new(provider));

    // Create router
    let app = api::create_router(api::AppState {
        updater,
        trust_forwarded_headers: config.server.trust_forwarded_headers,
    });

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Server listening on http://{}", addr);
    info!("Update endpoint: GET /update?domains=..&token=..[&ip=..] or /update/{{domains}}/{{token}}/{{ip?}}");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}
