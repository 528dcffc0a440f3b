//! Tollgate - payment-gated RPC gateway for AI services

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tollgate::{server, Args};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("tollgate={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Tollgate - payment-gated RPC gateway");
    info!("======================================");
    info!("Listen: {}", args.listen);
    info!(
        "Backend: {}",
        if args.passthrough_enabled {
            args.service_endpoint.as_str()
        } else {
            "loopback (passthrough disabled)"
        }
    );
    if let Some(training) = &args.training_endpoint {
        info!(
            "Training backend: {} ({} special methods)",
            training,
            args.special_methods.len()
        );
    }
    info!(
        "Rate limit: {}",
        if args.rate_limit_per_minute.is_empty() {
            "unlimited".to_string()
        } else {
            format!("{}/min (burst {})", args.rate_limit_per_minute, args.burst_size)
        }
    );
    info!(
        "Monitoring: {}",
        args.monitoring_endpoint.as_deref().unwrap_or("disabled")
    );
    info!("======================================");

    let state = Arc::new(server::AppState::new(args));

    if let Err(e) = server::run(state).await {
        error!("Server error: {:?}", e);
        std::process::exit(1);
    }

    Ok(())
}
