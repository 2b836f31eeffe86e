//! PII Gateway - Main Entry Point

use anyhow::Context;
use pii_gateway::{initial_bundle, spawn_background, AppState, ServiceConfig};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("PII Gateway v{}", env!("CARGO_PKG_VERSION"));

    let config = ServiceConfig::from_env();
    let state = Arc::new(AppState::new(config));

    // Initial bundle; the service starts unready (passthrough + audit) if it fails
    match initial_bundle(&state.config).await {
        Ok(Some(bundle)) => {
            if let Err(e) = state.reloader.apply(bundle).await {
                tracing::warn!(error = %e, "initial rule bundle rejected");
            }
        }
        Ok(None) => tracing::warn!("no rule bundle configured, starting unready"),
        Err(e) => tracing::warn!(error = %e, "initial rule bundle not loaded"),
    }

    let _tasks = spawn_background(&state);

    pii_gateway::serve(state).await.context("gateway server failed")?;

    Ok(())
}
