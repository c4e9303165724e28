//! Dashboard server using Axum.

use std::net::SocketAddr;
use std::sync::Arc;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::router::create_app_router;
use crate::agent::Agent;
use crate::config::DashboardSettings;
use crate::error::{Error, Result};

const MAX_CONCURRENT_REQUESTS: usize = 64;

/// Serve the agent's flow graph and state until the task is dropped.
pub async fn run_dashboard(settings: &DashboardSettings, agent: Arc<Agent>) -> Result<()> {
    let app = create_app_router(agent)
        .layer(ConcurrencyLimitLayer::new(MAX_CONCURRENT_REQUESTS))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let addr: SocketAddr = format!("{}:{}", settings.host, settings.port)
        .parse()
        .map_err(|e| Error::Config(format!("Invalid dashboard address: {}", e)))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Dashboard on http://{}", listener.local_addr()?);

    axum::serve(listener, app).await?;

    Ok(())
}
