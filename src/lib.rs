//! Survey response collection with live dashboard updates.
//!
//! Responses are stored append-only; aggregates are projected from the
//! stored responses on every request; connected dashboards hear about every
//! new response over SSE or WebSocket and refetch.

pub mod config;
pub mod dashboard;
pub mod error;
pub mod models;
pub mod notifier;
pub mod projections;
pub mod realtime;
pub mod routes;
pub mod state;
pub mod store;


use std::future::Future;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;

pub use config::Config;
pub use routes::router;
pub use state::AppState;

/// Bind and serve until `shutdown` resolves.
pub async fn serve<F>(state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let address = state.config.address();
    info!("Binding to {address}");

    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("binding {address}"))?;
    info!("Server listening on http://{address}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("server error")?;

    info!("Server shut down");
    Ok(())
}
