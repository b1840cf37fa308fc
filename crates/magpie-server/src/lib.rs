use std::net::SocketAddr;
use std::time::Duration;

use magpie_core::Services;
use magpie_queue::JobQueue;

mod error;
mod http;
mod render;
mod service;
mod ws;

pub use error::ApiError;
pub use http::app_router;
pub use service::{RateLimiter, SessionService, SubmitReceipt};

#[derive(Clone)]
pub struct AppState {
    pub services: Services,
    pub queue: JobQueue,
    pub session_service: SessionService,
}

impl AppState {
    pub fn new(services: Services, queue: JobQueue) -> Self {
        let session_service = SessionService::new(services.clone(), queue.clone());
        Self {
            services,
            queue,
            session_service,
        }
    }
}

/// Serve the REST + WebSocket surface until ctrl-c. Also owns the
/// scratchpad janitor, which evicts research data of long-terminal
/// sessions (grace period one hour).
pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let janitor_store = state.services.store.clone();
    let janitor = tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(15 * 60)).await;
            match janitor_store
                .purge_research_data(chrono::Duration::hours(1))
                .await
            {
                Ok(0) => {}
                Ok(removed) => tracing::info!(removed, "purged stale research data"),
                Err(err) => tracing::warn!("research data purge failed: {err}"),
            }
        }
    });

    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("listening on http://{addr}");
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await;
    janitor.abort();
    result?;
    Ok(())
}
