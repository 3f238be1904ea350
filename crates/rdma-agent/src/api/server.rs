use std::sync::Arc;

use error_stack::Report;
use poem::get;
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::post;
use poem::Endpoint;
use poem::EndpointExt;
use poem::Route;
use poem::Server;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use super::errors::ApiError;
use super::handlers;
use crate::domain::orchestrator::Orchestrator;

/// Routes of the hook and query API
pub fn routes(orchestrator: Arc<Orchestrator>) -> impl Endpoint {
    Route::new()
        .at("/hooks/v1/run-pod-sandbox", post(handlers::run_pod_sandbox))
        .at("/hooks/v1/create-container", post(handlers::create_container))
        .at("/hooks/v1/stop-pod-sandbox", post(handlers::stop_pod_sandbox))
        .at("/hooks/v1/remove-pod-sandbox", post(handlers::remove_pod_sandbox))
        .at("/hooks/v1/synchronize", post(handlers::synchronize))
        .at("/hooks/v1/shutdown", post(handlers::shutdown))
        .at(
            "/api/v1/pods/:namespace/:name/network-status",
            get(handlers::get_network_status),
        )
        .at("/healthz", get(handlers::healthz))
        .data(orchestrator)
}

/// HTTP server the runtime-side shim forwards hooks to
pub struct ApiServer {
    orchestrator: Arc<Orchestrator>,
    listen_addr: String,
}

impl ApiServer {
    pub fn new(orchestrator: Arc<Orchestrator>, listen_addr: String) -> Self {
        Self {
            orchestrator,
            listen_addr,
        }
    }

    /// Start the API server
    ///
    /// # Errors
    ///
    /// - [`ApiError::ServerError`] if the server fails to start or bind to the address
    pub async fn run(self, cancellation_token: CancellationToken) -> Result<(), Report<ApiError>> {
        info!("Starting HTTP API server on {}", self.listen_addr);

        let app = routes(self.orchestrator).with(Tracing);
        let listener = TcpListener::bind(&self.listen_addr);
        let server = Server::new(listener);

        tokio::select! {
            result = server.run(app) => {
                match result {
                    Ok(()) => {
                        info!("API server stopped normally");
                        Ok(())
                    }
                    Err(e) => {
                        error!("API server failed: {e}");
                        Err(Report::new(ApiError::ServerError {
                            message: format!("Server failed: {e}"),
                        }))
                    }
                }
            }
            _ = cancellation_token.cancelled() => {
                info!("API server shutdown requested");
                Ok(())
            }
        }
    }
}
