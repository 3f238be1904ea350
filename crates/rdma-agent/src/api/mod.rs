//! HTTP surface of the agent
//!
//! The runtime-side shim forwards container runtime callbacks as JSON; every hook
//! answers with a [`HookResponse`] envelope and a status code reflecting the
//! failure class.
//!
//! # API Endpoints
//!
//! - `POST /hooks/v1/run-pod-sandbox`
//! - `POST /hooks/v1/create-container` - returns the container adjustment
//! - `POST /hooks/v1/stop-pod-sandbox`
//! - `POST /hooks/v1/remove-pod-sandbox`
//! - `POST /hooks/v1/synchronize`
//! - `POST /hooks/v1/shutdown`
//! - `GET /api/v1/pods/:namespace/:name/network-status` - network status of a provisioned pod
//! - `GET /healthz`

pub use api_types::CreateContainerRequest;
pub use api_types::CreateContainerResponse;
pub use api_types::HookResponse;
pub use api_types::PodSandboxRequest;
pub use api_types::SynchronizeRequest;
pub use api_types::SynchronizeResponse;

pub mod errors;
pub mod handlers;
pub mod server;

pub use errors::ApiError;
pub use server::ApiServer;
