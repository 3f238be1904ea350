pub mod api;
pub mod app;
pub mod config;
pub mod domain;
pub mod infrastructure;

#[cfg(any(test, feature = "testing"))]
#[doc(hidden)]
pub mod testing;

pub use domain::orchestrator;
pub use domain::provisioner;
pub use domain::tracker;
pub use infrastructure::k8s;
pub use infrastructure::kube_client;
pub use infrastructure::logging;
