pub mod cache;
pub mod orchestrator;
pub mod ports;
pub mod provisioner;
pub mod resolver;
pub mod tracker;
pub mod types;

// Re-export the hook-facing types for convenience
pub use orchestrator::HookHandler;
pub use orchestrator::Orchestrator;
