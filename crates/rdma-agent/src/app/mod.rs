//! Application module
//!
//! Wiring of the daemon: the builder assembles the collaborators from the
//! daemon arguments, the task runner drives the background work until a
//! shutdown signal arrives.

pub mod builder;
pub mod core;
pub mod services;
pub mod tasks;

pub use builder::ApplicationBuilder;
pub use core::Application;
pub use services::ApplicationServices;
