//! Kubernetes integration module.
//!
//! This module reads the node's RDMA inventory and network configs from the cluster
//! API and keeps the claim index of the affinity cache current.
//!
//! The main components are:
//! - [`KubeInventoryApi`]: inventory and network-config lookups
//! - [`ClaimWatcher`]: watches resource claims reserved for pods

use core::error::Error;

pub mod claim_watcher;
pub mod inventory;
pub mod resources;

pub use claim_watcher::ClaimWatcher;
pub use inventory::KubeInventoryApi;

/// Errors that can occur during Kubernetes operations.
#[derive(Debug, derive_more::Display)]
pub enum KubernetesError {
    #[display("Failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
    #[display("Failed to watch {resource}: {message}")]
    WatchFailed { resource: String, message: String },
    #[display("Request for {resource} failed: {message}")]
    RequestFailed { resource: String, message: String },
    #[display("Request for {resource} timed out")]
    Timeout { resource: String },
    #[display("Malformed {resource}: {message}")]
    InvalidObject { resource: String, message: String },
}

impl Error for KubernetesError {}
