use std::sync::Arc;

use crate::domain::cache::AffinityCache;
use crate::domain::orchestrator::Orchestrator;
use crate::infrastructure::k8s::ClaimWatcher;

/// Application dependencies - simple struct with Arc-wrapped services
pub struct ApplicationServices {
    pub orchestrator: Arc<Orchestrator>,
    pub cache: Arc<AffinityCache>,
    /// Only present when accelerators are allocated through resource claims
    pub claim_watcher: Option<Arc<ClaimWatcher>>,
}
