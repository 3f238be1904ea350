//! Keeps the claim index of the affinity cache in sync with the cluster's resource claims

use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use futures::StreamExt;
use kube::runtime::watcher;
use kube::runtime::watcher::Config;
use kube::Api;
use kube::Client;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::resources::ResourceClaim;
use super::KubernetesError;
use crate::domain::cache::AffinityCache;

const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Applies one watch event to the cache
pub fn apply_claim_event(cache: &AffinityCache, event: watcher::Event<ResourceClaim>) {
    match event {
        watcher::Event::Applied(claim) => {
            if let Some(record) = claim.to_record() {
                debug!(claim = %record.key(), consumers = record.reserved_for.len(), "claim applied");
                cache.insert_claim(record);
            }
        }
        watcher::Event::Deleted(claim) => {
            if let Some(record) = claim.to_record() {
                debug!(claim = %record.key(), "claim deleted");
                cache.delete_claim(&record.key());
            }
        }
        watcher::Event::Restarted(claims) => {
            let records: Vec<_> = claims.iter().filter_map(ResourceClaim::to_record).collect();
            info!(claims = records.len(), "claim listing restarted");
            cache.replace_claims(records);
        }
    }
}

pub struct ClaimWatcher {
    client: Client,
    cache: Arc<AffinityCache>,
}

impl ClaimWatcher {
    pub fn new(client: Client, cache: Arc<AffinityCache>) -> Self {
        Self { client, cache }
    }

    /// Watches claims until cancelled, restarting the watch after failures
    #[tracing::instrument(skip_all)]
    pub async fn run(
        &self,
        cancellation_token: CancellationToken,
    ) -> Result<(), Report<KubernetesError>> {
        info!("Starting resource claim watcher");

        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("Resource claim watcher shutdown requested");
                    break;
                }
                result = self.watch_claims() => {
                    match result {
                        Ok(()) => warn!("Claim watch stream ended unexpectedly, restarting..."),
                        Err(e) => {
                            error!("Claim watch failed: {e:?}");
                            select! {
                                _ = cancellation_token.cancelled() => break,
                                _ = tokio::time::sleep(RETRY_DELAY) => {}
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn watch_claims(&self) -> Result<(), Report<KubernetesError>> {
        let api: Api<ResourceClaim> = Api::all(self.client.clone());
        let mut stream = watcher::watcher(api, Config::default()).boxed();

        while let Some(event) = stream.next().await {
            match event {
                Ok(event) => apply_claim_event(&self.cache, event),
                Err(e) => {
                    return Err(Report::new(KubernetesError::WatchFailed {
                        resource: "resourceclaims".to_string(),
                        message: e.to_string(),
                    }));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testing::FakeInventoryApi;

    fn claim(name: &str, pod_uid: &str, pod_name: &str) -> ResourceClaim {
        serde_json::from_value(json!({
            "metadata": {"name": name, "namespace": "ml"},
            "status": {
                "reservedFor": [{"resource": "pods", "name": pod_name, "uid": pod_uid}]
            }
        }))
        .expect("should parse resource claim")
    }

    #[test]
    fn test_events_maintain_claim_index() {
        let cache = AffinityCache::new(Arc::new(FakeInventoryApi::default()));

        apply_claim_event(&cache, watcher::Event::Applied(claim("a", "uid-1", "trainer")));
        assert_eq!(cache.claims_for_pod_uid("uid-1").len(), 1);

        apply_claim_event(&cache, watcher::Event::Deleted(claim("a", "uid-1", "trainer")));
        assert!(cache.claims_for_pod_uid("uid-1").is_empty());

        apply_claim_event(&cache, watcher::Event::Applied(claim("b", "uid-2", "server")));
        apply_claim_event(
            &cache,
            watcher::Event::Restarted(vec![claim("c", "uid-3", "worker")]),
        );
        assert!(cache.claims_for_pod_uid("uid-2").is_empty());
        assert_eq!(cache.claims_for_pod_name("ml/worker").len(), 1);
    }
}
