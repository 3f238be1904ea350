//! Affinity cache
//!
//! Bounded-staleness store in front of the cluster API. Every category is a
//! `key -> (value, stored_at)` map; staleness is checked when reading against the
//! caller's max age, nothing is evicted in the background.
//!
//! | category | key |
//! | --- | --- |
//! | device inventory | node name |
//! | network-config body | `namespace/name` |
//! | rendered network config | `namespace/name@deviceID` |
//! | resource claim | `namespace/name` |
//! | network status | `namespace/name` of the pod |
//! | pod-resources snapshot | socket path |
//!
//! All state sits behind one read/write lock which is never held across I/O.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;
use std::time::Duration;
use std::time::Instant;

use error_stack::Report;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::ports::ExternalError;
use super::ports::InventoryApi;
use super::types::DeviceInventoryEntry;
use super::types::NetworkConfigRef;
use super::types::NetworkStatus;

/// Minimum time between two inventory refreshes of the same node
pub const DEFAULT_WARMUP_INTERVAL: Duration = Duration::from_secs(10);

/// Consumer a claim is reserved for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimConsumer {
    pub uid: String,
    pub name: String,
}

/// Device allocated to a claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimDevice {
    pub driver: String,
    pub pool: String,
    pub device: String,
}

/// The parts of a resource claim the agent needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRecord {
    pub namespace: String,
    pub name: String,
    pub reserved_for: Vec<ClaimConsumer>,
    pub devices: Vec<ClaimDevice>,
}

impl ClaimRecord {
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    fn pod_name_keys(&self) -> impl Iterator<Item = String> + '_ {
        self.reserved_for
            .iter()
            .map(|consumer| format!("{}/{}", self.namespace, consumer.name))
    }
}

/// Devices the kubelet reports for one pod
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodDevices {
    pub namespace: String,
    pub name: String,
    /// resource name -> device ids, across all containers
    pub devices: HashMap<String, Vec<String>>,
}

/// Snapshot of the kubelet pod-resources listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodResourcesSnapshot {
    pub pods: Vec<PodDevices>,
}

#[derive(Debug, Clone)]
struct Entry<T> {
    value: T,
    stored_at: Instant,
}

impl<T: Clone> Entry<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            stored_at: Instant::now(),
        }
    }

    /// `max_age` of zero disables the staleness check
    fn fresh(&self, max_age: Duration) -> Option<T> {
        if !max_age.is_zero() && self.stored_at.elapsed() > max_age {
            return None;
        }
        Some(self.value.clone())
    }
}

fn read_entry<T: Clone>(
    map: &HashMap<String, Entry<T>>,
    key: &str,
    max_age: Duration,
) -> Option<T> {
    map.get(key).and_then(|entry| entry.fresh(max_age))
}

#[derive(Default)]
struct CacheState {
    inventories: HashMap<String, Entry<Arc<Vec<DeviceInventoryEntry>>>>,
    config_bodies: HashMap<String, Entry<String>>,
    rendered_configs: HashMap<String, Entry<serde_json::Value>>,
    claims: HashMap<String, Entry<ClaimRecord>>,
    claims_by_pod_uid: HashMap<String, BTreeSet<String>>,
    claims_by_pod_name: HashMap<String, BTreeSet<String>>,
    network_statuses: HashMap<String, Entry<Vec<NetworkStatus>>>,
    pod_resources: HashMap<String, Entry<Arc<PodResourcesSnapshot>>>,
    last_warmup: HashMap<String, Instant>,
}

impl CacheState {
    fn unindex_claim(&mut self, key: &str) -> Option<ClaimRecord> {
        let previous = self.claims.remove(key)?.value;
        for consumer in &previous.reserved_for {
            remove_index_entry(&mut self.claims_by_pod_uid, &consumer.uid, key);
        }
        for pod_key in previous.pod_name_keys() {
            remove_index_entry(&mut self.claims_by_pod_name, &pod_key, key);
        }
        Some(previous)
    }
}

fn remove_index_entry(index: &mut HashMap<String, BTreeSet<String>>, index_key: &str, key: &str) {
    if let Some(keys) = index.get_mut(index_key) {
        keys.remove(key);
        if keys.is_empty() {
            index.remove(index_key);
        }
    }
}

/// Multi-index, per-key TTL cache of cluster state used on the hook path
pub struct AffinityCache {
    state: RwLock<CacheState>,
    api: Arc<dyn InventoryApi>,
    warmup_interval: Duration,
}

impl AffinityCache {
    pub fn new(api: Arc<dyn InventoryApi>) -> Self {
        Self::with_warmup_interval(api, DEFAULT_WARMUP_INTERVAL)
    }

    pub fn with_warmup_interval(api: Arc<dyn InventoryApi>, warmup_interval: Duration) -> Self {
        Self {
            state: RwLock::new(CacheState::default()),
            api,
            warmup_interval,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get_inventory(
        &self,
        node: &str,
        max_age: Duration,
    ) -> Option<Arc<Vec<DeviceInventoryEntry>>> {
        read_entry(&self.read().inventories, node, max_age)
    }

    pub fn set_inventory(&self, node: &str, inventory: Vec<DeviceInventoryEntry>) {
        self.write()
            .inventories
            .insert(node.to_string(), Entry::new(Arc::new(inventory)));
    }

    pub fn get_config_body(&self, key: &str, max_age: Duration) -> Option<String> {
        read_entry(&self.read().config_bodies, key, max_age)
    }

    pub fn set_config_body(&self, key: &str, body: String) {
        self.write()
            .config_bodies
            .insert(key.to_string(), Entry::new(body));
    }

    pub fn get_rendered_config(&self, key: &str, max_age: Duration) -> Option<serde_json::Value> {
        read_entry(&self.read().rendered_configs, key, max_age)
    }

    pub fn set_rendered_config(&self, key: &str, config: serde_json::Value) {
        self.write()
            .rendered_configs
            .insert(key.to_string(), Entry::new(config));
    }

    pub fn get_network_status(&self, pod_key: &str, max_age: Duration) -> Option<Vec<NetworkStatus>> {
        read_entry(&self.read().network_statuses, pod_key, max_age)
    }

    pub fn set_network_status(&self, pod_key: &str, statuses: Vec<NetworkStatus>) {
        self.write()
            .network_statuses
            .insert(pod_key.to_string(), Entry::new(statuses));
    }

    pub fn remove_network_status(&self, pod_key: &str) {
        self.write().network_statuses.remove(pod_key);
    }

    pub fn get_pod_resources(&self, key: &str, max_age: Duration) -> Option<Arc<PodResourcesSnapshot>> {
        read_entry(&self.read().pod_resources, key, max_age)
    }

    pub fn set_pod_resources(&self, key: &str, snapshot: PodResourcesSnapshot) {
        self.write()
            .pod_resources
            .insert(key.to_string(), Entry::new(Arc::new(snapshot)));
    }

    pub fn get_claim(&self, key: &str, max_age: Duration) -> Option<ClaimRecord> {
        read_entry(&self.read().claims, key, max_age)
    }

    /// Stores a claim and replaces everything the previous value of the key indexed.
    pub fn insert_claim(&self, claim: ClaimRecord) {
        let key = claim.key();
        let mut state = self.write();
        state.unindex_claim(&key);

        for consumer in &claim.reserved_for {
            state
                .claims_by_pod_uid
                .entry(consumer.uid.clone())
                .or_default()
                .insert(key.clone());
        }
        for pod_key in claim.pod_name_keys() {
            state
                .claims_by_pod_name
                .entry(pod_key)
                .or_default()
                .insert(key.clone());
        }
        state.claims.insert(key, Entry::new(claim));
    }

    /// Replaces every cached claim, used when a claim listing restarts
    pub fn replace_claims(&self, claims: Vec<ClaimRecord>) {
        {
            let mut state = self.write();
            state.claims.clear();
            state.claims_by_pod_uid.clear();
            state.claims_by_pod_name.clear();
        }
        for claim in claims {
            self.insert_claim(claim);
        }
    }

    /// Removes a claim and its index entries
    pub fn delete_claim(&self, key: &str) -> Option<ClaimRecord> {
        self.write().unindex_claim(key)
    }

    /// Removes every claim reserved for the pod UID
    pub fn delete_claims_for_pod_uid(&self, pod_uid: &str) -> Vec<ClaimRecord> {
        let mut state = self.write();
        let keys = state.claims_by_pod_uid.get(pod_uid).cloned().unwrap_or_default();
        keys.iter()
            .filter_map(|key| state.unindex_claim(key))
            .collect()
    }

    /// Removes every claim reserved for the pod `namespace/name`
    pub fn delete_claims_for_pod_name(&self, pod_key: &str) -> Vec<ClaimRecord> {
        let mut state = self.write();
        let keys = state.claims_by_pod_name.get(pod_key).cloned().unwrap_or_default();
        keys.iter()
            .filter_map(|key| state.unindex_claim(key))
            .collect()
    }

    pub fn claims_for_pod_uid(&self, pod_uid: &str) -> Vec<ClaimRecord> {
        let state = self.read();
        Self::collect_claims(&state, state.claims_by_pod_uid.get(pod_uid))
    }

    pub fn claims_for_pod_name(&self, pod_key: &str) -> Vec<ClaimRecord> {
        let state = self.read();
        Self::collect_claims(&state, state.claims_by_pod_name.get(pod_key))
    }

    fn collect_claims(state: &CacheState, keys: Option<&BTreeSet<String>>) -> Vec<ClaimRecord> {
        keys.into_iter()
            .flatten()
            .filter_map(|key| state.claims.get(key))
            .map(|entry| entry.value.clone())
            .collect()
    }

    /// Refreshes the node inventory and the namespaced network configs it references.
    ///
    /// Returns `Ok(false)` without any API call while the node is in its cool-down
    /// window. Config bodies that fail to load are left to the on-demand path.
    #[tracing::instrument(skip(self))]
    pub async fn warmup_node(&self, node: &str) -> Result<bool, Report<ExternalError>> {
        {
            let mut state = self.write();
            if let Some(last) = state.last_warmup.get(node) {
                if last.elapsed() < self.warmup_interval {
                    debug!("warmup skipped, node in cool-down");
                    return Ok(false);
                }
            }
            state.last_warmup.insert(node.to_string(), Instant::now());
        }

        let inventory = self.api.list_device_inventory(node).await?;

        let config_refs: BTreeSet<NetworkConfigRef> = inventory
            .iter()
            .flat_map(|entry| entry.network_config_names())
            .filter(|name| name.contains('/'))
            .map(|name| NetworkConfigRef::parse(name, ""))
            .collect();

        let mut bodies = Vec::with_capacity(config_refs.len());
        for config in &config_refs {
            match self
                .api
                .get_network_config_template(&config.namespace, &config.name)
                .await
            {
                Ok(body) => bodies.push((config.key(), body)),
                Err(e) => warn!(config = %config, "failed to prefetch network config: {e:?}"),
            }
        }

        info!(
            devices = inventory.len(),
            configs = bodies.len(),
            "node inventory refreshed"
        );

        let mut state = self.write();
        state
            .inventories
            .insert(node.to_string(), Entry::new(Arc::new(inventory)));
        for (key, body) in bodies {
            state.config_bodies.insert(key, Entry::new(body));
        }
        Ok(true)
    }

    /// Cached inventory no older than `max_age`, refreshed through a warmup otherwise.
    ///
    /// While the node is in cool-down an older cached inventory is served; only when
    /// nothing was ever cached the API is queried directly.
    pub async fn inventory_or_refresh(
        &self,
        node: &str,
        max_age: Duration,
    ) -> Result<Arc<Vec<DeviceInventoryEntry>>, Report<ExternalError>> {
        if let Some(inventory) = self.get_inventory(node, max_age) {
            return Ok(inventory);
        }

        self.warmup_node(node).await?;
        if let Some(inventory) = self.get_inventory(node, Duration::ZERO) {
            return Ok(inventory);
        }

        let inventory = self.api.list_device_inventory(node).await?;
        self.set_inventory(node, inventory);
        self.get_inventory(node, Duration::ZERO)
            .ok_or_else(|| Report::new(ExternalError::Inventory { node: node.to_string() }))
    }

    /// Cached network-config body, fetched from the API on a miss
    pub async fn config_body_or_fetch(
        &self,
        config: &NetworkConfigRef,
        max_age: Duration,
    ) -> Result<String, Report<ExternalError>> {
        let key = config.key();
        if let Some(body) = self.get_config_body(&key, max_age) {
            return Ok(body);
        }

        let body = self
            .api
            .get_network_config_template(&config.namespace, &config.name)
            .await?;
        self.set_config_body(&key, body.clone());
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::testing::inventory_entry;
    use crate::testing::FakeInventoryApi;

    fn cache_with(api: Arc<FakeInventoryApi>, interval: Duration) -> AffinityCache {
        AffinityCache::with_warmup_interval(api, interval)
    }

    fn claim(name: &str, consumers: &[(&str, &str)]) -> ClaimRecord {
        ClaimRecord {
            namespace: "ml".to_string(),
            name: name.to_string(),
            reserved_for: consumers
                .iter()
                .map(|(uid, pod)| ClaimConsumer {
                    uid: uid.to_string(),
                    name: pod.to_string(),
                })
                .collect(),
            devices: vec![],
        }
    }

    #[test]
    fn zero_max_age_never_expires() {
        let cache = cache_with(Arc::new(FakeInventoryApi::default()), DEFAULT_WARMUP_INTERVAL);
        cache.set_config_body("ml/rdma", "{}".to_string());
        assert_eq!(
            cache.get_config_body("ml/rdma", Duration::ZERO).as_deref(),
            Some("{}")
        );
    }

    #[test]
    fn stale_entries_are_not_returned() {
        let cache = cache_with(Arc::new(FakeInventoryApi::default()), DEFAULT_WARMUP_INTERVAL);
        cache.set_config_body("ml/rdma", "{}".to_string());
        std::thread::sleep(Duration::from_millis(2));

        assert!(cache.get_config_body("ml/rdma", Duration::from_nanos(1)).is_none());
        assert!(cache.get_config_body("ml/rdma", Duration::from_secs(60)).is_some());
        assert!(cache.get_config_body("ml/other", Duration::ZERO).is_none());
    }

    #[test]
    fn set_overwrites_previous_value() {
        let cache = cache_with(Arc::new(FakeInventoryApi::default()), DEFAULT_WARMUP_INTERVAL);
        cache.set_network_status("ml/p", vec![]);
        cache.set_network_status(
            "ml/p",
            vec![NetworkStatus {
                name: "ml/rdma".to_string(),
                ..Default::default()
            }],
        );
        let statuses = cache.get_network_status("ml/p", Duration::ZERO).unwrap();
        assert_eq!(statuses.len(), 1);

        cache.remove_network_status("ml/p");
        assert!(cache.get_network_status("ml/p", Duration::ZERO).is_none());
    }

    #[test]
    fn claim_indices_follow_inserts_and_deletes() {
        let cache = cache_with(Arc::new(FakeInventoryApi::default()), DEFAULT_WARMUP_INTERVAL);
        cache.insert_claim(claim("gpu-claim", &[("uid-1", "trainer-0")]));

        assert_eq!(cache.claims_for_pod_uid("uid-1").len(), 1);
        assert_eq!(cache.claims_for_pod_name("ml/trainer-0").len(), 1);

        // a new value for the key replaces the old index contribution
        cache.insert_claim(claim("gpu-claim", &[("uid-2", "trainer-1")]));
        assert!(cache.claims_for_pod_uid("uid-1").is_empty());
        assert!(cache.claims_for_pod_name("ml/trainer-0").is_empty());
        assert_eq!(cache.claims_for_pod_uid("uid-2").len(), 1);

        let removed = cache.delete_claims_for_pod_name("ml/trainer-1");
        assert_eq!(removed.len(), 1);
        assert!(cache.claims_for_pod_uid("uid-2").is_empty());
        assert!(cache.get_claim("ml/gpu-claim", Duration::ZERO).is_none());
    }

    #[test]
    fn replacing_claims_drops_missing_ones() {
        let cache = cache_with(Arc::new(FakeInventoryApi::default()), DEFAULT_WARMUP_INTERVAL);
        cache.insert_claim(claim("old", &[("uid-1", "p")]));

        cache.replace_claims(vec![claim("new", &[("uid-2", "q")])]);
        assert!(cache.claims_for_pod_uid("uid-1").is_empty());
        assert!(cache.get_claim("ml/old", Duration::ZERO).is_none());
        assert_eq!(cache.claims_for_pod_name("ml/q").len(), 1);
    }

    #[test]
    fn deleting_by_uid_cleans_name_index() {
        let cache = cache_with(Arc::new(FakeInventoryApi::default()), DEFAULT_WARMUP_INTERVAL);
        cache.insert_claim(claim("a", &[("uid-1", "p")]));
        cache.insert_claim(claim("b", &[("uid-1", "p")]));

        let removed = cache.delete_claims_for_pod_uid("uid-1");
        assert_eq!(removed.len(), 2);
        assert!(cache.claims_for_pod_name("ml/p").is_empty());
        assert!(cache.delete_claim("ml/a").is_none());
    }

    #[tokio::test]
    async fn warmup_is_rate_limited_per_node() {
        let api = Arc::new(FakeInventoryApi::default());
        api.set_inventory("node-a", vec![inventory_entry("pf0", &["0000:1a:00.0"], "infra/rdma")]);
        api.set_config("infra", "rdma", r#"{"type":"sriov"}"#);
        let cache = cache_with(api.clone(), Duration::from_secs(10));

        assert!(cache.warmup_node("node-a").await.unwrap());
        assert!(!cache.warmup_node("node-a").await.unwrap());
        assert!(cache.warmup_node("node-b").await.unwrap());

        assert_eq!(api.inventory_calls("node-a"), 1);
        assert_eq!(api.inventory_calls("node-b"), 1);
        assert_eq!(
            cache.get_config_body("infra/rdma", Duration::ZERO).as_deref(),
            Some(r#"{"type":"sriov"}"#)
        );
    }

    #[tokio::test]
    async fn inventory_served_from_cache_until_stale() {
        let api = Arc::new(FakeInventoryApi::default());
        api.set_inventory("node-a", vec![inventory_entry("pf0", &["0000:1a:00.0"], "rdma")]);
        let cache = cache_with(api.clone(), Duration::ZERO);

        let first = cache
            .inventory_or_refresh("node-a", Duration::from_secs(60))
            .await
            .unwrap();
        let second = cache
            .inventory_or_refresh("node-a", Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(first.len(), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(api.inventory_calls("node-a"), 1);
    }

    #[tokio::test]
    async fn config_body_fetched_once() {
        let api = Arc::new(FakeInventoryApi::default());
        api.set_config("ml", "rdma", "{}");
        let cache = cache_with(api.clone(), DEFAULT_WARMUP_INTERVAL);
        let config = NetworkConfigRef::parse("ml/rdma", "default");

        cache.config_body_or_fetch(&config, Duration::ZERO).await.unwrap();
        cache.config_body_or_fetch(&config, Duration::ZERO).await.unwrap();
        assert_eq!(api.config_calls(), 1);

        let missing = NetworkConfigRef::parse("ml/missing", "default");
        assert!(cache.config_body_or_fetch(&missing, Duration::ZERO).await.is_err());
    }
}
