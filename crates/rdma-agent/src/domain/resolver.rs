//! Matches allocated accelerators to RDMA capable network functions
//!
//! Greedy maximum coverage: repeatedly pick the eligible function covering the most
//! still-unserved accelerators, first listed function winning ties, until every
//! accelerator is served or nothing covers the rest.

use std::collections::BTreeSet;

use tracing::debug;

use super::types::DeviceInventoryEntry;
use super::types::MatchResult;

/// Returns the functions that together cover `requested`.
///
/// Accelerators no eligible function is wired to are left uncovered; that is not an
/// error, the result simply does not serve them.
pub fn resolve(requested: &BTreeSet<String>, inventory: &[DeviceInventoryEntry]) -> MatchResult {
    let mut result = MatchResult::new();
    if requested.is_empty() || inventory.is_empty() {
        return result;
    }

    let mut remaining = requested.clone();
    let mut selected = vec![false; inventory.len()];

    while !remaining.is_empty() {
        let mut best: Option<(usize, usize)> = None;

        for (idx, device) in inventory.iter().enumerate() {
            if selected[idx] || !device.is_eligible() || result.contains_key(&device.name) {
                continue;
            }
            let coverage = device.affinity.intersection(&remaining).count();
            // strict comparison keeps the earliest device on ties
            if coverage > 0 && best.is_none_or(|(_, top)| coverage > top) {
                best = Some((idx, coverage));
            }
        }

        let Some((idx, coverage)) = best else {
            break;
        };

        let device = &inventory[idx];
        selected[idx] = true;
        remaining.retain(|accelerator| !device.affinity.contains(accelerator));
        result.insert(device.name.clone(), device.network_configs.clone());

        debug!(
            device = %device.name,
            coverage,
            remaining = remaining.len(),
            "selected network function"
        );
    }

    result
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::domain::types::LinkState;

    fn device(name: &str, affinity: &[&str]) -> DeviceInventoryEntry {
        DeviceInventoryEntry {
            name: name.to_string(),
            if_name: format!("{name}-if"),
            pci_address: String::new(),
            state: LinkState::Up,
            rdma: true,
            network_configs: format!("cfg{name}"),
            affinity: affinity.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn expected(pairs: &[(&str, &str)]) -> MatchResult {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_inputs_give_empty_result() {
        let inventory = vec![device("A", &["G1"])];
        assert!(resolve(&set(&[]), &inventory).is_empty());
        assert!(resolve(&set(&["G1"]), &[]).is_empty());
    }

    #[test]
    fn ineligible_devices_are_never_selected() {
        let mut no_rdma = device("A", &["G1", "G2"]);
        no_rdma.rdma = false;
        let mut down = device("B", &["G1", "G2"]);
        down.state = LinkState::Down;
        let mut no_config = device("C", &["G1", "G2"]);
        no_config.network_configs = String::new();

        let result = resolve(&set(&["G1", "G2"]), &[no_rdma, down, no_config]);
        assert!(result.is_empty());
    }

    #[test]
    fn first_listed_device_wins_ties() {
        let inventory = vec![device("A", &["G1"]), device("B", &["G1"])];
        assert_eq!(
            resolve(&set(&["G1"]), &inventory),
            expected(&[("A", "cfgA")])
        );
    }

    #[test]
    fn maximum_coverage_beats_partial_union() {
        let inventory = vec![
            device("A", &["G1"]),
            device("B", &["G1", "G2"]),
            device("C", &["G2"]),
        ];
        assert_eq!(
            resolve(&set(&["G1", "G2"]), &inventory),
            expected(&[("B", "cfgB")])
        );
    }

    #[test]
    fn greedy_remainder_is_covered() {
        let inventory = vec![
            device("A", &["G1"]),
            device("B", &["G1", "G2"]),
            device("C", &["G2"]),
            device("D", &["G3"]),
        ];
        assert_eq!(
            resolve(&set(&["G1", "G2", "G3"]), &inventory),
            expected(&[("B", "cfgB"), ("D", "cfgD")])
        );
    }

    #[test]
    fn disjoint_devices_cover_everything() {
        let inventory = vec![
            device("A", &["G1"]),
            device("B", &["G2"]),
            device("C", &["G9"]),
        ];
        assert_eq!(
            resolve(&set(&["G1", "G2"]), &inventory),
            expected(&[("A", "cfgA"), ("B", "cfgB")])
        );
    }

    #[test]
    fn no_overlap_is_not_an_error() {
        let inventory = vec![device("A", &["G7"]), device("B", &["G8"])];
        assert!(resolve(&set(&["G1"]), &inventory).is_empty());
    }

    #[test]
    fn shared_config_names_are_not_deduplicated() {
        let mut a = device("A", &["G1"]);
        let mut b = device("B", &["G2"]);
        a.network_configs = "shared".to_string();
        b.network_configs = "shared".to_string();

        let result = resolve(&set(&["G1", "G2"]), &[a, b]);
        assert_eq!(result, expected(&[("A", "shared"), ("B", "shared")]));
    }

    #[test]
    fn duplicate_names_are_selected_once() {
        let inventory = vec![device("A", &["G1"]), device("A", &["G2"])];
        let result = resolve(&set(&["G1", "G2"]), &inventory);
        assert_eq!(result, expected(&[("A", "cfgA")]));
    }

    #[test]
    fn subsets_of_served_accelerators_are_skipped() {
        let inventory = vec![
            device("wide", &["G1", "G2", "G3"]),
            device("narrow", &["G2"]),
            device("tail", &["G4"]),
        ];
        let result = resolve(&set(&["G1", "G2", "G3", "G4"]), &inventory);
        assert_eq!(result, expected(&[("tail", "cfgtail"), ("wide", "cfgwide")]));
    }
}
