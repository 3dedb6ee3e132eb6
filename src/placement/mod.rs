//! Placement of new nodes across availability zones
//!
//! New nodes go to the availability zone hosting the fewest nodes of the
//! cluster, then to a backend in that zone that does not host one yet. The
//! ranking is deterministic: ties are broken by zone name, then by backend
//! configuration order.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

use tracing::{debug, warn};

use crate::backend::{Backends, SharedBackend};
use crate::cluster::ClusterId;
use crate::store::StateStore;

// ============================================================================
// SBIO: Pure functions (no I/O)
// ============================================================================

/// Order zones by how many of the cluster's nodes they host, ascending.
///
/// `usage` maps a zone to its node count; zones absent from it count as
/// unused.
pub fn rank_azs(azs: &[String], usage: &BTreeMap<String, usize>) -> Vec<String> {
    let mut ranked: Vec<(String, usize)> = azs
        .iter()
        .map(|az| (az.clone(), usage.get(az).copied().unwrap_or(0)))
        .collect();
    ranked.sort_by(compare_az_usage);
    ranked.into_iter().map(|(az, _)| az).collect()
}

fn compare_az_usage(a: &(String, usize), b: &(String, usize)) -> Ordering {
    a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0))
}

/// Pick a backend for a new node.
///
/// Zones are tried in `ranked_azs` order. Within a zone the first candidate
/// not in `used` wins, otherwise the first candidate of the zone.
pub fn choose_backend(
    candidates: &[SharedBackend],
    ranked_azs: &[String],
    used: &HashSet<String>,
) -> Option<SharedBackend> {
    for az in ranked_azs {
        let in_az: Vec<&SharedBackend> = candidates
            .iter()
            .filter(|b| b.availability_zone() == az)
            .collect();
        if let Some(unused) = in_az.iter().find(|b| !used.contains(b.guid())) {
            return Some((*unused).clone());
        }
        if let Some(first) = in_az.first() {
            return Some((*first).clone());
        }
    }
    None
}

// ============================================================================
// SBIO: I/O wrapper
// ============================================================================

#[derive(Clone)]
pub struct Planner {
    state_store: StateStore,
    backends: Backends,
}

impl Planner {
    pub fn new(state_store: StateStore, backends: Backends) -> Self {
        Self {
            state_store,
            backends,
        }
    }

    pub fn all_backends(&self) -> &[SharedBackend] {
        self.backends.all()
    }

    pub fn all_azs(&self) -> Vec<String> {
        self.backends.azs()
    }

    /// Backends hosting a node of the cluster, per the recorded node links.
    ///
    /// A store failure is treated as "nothing used yet".
    pub async fn used_backend_guids(&self, id: &ClusterId) -> Vec<String> {
        match self.state_store.node_links(id).await {
            Ok(links) => links.into_iter().map(|l| l.backend_guid).collect(),
            Err(e) => {
                warn!("Could not read node records of {}: {}", id, e);
                Vec::new()
            }
        }
    }

    /// Zones ordered by how many of the cluster's nodes they host
    pub async fn rank_azs_by_unusedness(&self, id: &ClusterId) -> Vec<String> {
        let mut usage: BTreeMap<String, usize> = BTreeMap::new();
        for guid in self.used_backend_guids(id).await {
            match self.backends.az_of(&guid) {
                Some(az) => *usage.entry(az).or_insert(0) += 1,
                None => debug!("Node of {} sits on unconfigured backend {}", id, guid),
            }
        }
        rank_azs(&self.all_azs(), &usage)
    }

    /// Choose the backend for the next node of the cluster.
    ///
    /// `cells` restricts the candidates to those GUIDs when non-empty.
    pub async fn select_backend(&self, id: &ClusterId, cells: &[String]) -> Option<SharedBackend> {
        let candidates: Vec<SharedBackend> = self
            .backends
            .all()
            .iter()
            .filter(|b| cells.is_empty() || cells.iter().any(|c| c == b.guid()))
            .cloned()
            .collect();

        let used: HashSet<String> = self.used_backend_guids(id).await.into_iter().collect();
        let ranked = self.rank_azs_by_unusedness(id).await;
        let chosen = choose_backend(&candidates, &ranked, &used);

        if let Some(backend) = &chosen {
            debug!(
                "Placing next node of {} on {} ({})",
                id,
                backend.guid(),
                backend.availability_zone()
            );
        }
        chosen
    }
}
