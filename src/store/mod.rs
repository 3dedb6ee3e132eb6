//! Cluster state persistence
//!
//! Key layout under the shared store, rooted per instance:
//!
//! ```text
//! serviceinstances/<instance>/meta                   JSON ClusterState snapshot
//! serviceinstances/<instance>/plan_id                plan id (scalar)
//! serviceinstances/<instance>/nodes/<node>/backend   backend GUID (scalar)
//! routing/allocation/<instance>                      public port (router-owned)
//! ```
//!
//! One writer per instance is assumed. The store itself only guarantees
//! per-key read-after-write; `create_cluster` uses the store's atomic
//! set-if-absent so two brokers cannot both claim the same instance.

use thiserror::Error;
use tracing::{debug, warn};

use crate::cluster::{ClusterId, ClusterState, Node};
use crate::kv::{KvError, SharedKvStore};
use crate::router::allocation_key;

/// Root directory of all instance records
pub const INSTANCES_ROOT: &str = "serviceinstances";

pub fn instance_dir(id: &ClusterId) -> String {
    format!("{}/{}", INSTANCES_ROOT, id)
}

pub fn meta_key(id: &ClusterId) -> String {
    format!("{}/meta", instance_dir(id))
}

pub fn plan_key(id: &ClusterId) -> String {
    format!("{}/plan_id", instance_dir(id))
}

pub fn nodes_dir(id: &ClusterId) -> String {
    format!("{}/nodes", instance_dir(id))
}

pub fn node_backend_key(id: &ClusterId, node_id: &str) -> String {
    format!("{}/{}/backend", nodes_dir(id), node_id)
}

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Service instance {0} not found")]
    NotFound(ClusterId),

    #[error("Service instance {0} already exists")]
    AlreadyExists(ClusterId),

    #[error("Stored state for {0} is corrupt: {1}")]
    Corrupt(ClusterId, String),

    #[error("Store error: {0}")]
    Store(#[from] KvError),
}

/// A node id and the backend recorded for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLink {
    pub node_id: String,
    pub backend_guid: String,
}

#[derive(Clone)]
pub struct StateStore {
    kv: SharedKvStore,
}

impl StateStore {
    pub fn new(kv: SharedKvStore) -> Self {
        Self { kv }
    }

    pub fn kv(&self) -> &SharedKvStore {
        &self.kv
    }

    /// Read the persisted snapshot of an instance
    pub async fn load_cluster(&self, id: &ClusterId) -> Result<ClusterState, StateError> {
        let json = self.kv.get(&meta_key(id)).await.map_err(|e| match e {
            KvError::NotFound(_) => StateError::NotFound(id.clone()),
            other => StateError::Store(other),
        })?;
        ClusterState::from_json(&json).map_err(|e| StateError::Corrupt(id.clone(), e.to_string()))
    }

    /// Overwrite the persisted snapshot
    pub async fn save_cluster(&self, state: &ClusterState) -> Result<(), StateError> {
        let json = state
            .to_json()
            .map_err(|e| StateError::Corrupt(state.instance_id.clone(), e.to_string()))?;
        self.kv.set(&plan_key(&state.instance_id), &state.plan_id).await?;
        self.kv.set(&meta_key(&state.instance_id), &json).await?;
        debug!(
            "Saved state of {} ({} nodes, {})",
            state.instance_id,
            state.node_count(),
            state.scheduling_info.status
        );
        Ok(())
    }

    /// Persist the first snapshot of an instance, failing if one exists
    pub async fn create_cluster(&self, state: &ClusterState) -> Result<(), StateError> {
        let json = state
            .to_json()
            .map_err(|e| StateError::Corrupt(state.instance_id.clone(), e.to_string()))?;
        self.kv
            .create(&meta_key(&state.instance_id), &json)
            .await
            .map_err(|e| match e {
                KvError::AlreadyExists(_) => StateError::AlreadyExists(state.instance_id.clone()),
                other => StateError::Store(other),
            })?;
        self.kv.set(&plan_key(&state.instance_id), &state.plan_id).await?;
        Ok(())
    }

    /// Whether any record exists for the instance
    pub async fn cluster_exists(&self, id: &ClusterId) -> Result<bool, StateError> {
        Ok(self.kv.exists(&instance_dir(id)).await?)
    }

    /// Remove the snapshot, every node record and the port-allocation record
    pub async fn delete_cluster(&self, id: &ClusterId) -> Result<(), StateError> {
        ignore_missing(self.kv.delete_dir(&instance_dir(id)).await)?;
        ignore_missing(self.kv.delete(&allocation_key(id)).await)?;
        debug!("Deleted state of {}", id);
        Ok(())
    }

    /// Record which backend hosts `node`
    pub async fn record_node(&self, id: &ClusterId, node: &Node) -> Result<(), StateError> {
        self.kv
            .set(&node_backend_key(id, &node.id), &node.backend_id)
            .await?;
        Ok(())
    }

    /// Drop the record of a node; a missing record is not an error
    pub async fn forget_node(&self, id: &ClusterId, node_id: &str) -> Result<(), StateError> {
        let dir = format!("{}/{}", nodes_dir(id), node_id);
        ignore_missing(self.kv.delete_dir(&dir).await)?;
        Ok(())
    }

    /// Enumerate the instance's node records and their backends
    pub async fn node_links(&self, id: &ClusterId) -> Result<Vec<NodeLink>, StateError> {
        let entries = match self.kv.list(&nodes_dir(id)).await {
            Ok(entries) => entries,
            Err(KvError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut links = Vec::with_capacity(entries.len());
        for entry in entries {
            let node_id = entry.name().to_string();
            match self.kv.get(&node_backend_key(id, &node_id)).await {
                Ok(backend_guid) => links.push(NodeLink {
                    node_id,
                    backend_guid,
                }),
                Err(KvError::NotFound(_)) => {
                    warn!("Node {} of {} has no backend record", node_id, id);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(links)
    }
}

fn ignore_missing(result: Result<(), KvError>) -> Result<(), KvError> {
    match result {
        Err(KvError::NotFound(_)) => Ok(()),
        other => other,
    }
}
