//! Member health aggregation
//!
//! Node supervisors publish one health record per member under
//! `service/<instance>/members/<node>` as JSON `{"role": ..., "state": ...}`.
//! This module folds those records into a one-line summary and decides
//! whether the cluster has converged (every member "running").

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterId, Role};
use crate::config::StatusConfig;
use crate::kv::{KvError, SharedKvStore};

/// State string of a healthy member
pub const RUNNING: &str = "running";

pub fn members_dir(id: &ClusterId) -> String {
    format!("service/{}/members", id)
}

pub fn members_key(id: &ClusterId, node_id: &str) -> String {
    format!("{}/{}", members_dir(id), node_id)
}

#[derive(Error, Debug)]
pub enum StatusError {
    #[error("member status missing for service instance {0}")]
    Missing(ClusterId),

    #[error("member status corrupt for service instance {0}: {1}")]
    Corrupt(ClusterId, String),

    #[error("Store error: {0}")]
    Store(#[from] KvError),

    #[error("Timed out after {waited:?} waiting for all members of {instance} to run (last: {last})")]
    Timeout {
        instance: ClusterId,
        waited: Duration,
        last: String,
    },

    #[error("Stopped waiting for members of {0}: cancelled")]
    Cancelled(ClusterId),
}

/// Health record published by a node supervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MemberRecord {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub state: String,
}

impl MemberRecord {
    pub fn is_primary(&self) -> bool {
        Role::from_member_role(&self.role) == Role::Primary
    }

    pub fn is_running(&self) -> bool {
        self.state == RUNNING
    }
}

/// Aggregated view of a cluster's members
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberStatus {
    pub summary: String,
    pub all_running: bool,
}

// ============================================================================
// SBIO: Pure functions (no I/O)
// ============================================================================

/// Fold member records into a summary.
///
/// The summary names the primary state first when a primary is present:
/// `master running; replicas running, starting`. Otherwise it lists all
/// members: `members running, starting`. `all_running` requires at least
/// one member.
pub fn summarize(records: &[MemberRecord]) -> MemberStatus {
    let mut primary_state: Option<&str> = None;
    let mut replica_states: Vec<&str> = Vec::new();

    for record in records {
        if record.is_primary() && primary_state.is_none() {
            primary_state = Some(record.state.as_str());
        } else {
            replica_states.push(record.state.as_str());
        }
    }

    let summary = match primary_state {
        Some(state) => format!("master {}; replicas {}", state, replica_states.join(", ")),
        None => format!("members {}", replica_states.join(", ")),
    };

    MemberStatus {
        summary,
        all_running: !records.is_empty() && records.iter().all(MemberRecord::is_running),
    }
}

// ============================================================================
// SBIO: I/O wrapper
// ============================================================================

#[derive(Clone)]
pub struct StatusAggregator {
    kv: SharedKvStore,
    config: StatusConfig,
}

impl StatusAggregator {
    pub fn new(kv: SharedKvStore, config: StatusConfig) -> Self {
        Self { kv, config }
    }

    pub fn config(&self) -> &StatusConfig {
        &self.config
    }

    /// Health records keyed by node id
    pub async fn member_records(
        &self,
        id: &ClusterId,
    ) -> Result<Vec<(String, MemberRecord)>, StatusError> {
        let entries = self.kv.list(&members_dir(id)).await.map_err(|e| match e {
            KvError::NotFound(_) => StatusError::Missing(id.clone()),
            other => StatusError::Store(other),
        })?;

        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(value) = entry.value.as_deref() else {
                continue;
            };
            let record: MemberRecord = serde_json::from_str(value)
                .map_err(|e| StatusError::Corrupt(id.clone(), e.to_string()))?;
            records.push((entry.name().to_string(), record));
        }
        Ok(records)
    }

    pub async fn member_status(&self, id: &ClusterId) -> Result<MemberStatus, StatusError> {
        let records: Vec<MemberRecord> = self
            .member_records(id)
            .await?
            .into_iter()
            .map(|(_, r)| r)
            .collect();
        Ok(summarize(&records))
    }

    /// Roles reported by the health records, keyed by node id.
    ///
    /// Missing or unreadable records yield an empty map.
    pub async fn member_roles(&self, id: &ClusterId) -> HashMap<String, Role> {
        match self.member_records(id).await {
            Ok(records) => records
                .into_iter()
                .map(|(node, r)| (node, Role::from_member_role(&r.role)))
                .collect(),
            Err(e) => {
                debug!("No member roles for {}: {}", id, e);
                HashMap::new()
            }
        }
    }

    /// Poll until every member is running, `timeout` elapses or `cancel`
    /// fires.
    ///
    /// Read errors are tolerated while polling; the last summary or error is
    /// carried in the timeout error.
    pub async fn wait_for_all_running(
        &self,
        id: &ClusterId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), StatusError> {
        let started = Instant::now();
        let deadline = started + timeout;
        debug!("Waiting up to {:?} for all members of {} to run", timeout, id);

        let mut last = String::from("no status read");
        loop {
            if cancel.is_cancelled() {
                debug!("Wait for members of {} cancelled", id);
                return Err(StatusError::Cancelled(id.clone()));
            }
            match self.member_status(id).await {
                Ok(status) if status.all_running => {
                    info!(
                        "All members of {} running after {:?}: {}",
                        id,
                        started.elapsed(),
                        status.summary
                    );
                    return Ok(());
                }
                Ok(status) => last = status.summary,
                Err(e) => last = e.to_string(),
            }

            if Instant::now() + self.config.poll_interval() > deadline {
                warn!("Members of {} not running after {:?}: {}", id, timeout, last);
                return Err(StatusError::Timeout {
                    instance: id.clone(),
                    waited: started.elapsed(),
                    last,
                });
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
                _ = cancel.cancelled() => {
                    debug!("Wait for members of {} cancelled", id);
                    return Err(StatusError::Cancelled(id.clone()));
                }
            }
        }
    }
}
