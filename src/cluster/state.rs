//! Cluster state - the persisted snapshot of one service instance
//!
//! `ClusterState` is owned by the scheduler while a run is active and by the
//! state store in between runs. `ClusterRecreationData` is the durable subset
//! written to the backup store so the identity of a cluster can be rebuilt
//! after its live state is lost.

use std::fmt;

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::node::{Node, Role};

/// Length of generated database passwords
pub const PASSWORD_LENGTH: usize = 16;

/// Opaque, immutable identity of a service instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(String);

impl ClusterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClusterId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ClusterId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Username/password pair for one of the cluster's database roles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PostgresCredentials {
    pub username: String,
    pub password: String,
}

impl PostgresCredentials {
    /// Credentials for `username` with a random alphanumeric password
    pub fn generate(username: &str) -> Self {
        let password = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(PASSWORD_LENGTH)
            .map(char::from)
            .collect();
        Self {
            username: username.to_string(),
            password,
        }
    }
}

/// Phase of the scheduling state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SchedulingStatus {
    #[default]
    #[serde(rename = "unknown", alias = "")]
    Unknown,
    #[serde(rename = "in-progress")]
    InProgress,
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "failed")]
    Failed,
}

impl SchedulingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SchedulingStatus::Success | SchedulingStatus::Failed)
    }
}

impl fmt::Display for SchedulingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SchedulingStatus::Unknown => "unknown",
            SchedulingStatus::InProgress => "in-progress",
            SchedulingStatus::Success => "success",
            SchedulingStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Progress of the most recent scheduling run
///
/// Within one run `completed_steps` never decreases and never exceeds
/// `steps`, and the status only moves forward:
/// unknown -> in-progress -> success | failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SchedulingInfo {
    pub status: SchedulingStatus,
    pub steps: usize,
    pub completed_steps: usize,
    pub last_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl SchedulingInfo {
    /// Start a new run of `steps` planned steps
    pub fn begin(&mut self, steps: usize, message: impl Into<String>) {
        self.status = SchedulingStatus::InProgress;
        self.steps = steps;
        self.completed_steps = 0;
        self.last_message = message.into();
        self.updated_at = Some(Utc::now());
    }

    /// Record one more completed step
    pub fn complete_step(&mut self, message: impl Into<String>) {
        if self.status != SchedulingStatus::InProgress {
            return;
        }
        self.completed_steps = (self.completed_steps + 1).min(self.steps);
        self.last_message = message.into();
        self.updated_at = Some(Utc::now());
    }

    /// Finish the run successfully. Ignored once the run is terminal.
    pub fn succeed(&mut self, message: impl Into<String>) {
        self.finish(SchedulingStatus::Success, message.into());
    }

    /// Finish the run with a failure. Ignored once the run is terminal.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.finish(SchedulingStatus::Failed, message.into());
    }

    /// Replace the message, leaving status and counters alone
    pub fn note(&mut self, message: impl Into<String>) {
        self.last_message = message.into();
        self.updated_at = Some(Utc::now());
    }

    fn finish(&mut self, status: SchedulingStatus, message: String) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        self.last_message = message;
        self.updated_at = Some(Utc::now());
    }
}

/// Durable subset of `ClusterState` sufficient to rebuild a cluster identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRecreationData {
    pub instance_id: ClusterId,
    pub service_id: String,
    pub plan_id: String,
    pub organization_guid: String,
    pub space_guid: String,
    pub admin_credentials: PostgresCredentials,
    pub superuser_credentials: PostgresCredentials,
    pub app_credentials: PostgresCredentials,
    pub allocated_port: u16,
    #[serde(default)]
    pub target_node_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_instance_name: Option<String>,
}

/// Full state of one service instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    pub instance_id: ClusterId,
    pub service_id: String,
    pub plan_id: String,
    pub organization_guid: String,
    pub space_guid: String,
    pub admin_credentials: PostgresCredentials,
    pub superuser_credentials: PostgresCredentials,
    pub app_credentials: PostgresCredentials,
    pub allocated_port: u16,
    #[serde(default)]
    pub nodes: Vec<Node>,
    /// Desired node count of the most recent scheduling run
    #[serde(default)]
    pub target_node_count: i64,
    #[serde(rename = "info", default)]
    pub scheduling_info: SchedulingInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_instance_name: Option<String>,
}

impl ClusterState {
    /// A zero-node cluster with no credentials yet
    pub fn new(instance_id: impl Into<ClusterId>) -> Self {
        Self {
            instance_id: instance_id.into(),
            service_id: String::new(),
            plan_id: String::new(),
            organization_guid: String::new(),
            space_guid: String::new(),
            admin_credentials: PostgresCredentials::default(),
            superuser_credentials: PostgresCredentials::default(),
            app_credentials: PostgresCredentials::default(),
            allocated_port: 0,
            nodes: Vec::new(),
            target_node_count: 0,
            scheduling_info: SchedulingInfo::default(),
            service_instance_name: None,
        }
    }

    /// Rebuild a zero-node cluster from its backed-up identity
    pub fn from_recreation_data(data: &ClusterRecreationData) -> Self {
        Self {
            instance_id: data.instance_id.clone(),
            service_id: data.service_id.clone(),
            plan_id: data.plan_id.clone(),
            organization_guid: data.organization_guid.clone(),
            space_guid: data.space_guid.clone(),
            admin_credentials: data.admin_credentials.clone(),
            superuser_credentials: data.superuser_credentials.clone(),
            app_credentials: data.app_credentials.clone(),
            allocated_port: data.allocated_port,
            nodes: Vec::new(),
            target_node_count: data.target_node_count,
            scheduling_info: SchedulingInfo::default(),
            service_instance_name: data.service_instance_name.clone(),
        }
    }

    pub fn recreation_data(&self) -> ClusterRecreationData {
        ClusterRecreationData {
            instance_id: self.instance_id.clone(),
            service_id: self.service_id.clone(),
            plan_id: self.plan_id.clone(),
            organization_guid: self.organization_guid.clone(),
            space_guid: self.space_guid.clone(),
            admin_credentials: self.admin_credentials.clone(),
            superuser_credentials: self.superuser_credentials.clone(),
            app_credentials: self.app_credentials.clone(),
            allocated_port: self.allocated_port,
            target_node_count: self.target_node_count,
            service_instance_name: self.service_instance_name.clone(),
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn add_node(&mut self, node: Node) {
        self.nodes.push(node);
    }

    /// Remove a node by id, returning it if it was present
    pub fn remove_node(&mut self, node_id: &str) -> Option<Node> {
        let idx = self.nodes.iter().position(|n| n.id == node_id)?;
        Some(self.nodes.remove(idx))
    }

    pub fn primary(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| n.role == Role::Primary)
    }

    /// Update a node's role, returning false if no such node exists
    pub fn set_role(&mut self, node_id: &str, role: Role) -> bool {
        match self.nodes.iter_mut().find(|n| n.id == node_id) {
            Some(node) => {
                node.role = role;
                true
            }
            None => false,
        }
    }

    /// Serialize for the `<instance>/meta` key
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
