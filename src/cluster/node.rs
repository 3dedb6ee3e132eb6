//! Node resource - one PostgreSQL process belonging to a cluster
//!
//! A Node is hosted on a single Backend. Nodes are only ever created and
//! destroyed by scheduler steps; everything else treats them as read-only.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Replication role of a node inside its cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The writable leader
    Primary,
    /// A read-following member
    #[default]
    Replica,
}

impl Role {
    /// Interpret a role string published by the node supervisor.
    ///
    /// The supervisor reports the leader as `master`; `primary` and `leader`
    /// are accepted as well. Every other value is a replica.
    pub fn from_member_role(role: &str) -> Self {
        match role.to_ascii_lowercase().as_str() {
            "master" | "primary" | "leader" => Role::Primary,
            _ => Role::Replica,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Primary => "primary",
            Role::Replica => "replica",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node in a PostgreSQL cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Unique node identifier
    #[serde(rename = "node_id")]
    pub id: String,

    /// GUID of the backend hosting this node
    #[serde(rename = "backend_id")]
    pub backend_id: String,

    #[serde(default)]
    pub plan_id: String,

    #[serde(default)]
    pub service_id: String,

    #[serde(default)]
    pub role: Role,
}

impl Node {
    /// Create a node record with a freshly generated id
    pub fn new(backend_id: impl Into<String>, plan_id: &str, service_id: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            backend_id: backend_id.into(),
            plan_id: plan_id.to_string(),
            service_id: service_id.to_string(),
            role: Role::Replica,
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn is_primary(&self) -> bool {
        self.role == Role::Primary
    }
}
