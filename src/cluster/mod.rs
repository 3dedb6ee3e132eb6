//! # Cluster data model
//!
//! Plain data types shared by every component of the broker:
//!
//! - **ClusterState**: the persisted snapshot of one service instance
//! - **Node**: one PostgreSQL process hosted on a backend
//! - **SchedulingInfo**: progress of the latest scheduling run
//! - **ClusterFeatures**: the requested topology (pure input)
//! - **ClusterRecreationData**: the durable identity written to backups
//!
//! ```text
//! ClusterState ──┬── identity (ids, credentials, port) ──► ClusterRecreationData
//!                ├── nodes: [Node { id, backend_id, role }]
//!                └── info:  SchedulingInfo { status, steps, completed_steps }
//! ```

pub mod features;
pub mod node;
pub mod state;

pub use features::{ClusterFeatures, FeaturesError, DEFAULT_NODE_COUNT};
pub use node::{Node, Role};
pub use state::{
    ClusterId, ClusterRecreationData, ClusterState, PostgresCredentials, SchedulingInfo,
    SchedulingStatus,
};

/// Username of the administrative database role
pub const ADMIN_USERNAME: &str = "pgadmin";

/// Username of the PostgreSQL superuser
pub const SUPERUSER_USERNAME: &str = "postgres";

/// Username handed to applications in bindings
pub const APP_USERNAME: &str = "appuser";
