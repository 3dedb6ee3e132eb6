//! Scheduler - converges a cluster's nodes to the desired features
//!
//! A run plans the steps needed to go from the current node set to the
//! desired node count and performs them one at a time. Progress is tracked in
//! the cluster's `SchedulingInfo`:
//!
//! - `in-progress` as soon as the run starts
//! - `success` once every step completed and the node count matches
//! - `failed` on the first failing step, which halts the run
//!
//! Nothing is retried. The caller persists the state whatever the outcome.

pub mod removal;
pub mod step;

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};

use crate::backend::{BackendError, Backends};
use crate::cluster::{ClusterFeatures, ClusterId, ClusterState, FeaturesError, Node};
use crate::config::SchedulerConfig;
use crate::context::OpContext;
use crate::placement::Planner;
use crate::status::StatusAggregator;
use crate::store::{StateError, StateStore};

pub use removal::{policy_for, PrimaryAvoiding, RandomNode, RemovalPolicy};
pub use step::{Step, StepType};

/// LastMessage of a run stopped through its cancellation token
pub const CANCELLED_MESSAGE: &str = "cancelled";

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("{0}")]
    Features(#[from] FeaturesError),

    #[error("node-count ({requested}) exceeds the maximum of {max}")]
    TooManyNodes { requested: i64, max: i64 },

    #[error("Unknown cell '{0}'")]
    UnknownCell(String),

    #[error("No backend available for a new node of {0}")]
    NoBackend(ClusterId),

    #[error("Internal error: node {node} assigned to a backend that no longer exists ({backend})")]
    Consistency { node: String, backend: String },

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Cluster has {actual} nodes after the run, expected {expected}")]
    NotConverged { expected: usize, actual: usize },

    #[error("Scheduling run cancelled")]
    Cancelled,
}

impl SchedulerError {
    /// Errors caused by the request rather than by the system
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SchedulerError::Features(_)
                | SchedulerError::TooManyNodes { .. }
                | SchedulerError::UnknownCell(_)
        )
    }
}

// ============================================================================
// SBIO: Pure functions (no I/O)
// ============================================================================

/// Steps converging `nodes` to `desired` nodes.
///
/// Growing yields one `AddNode` per missing node. Shrinking yields one
/// `RemoveNode` per excess node, each chosen by `policy` among the nodes not
/// already chosen.
pub fn plan_steps(nodes: &[Node], desired: usize, policy: &dyn RemovalPolicy) -> Vec<Step> {
    if desired >= nodes.len() {
        return vec![Step::AddNode; desired - nodes.len()];
    }

    let mut remaining = nodes.to_vec();
    let mut steps = Vec::with_capacity(nodes.len() - desired);
    while remaining.len() > desired {
        let Some(chosen) = policy.select(&remaining).cloned() else {
            break;
        };
        remaining.retain(|n| n.id != chosen.id);
        steps.push(Step::RemoveNode(chosen));
    }
    steps
}

// ============================================================================
// SBIO: I/O wrapper
// ============================================================================

#[derive(Clone)]
pub struct Scheduler {
    backends: Backends,
    planner: Planner,
    state_store: StateStore,
    status: StatusAggregator,
    policy: Arc<dyn RemovalPolicy>,
    max_node_count: Option<i64>,
}

impl Scheduler {
    pub fn new(
        backends: Backends,
        state_store: StateStore,
        status: StatusAggregator,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            planner: Planner::new(state_store.clone(), backends.clone()),
            backends,
            state_store,
            status,
            policy: policy_for(config.removal_policy),
            max_node_count: config.max_node_count,
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn RemovalPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    /// Validate requested features before any work starts.
    ///
    /// Returns the features with the default node count applied.
    pub fn verify_cluster_features(
        &self,
        features: &ClusterFeatures,
    ) -> Result<ClusterFeatures, SchedulerError> {
        let features = features.clone().resolved()?;

        if let Some(max) = self.max_node_count {
            if features.node_count > max {
                return Err(SchedulerError::TooManyNodes {
                    requested: features.node_count,
                    max,
                });
            }
        }

        if let Some(unknown) = features
            .cell_guids
            .iter()
            .find(|guid| !self.backends.contains(guid))
        {
            return Err(SchedulerError::UnknownCell(unknown.clone()));
        }

        Ok(features)
    }

    /// Steps the next run would perform for `state`
    pub fn plan(&self, state: &ClusterState, desired: usize) -> Vec<Step> {
        plan_steps(&state.nodes, desired, self.policy.as_ref())
    }

    /// Converge `state` to `features`, one step at a time.
    ///
    /// The outcome is always reflected in `state.scheduling_info`; the error
    /// of the first failing step is also returned.
    pub async fn run_cluster(
        &self,
        ctx: &OpContext,
        state: &mut ClusterState,
        features: &ClusterFeatures,
        cancel: &CancellationToken,
    ) -> Result<(), SchedulerError> {
        self.execute(state, features, cancel)
            .instrument(ctx.span())
            .await
    }

    async fn execute(
        &self,
        state: &mut ClusterState,
        features: &ClusterFeatures,
        cancel: &CancellationToken,
    ) -> Result<(), SchedulerError> {
        let desired = features.target_nodes();
        state.target_node_count = features.node_count;

        if desired < state.node_count() {
            self.refresh_roles(state).await;
        }

        let steps = self.plan(state, desired);
        let planned: Vec<String> = steps.iter().map(|s| s.to_string()).collect();
        state.scheduling_info.begin(
            steps.len(),
            format!("scheduling {} step(s) towards {} node(s)", steps.len(), desired),
        );
        info!(
            "Scheduling {} from {} to {} node(s) with {} policy: [{}]",
            state.instance_id,
            state.node_count(),
            desired,
            self.policy.name(),
            planned.join(", ")
        );

        for step in &steps {
            if cancel.is_cancelled() {
                warn!("Scheduling run of {} cancelled before {}", state.instance_id, step);
                state.scheduling_info.fail(CANCELLED_MESSAGE);
                return Err(SchedulerError::Cancelled);
            }

            if let Err(e) = step.perform(self, state, features).await {
                error!("{} of {} failed: {}", step, state.instance_id, e);
                state.scheduling_info.fail(format!("{} failed: {}", step, e));
                return Err(e);
            }
            state
                .scheduling_info
                .complete_step(format!("{} completed", step));
        }

        if state.node_count() != desired {
            let err = SchedulerError::NotConverged {
                expected: desired,
                actual: state.node_count(),
            };
            state.scheduling_info.fail(err.to_string());
            return Err(err);
        }

        state
            .scheduling_info
            .succeed(format!("cluster has {} node(s)", desired));
        info!("Scheduling of {} succeeded", state.instance_id);
        Ok(())
    }

    /// Apply the roles published in the health records; nodes without a
    /// record keep their recorded role.
    async fn refresh_roles(&self, state: &mut ClusterState) {
        let roles = self.status.member_roles(&state.instance_id).await;
        for (node_id, role) in roles {
            state.set_role(&node_id, role);
        }
    }

    /// Remove every node, carrying on past failures.
    ///
    /// Returns one error per node that could not be removed.
    pub async fn stop_cluster(&self, ctx: &OpContext, state: &mut ClusterState) -> Vec<SchedulerError> {
        let features = ClusterFeatures::default();
        let nodes = state.nodes.clone();
        let mut errors = Vec::new();

        async {
            for node in nodes {
                let step = Step::RemoveNode(node);
                if let Err(e) = step.perform(self, state, &features).await {
                    warn!("Teardown {} of {} failed: {}", step, state.instance_id, e);
                    errors.push(e);
                }
            }
            info!(
                "Stopped {} ({} node(s) left, {} error(s))",
                state.instance_id,
                state.node_count(),
                errors.len()
            );
        }
        .instrument(ctx.span())
        .await;

        errors
    }

    /// Distinct backends currently hosting nodes of `state`
    pub fn backends_in_use(state: &ClusterState) -> HashSet<String> {
        state.nodes.iter().map(|n| n.backend_id.clone()).collect()
    }
}
