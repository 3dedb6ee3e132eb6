//! Units of scheduling work
//!
//! A run is an ordered list of steps. The scheduler only relies on
//! `step_type` and `perform`; the variants own their details.

use std::fmt;

use tracing::{error, info};
use uuid::Uuid;

use super::{Scheduler, SchedulerError};
use crate::backend::ProvisionRequest;
use crate::cluster::{ClusterFeatures, ClusterState, Node, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepType {
    AddNode,
    RemoveNode,
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepType::AddNode => f.write_str("AddNode"),
            StepType::RemoveNode => f.write_str("RemoveNode"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Provision one more node on the least used availability zone
    AddNode,
    /// Deprovision this node
    RemoveNode(Node),
}

impl Step {
    pub fn step_type(&self) -> StepType {
        match self {
            Step::AddNode => StepType::AddNode,
            Step::RemoveNode(_) => StepType::RemoveNode,
        }
    }

    pub async fn perform(
        &self,
        scheduler: &Scheduler,
        state: &mut ClusterState,
        features: &ClusterFeatures,
    ) -> Result<(), SchedulerError> {
        match self {
            Step::AddNode => add_node(scheduler, state, features).await,
            Step::RemoveNode(node) => remove_node(scheduler, state, node).await,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::AddNode => write!(f, "{}", StepType::AddNode),
            Step::RemoveNode(node) => write!(f, "{}({})", StepType::RemoveNode, node.id),
        }
    }
}

async fn add_node(
    scheduler: &Scheduler,
    state: &mut ClusterState,
    features: &ClusterFeatures,
) -> Result<(), SchedulerError> {
    let backend = scheduler
        .planner
        .select_backend(&state.instance_id, &features.cell_guids)
        .await
        .ok_or_else(|| SchedulerError::NoBackend(state.instance_id.clone()))?;

    let role = if state.node_count() == 0 {
        Role::Primary
    } else {
        Role::Replica
    };
    let request = ProvisionRequest {
        instance_id: state.instance_id.clone(),
        node_id: Uuid::new_v4().to_string(),
        plan_id: state.plan_id.clone(),
        service_id: state.service_id.clone(),
        role,
    };

    info!(
        "Adding {} node {} to {} on backend {} ({})",
        role,
        request.node_id,
        state.instance_id,
        backend.guid(),
        backend.availability_zone()
    );
    let node = backend.provision_node(&request).await?;

    state.add_node(node.clone());
    scheduler
        .state_store
        .record_node(&state.instance_id, &node)
        .await?;
    Ok(())
}

async fn remove_node(
    scheduler: &Scheduler,
    state: &mut ClusterState,
    node: &Node,
) -> Result<(), SchedulerError> {
    let Some(backend) = scheduler.backends.get(&node.backend_id) else {
        error!(
            "Node {} of {} is assigned to backend {} which is no longer configured",
            node.id, state.instance_id, node.backend_id
        );
        return Err(SchedulerError::Consistency {
            node: node.id.clone(),
            backend: node.backend_id.clone(),
        });
    };

    info!(
        "Removing {} node {} of {} from backend {}",
        node.role,
        node.id,
        state.instance_id,
        backend.guid()
    );
    backend.deprovision_node(&state.instance_id, node).await?;

    state.remove_node(&node.id);
    scheduler
        .state_store
        .forget_node(&state.instance_id, &node.id)
        .await?;
    Ok(())
}
