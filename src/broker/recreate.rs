//! Rebuilding a cluster from its backed-up identity

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backup::{BackupError, SharedBackupStore};
use crate::cluster::{ClusterFeatures, ClusterId, ClusterRecreationData, ClusterState};
use crate::context::OpContext;
use crate::router::{Router, RouterError};
use crate::scheduler::{Scheduler, CANCELLED_MESSAGE};
use crate::status::{StatusAggregator, StatusError};
use crate::store::StateStore;

use super::BrokerError;

/// Recreates a lost instance with its original credentials and public port
#[derive(Clone)]
pub struct RecreateWorkflow {
    state_store: StateStore,
    router: Router,
    scheduler: Scheduler,
    status: StatusAggregator,
    backups: SharedBackupStore,
    wait_timeout: Duration,
}

impl RecreateWorkflow {
    pub fn new(
        state_store: StateStore,
        router: Router,
        scheduler: Scheduler,
        status: StatusAggregator,
        backups: SharedBackupStore,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            state_store,
            router,
            scheduler,
            status,
            backups,
            wait_timeout,
        }
    }

    /// Checks made before any background work starts
    pub async fn prepare(&self, id: &ClusterId) -> Result<ClusterRecreationData, BrokerError> {
        if self.state_store.cluster_exists(id).await? {
            return Err(BrokerError::Conflict(format!(
                "service instance {} still exists, please clean it out before recreating the cluster",
                id
            )));
        }

        self.backups
            .restore_recreation_data(id)
            .await
            .map_err(|e| match e {
                BackupError::NotFound(_) => {
                    BrokerError::NotFound(format!("no backup of service instance {}", id))
                }
                other => BrokerError::Internal(format!("cannot restore backup of {}: {}", id, other)),
            })
    }

    /// Rebuild the cluster described by `data`.
    ///
    /// The instance is persisted before anything else, so `last_operation`
    /// reports progress and any failure of the rebuild.
    pub async fn execute(
        &self,
        ctx: &OpContext,
        data: &ClusterRecreationData,
        cancel: &CancellationToken,
    ) -> Result<ClusterState, BrokerError> {
        let id = &data.instance_id;

        // backups written before the target count was recorded carry 0;
        // the rebuilt instance records the count it was recreated with
        let target = data.target_node_count.max(1);
        let mut state = ClusterState::from_recreation_data(data);
        state
            .scheduling_info
            .begin(target as usize, "recreating from backup");
        self.state_store.create_cluster(&state).await?;

        if let Err(e) = self
            .router
            .assign_port_to_cluster(id, data.allocated_port)
            .await
        {
            error!("Reclaiming public port {} for {} failed: {}", data.allocated_port, id, e);
            if !matches!(e, RouterError::PortTaken { .. } | RouterError::PortConflict { .. }) {
                if let Err(cleanup) = self.router.remove_cluster_assignment(id).await {
                    warn!("Releasing public port of {} failed: {}", id, cleanup);
                }
            }
            state.scheduling_info.fail(format!(
                "reclaiming public port {} failed: {}",
                data.allocated_port, e
            ));
            self.state_store.save_cluster(&state).await?;
            return Err(e.into());
        }
        info!("Reclaimed public port {} for {}", data.allocated_port, id);

        let features = ClusterFeatures::with_node_count(target);
        let run = self
            .scheduler
            .run_cluster(ctx, &mut state, &features, cancel)
            .await;
        self.state_store.save_cluster(&state).await?;
        run?;

        // every step succeeded, so the status is final; the wait outcome
        // only extends the message
        if let Err(e) = self
            .status
            .wait_for_all_running(id, self.wait_timeout, cancel)
            .await
        {
            warn!("Recreated {} but members are not running: {}", id, e);
            let reason = if matches!(e, StatusError::Cancelled(_)) {
                CANCELLED_MESSAGE.to_string()
            } else {
                e.to_string()
            };
            let message = format!("{}; {}", state.scheduling_info.last_message, reason);
            state.scheduling_info.note(message);
            self.state_store.save_cluster(&state).await?;
            return Err(e.into());
        }

        self.backups
            .write_recreation_data(&state.recreation_data())
            .await
            .map_err(|e| BrokerError::Internal(format!("backup of {} failed: {}", id, e)))?;

        info!("Recreated {} with {} node(s)", id, state.node_count());
        Ok(state)
    }
}
