//! Broker facade
//!
//! The entry points a protocol adapter maps requests onto. Each one checks
//! its preconditions synchronously, so bad requests fail before any work
//! starts, then hands the slow part to the task pool. Failures inside the
//! background part never reach the caller; they end up in the persisted
//! `SchedulingInfo` and the logs.

pub mod recreate;
pub mod tasks;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};

use crate::backend::Backends;
use crate::backup::{BackupError, SharedBackupStore};
use crate::cluster::{
    ClusterFeatures, ClusterId, ClusterState, FeaturesError, PostgresCredentials, SchedulingInfo,
    ADMIN_USERNAME, APP_USERNAME, SUPERUSER_USERNAME,
};
use crate::config::BrokerConfig;
use crate::context::{OpContext, Operation};
use crate::kv::{KvError, SharedKvStore};
use crate::router::{Router, RouterError};
use crate::scheduler::{Scheduler, SchedulerError, CANCELLED_MESSAGE};
use crate::status::{StatusAggregator, StatusError};
use crate::store::{StateError, StateStore};

pub use recreate::RecreateWorkflow;
pub use tasks::{Busy, TaskPool};

/// Database every binding connects to
pub const DATABASE_NAME: &str = "postgres";

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    ResourceExhausted(String),

    #[error("{0}")]
    Consistency(String),

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    Backend(String),

    #[error("{0}")]
    Store(String),

    #[error("{0}")]
    Internal(String),
}

impl BrokerError {
    /// Stable name of the error class
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerError::Validation(_) => "ValidationError",
            BrokerError::NotFound(_) => "NotFoundError",
            BrokerError::Conflict(_) => "ConflictError",
            BrokerError::ResourceExhausted(_) => "ResourceExhausted",
            BrokerError::Consistency(_) => "ConsistencyError",
            BrokerError::Timeout(_) => "TimeoutError",
            BrokerError::Backend(_) => "BackendError",
            BrokerError::Store(_) => "StoreError",
            BrokerError::Internal(_) => "InternalError",
        }
    }
}

impl From<FeaturesError> for BrokerError {
    fn from(e: FeaturesError) -> Self {
        BrokerError::Validation(e.to_string())
    }
}

impl From<KvError> for BrokerError {
    fn from(e: KvError) -> Self {
        BrokerError::Store(e.to_string())
    }
}

impl From<StateError> for BrokerError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::NotFound(_) => BrokerError::NotFound(e.to_string()),
            StateError::AlreadyExists(_) => BrokerError::Conflict(e.to_string()),
            StateError::Corrupt(_, _) => BrokerError::Internal(e.to_string()),
            StateError::Store(_) => BrokerError::Store(e.to_string()),
        }
    }
}

impl From<RouterError> for BrokerError {
    fn from(e: RouterError) -> Self {
        match e {
            RouterError::Exhausted { .. } => BrokerError::ResourceExhausted(e.to_string()),
            RouterError::PortConflict { .. } | RouterError::PortTaken { .. } => {
                BrokerError::Conflict(e.to_string())
            }
            RouterError::Timeout { .. } => BrokerError::Timeout(e.to_string()),
            RouterError::InvalidPort(_) => BrokerError::Internal(e.to_string()),
            RouterError::Store(_) => BrokerError::Store(e.to_string()),
        }
    }
}

impl From<StatusError> for BrokerError {
    fn from(e: StatusError) -> Self {
        match e {
            StatusError::Timeout { .. } => BrokerError::Timeout(e.to_string()),
            StatusError::Store(_) => BrokerError::Store(e.to_string()),
            StatusError::Missing(_) | StatusError::Corrupt(_, _) | StatusError::Cancelled(_) => {
                BrokerError::Internal(e.to_string())
            }
        }
    }
}

impl From<SchedulerError> for BrokerError {
    fn from(e: SchedulerError) -> Self {
        if e.is_validation() {
            return BrokerError::Validation(e.to_string());
        }
        match e {
            SchedulerError::Consistency { .. } => BrokerError::Consistency(e.to_string()),
            SchedulerError::Backend(_) | SchedulerError::NoBackend(_) => {
                BrokerError::Backend(e.to_string())
            }
            SchedulerError::State(inner) => inner.into(),
            _ => BrokerError::Internal(e.to_string()),
        }
    }
}

impl From<Busy> for BrokerError {
    fn from(busy: Busy) -> Self {
        BrokerError::Conflict(format!(
            "{} is in progress for service instance {}",
            busy.operation, busy.instance_id
        ))
    }
}

// ============================================================================
// Requests and responses
// ============================================================================

/// Platform context of a provision request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvisionDetails {
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub plan_id: String,
    #[serde(default)]
    pub organization_guid: String,
    #[serde(default)]
    pub space_guid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<RequestContext>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateDetails {
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub plan_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeprovisionDetails {
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub plan_id: String,
}

/// Connection details handed to a bound application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub username: String,
    pub password: String,
    pub uri: String,
    pub superuser_username: String,
    pub superuser_password: String,
    pub superuser_uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub credentials: Credentials,
}

// ============================================================================
// SBIO: Pure functions (no I/O)
// ============================================================================

/// Initial state of a newly provisioned cluster, with fresh credentials
pub fn init_cluster(
    id: &ClusterId,
    port: u16,
    details: &ProvisionDetails,
    features: &ClusterFeatures,
) -> ClusterState {
    let mut state = ClusterState::new(id.clone());
    state.service_id = details.service_id.clone();
    state.plan_id = details.plan_id.clone();
    state.organization_guid = details.organization_guid.clone();
    state.space_guid = details.space_guid.clone();
    state.allocated_port = port;
    state.admin_credentials = PostgresCredentials::generate(ADMIN_USERNAME);
    state.superuser_credentials = PostgresCredentials::generate(SUPERUSER_USERNAME);
    state.app_credentials = PostgresCredentials::generate(APP_USERNAME);
    state.target_node_count = features.node_count;
    state.service_instance_name = details
        .context
        .as_ref()
        .and_then(|c| c.instance_name.clone());
    state
        .scheduling_info
        .begin(features.target_nodes(), "provisioning scheduled");
    state
}

fn postgres_uri(creds: &PostgresCredentials, host: &str, port: u16) -> String {
    format!(
        "postgres://{}:{}@{}:{}/{}",
        creds.username, creds.password, host, port, DATABASE_NAME
    )
}

pub fn binding_for(state: &ClusterState, host: &str, port: u16) -> Binding {
    Binding {
        credentials: Credentials {
            host: host.to_string(),
            port,
            name: DATABASE_NAME.to_string(),
            username: state.app_credentials.username.clone(),
            password: state.app_credentials.password.clone(),
            uri: postgres_uri(&state.app_credentials, host, port),
            superuser_username: state.superuser_credentials.username.clone(),
            superuser_password: state.superuser_credentials.password.clone(),
            superuser_uri: postgres_uri(&state.superuser_credentials, host, port),
        },
    }
}

// ============================================================================
// SBIO: I/O wrapper
// ============================================================================

#[derive(Clone)]
pub struct Broker {
    config: Arc<BrokerConfig>,
    state_store: StateStore,
    router: Router,
    scheduler: Scheduler,
    status: StatusAggregator,
    backups: SharedBackupStore,
    tasks: TaskPool,
}

impl Broker {
    pub fn new(
        config: BrokerConfig,
        kv: SharedKvStore,
        backends: Backends,
        backups: SharedBackupStore,
    ) -> Self {
        let state_store = StateStore::new(kv.clone());
        let status = StatusAggregator::new(kv.clone(), config.status.clone());
        let scheduler = Scheduler::new(
            backends,
            state_store.clone(),
            status.clone(),
            &config.scheduler,
        );
        Self {
            router: Router::new(kv, config.routing.clone()),
            tasks: TaskPool::new(config.tasks.max_concurrent),
            config: Arc::new(config),
            state_store,
            scheduler,
            status,
            backups,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn state_store(&self) -> &StateStore {
        &self.state_store
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn tasks(&self) -> &TaskPool {
        &self.tasks
    }

    /// Wait for the background task of an instance, if any, to finish
    pub async fn wait_idle(&self, id: &ClusterId) {
        self.tasks.wait_idle(id).await
    }

    pub fn recreate_workflow(&self) -> RecreateWorkflow {
        RecreateWorkflow::new(
            self.state_store.clone(),
            self.router.clone(),
            self.scheduler.clone(),
            self.status.clone(),
            self.backups.clone(),
            self.config.status.wait_timeout(),
        )
    }

    // ------------------------------------------------------------------------
    // Provision
    // ------------------------------------------------------------------------

    /// Provision a new cluster.
    ///
    /// A request without service and plan ids recreates the instance from
    /// its backup instead.
    pub async fn provision(
        &self,
        id: ClusterId,
        details: ProvisionDetails,
    ) -> Result<(), BrokerError> {
        if details.service_id.is_empty() && details.plan_id.is_empty() {
            return self.recreate(id).await;
        }

        let ctx = OpContext::new(Operation::Provision, id);
        let (state, features) = self
            .prepare_provision(&ctx, &details)
            .instrument(ctx.span())
            .await?;

        let broker = self.clone();
        let task_ctx = ctx.clone();
        let claimed = state.clone();
        let spawned = self.tasks.spawn(ctx, move |cancel| async move {
            broker
                .finish_provision(task_ctx, state, features, cancel)
                .await
        });
        if let Err(busy) = spawned {
            self.abandon(&claimed).await;
            return Err(busy.into());
        }
        Ok(())
    }

    async fn prepare_provision(
        &self,
        ctx: &OpContext,
        details: &ProvisionDetails,
    ) -> Result<(ClusterState, ClusterFeatures), BrokerError> {
        let id = &ctx.instance_id;
        let features = ClusterFeatures::from_parameters(details.parameters.as_ref())?;

        if self.tasks.is_active(id) || self.state_store.cluster_exists(id).await? {
            return Err(BrokerError::Conflict(format!(
                "service instance {} already exists",
                id
            )));
        }
        let features = self.scheduler.verify_cluster_features(&features)?;

        let port = self.router.allocate_port().await?;
        let state = init_cluster(id, port, details, &features);

        if let Err(e) = self.state_store.create_cluster(&state).await {
            self.release_port(port).await;
            return Err(e.into());
        }
        if let Err(e) = self.verify_backup(&state).await {
            self.abandon(&state).await;
            return Err(e);
        }

        info!(
            "Provisioning {} with {} node(s) on public port {}",
            id, features.node_count, port
        );
        Ok((state, features))
    }

    async fn finish_provision(
        &self,
        ctx: OpContext,
        mut state: ClusterState,
        features: ClusterFeatures,
        cancel: CancellationToken,
    ) {
        let port = state.allocated_port;
        self.converge(&ctx, &mut state, &features, &cancel).await;

        if let Err(e) = self
            .router
            .assign_port_to_cluster(&state.instance_id, port)
            .await
        {
            error!("Assigning port {} to {} failed: {}", port, state.instance_id, e);
            let message = format!(
                "{}; assigning public port {} failed: {}",
                state.scheduling_info.last_message, port, e
            );
            state.scheduling_info.note(message);
        }
        self.persist(&state).await;
    }

    /// Write the backup and read it back; provisioning without a usable
    /// backup is refused
    async fn verify_backup(&self, state: &ClusterState) -> Result<(), BrokerError> {
        let data = state.recreation_data();
        let backup_failed =
            |e: BackupError| BrokerError::Internal(format!("backup of {} failed: {}", state.instance_id, e));

        self.backups
            .write_recreation_data(&data)
            .await
            .map_err(backup_failed)?;
        let restored = self
            .backups
            .restore_recreation_data(&state.instance_id)
            .await
            .map_err(backup_failed)?;

        if restored != data {
            error!("Backup of {} does not match what was written", state.instance_id);
            return Err(BrokerError::Internal(format!(
                "recreation data backup of {} does not match",
                state.instance_id
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------------

    /// Scale an existing cluster towards new features
    pub async fn update(&self, id: ClusterId, details: UpdateDetails) -> Result<(), BrokerError> {
        let ctx = OpContext::new(Operation::Update, id);
        let (state, features) = self
            .prepare_update(&ctx, &details)
            .instrument(ctx.span())
            .await?;

        let broker = self.clone();
        let task_ctx = ctx.clone();
        self.tasks.spawn(ctx, move |cancel| async move {
            let mut state = state;
            broker
                .converge(&task_ctx, &mut state, &features, &cancel)
                .await;
            broker.persist(&state).await;
        })?;
        Ok(())
    }

    async fn prepare_update(
        &self,
        ctx: &OpContext,
        details: &UpdateDetails,
    ) -> Result<(ClusterState, ClusterFeatures), BrokerError> {
        let id = &ctx.instance_id;
        let features = ClusterFeatures::from_parameters(details.parameters.as_ref())?;
        let mut state = self.state_store.load_cluster(id).await?;

        if let Some(operation) = self.tasks.active_operation(id) {
            return Err(BrokerError::Conflict(format!(
                "{} is in progress for service instance {}",
                operation, id
            )));
        }
        let features = self.scheduler.verify_cluster_features(&features)?;

        if !details.plan_id.is_empty() {
            state.plan_id = details.plan_id.clone();
        }
        let planned = self.scheduler.plan(&state, features.target_nodes()).len();
        state.scheduling_info.begin(planned, "update scheduled");
        self.state_store.save_cluster(&state).await?;

        info!(
            "Updating {} from {} to {} node(s)",
            id,
            state.node_count(),
            features.node_count
        );
        Ok((state, features))
    }

    // ------------------------------------------------------------------------
    // Deprovision
    // ------------------------------------------------------------------------

    /// Tear a cluster down, cancelling whatever else runs for it
    pub async fn deprovision(
        &self,
        id: ClusterId,
        details: DeprovisionDetails,
    ) -> Result<(), BrokerError> {
        let ctx = OpContext::new(Operation::Deprovision, id);
        let state = self
            .prepare_deprovision(&ctx, &details)
            .instrument(ctx.span())
            .await?;

        let broker = self.clone();
        let task_ctx = ctx.clone();
        self.tasks.spawn_replacing(ctx, move |_cancel| async move {
            broker.finish_deprovision(task_ctx, state).await
        });
        Ok(())
    }

    async fn prepare_deprovision(
        &self,
        ctx: &OpContext,
        details: &DeprovisionDetails,
    ) -> Result<ClusterState, BrokerError> {
        let id = &ctx.instance_id;
        if !self.state_store.cluster_exists(id).await? {
            return Err(BrokerError::NotFound(format!(
                "service instance {} doesn't exist",
                id
            )));
        }
        if details.service_id.is_empty() || details.plan_id.is_empty() {
            return Err(BrokerError::Validation(
                "provide service_id and plan_id as URL parameters".to_string(),
            ));
        }

        match self.state_store.load_cluster(id).await {
            Ok(state) => Ok(state),
            Err(StateError::NotFound(_)) => {
                warn!("{} has records but no snapshot, removing records only", id);
                Ok(ClusterState::new(id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn finish_deprovision(&self, ctx: OpContext, state: ClusterState) {
        let id = ctx.instance_id.clone();

        // a cancelled predecessor may have changed the nodes meanwhile
        let mut state = match self.state_store.load_cluster(&id).await {
            Ok(latest) => latest,
            Err(_) => state,
        };

        let errors = self.scheduler.stop_cluster(&ctx, &mut state).await;
        for e in &errors {
            warn!("Teardown of {} incomplete: {}", id, e);
        }

        if let Err(e) = self.state_store.delete_cluster(&id).await {
            error!("Deleting state of {} failed: {}", id, e);
        }
        if let Err(e) = self.router.remove_cluster_assignment(&id).await {
            error!("Releasing public port of {} failed: {}", id, e);
        }
        info!("Deprovisioned {} ({} teardown error(s))", id, errors.len());
    }

    // ------------------------------------------------------------------------
    // Recreate
    // ------------------------------------------------------------------------

    /// Rebuild a lost cluster from its backup
    pub async fn recreate(&self, id: ClusterId) -> Result<(), BrokerError> {
        let ctx = OpContext::new(Operation::Recreate, id.clone());
        if let Some(operation) = self.tasks.active_operation(&id) {
            return Err(BrokerError::Conflict(format!(
                "{} is in progress for service instance {}",
                operation, id
            )));
        }

        let workflow = self.recreate_workflow();
        let data = workflow.prepare(&id).instrument(ctx.span()).await?;
        info!("Recreating {} from backup", id);

        let task_ctx = ctx.clone();
        self.tasks.spawn(ctx, move |cancel| async move {
            if let Err(e) = workflow.execute(&task_ctx, &data, &cancel).await {
                error!("Recreating {} failed: {}", task_ctx.instance_id, e);
            }
        })?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Queries and bindings
    // ------------------------------------------------------------------------

    /// Progress of the most recent operation on the instance
    pub async fn last_operation(&self, id: ClusterId) -> Result<SchedulingInfo, BrokerError> {
        let ctx = OpContext::new(Operation::LastOperation, id);
        let state = self
            .state_store
            .load_cluster(&ctx.instance_id)
            .instrument(ctx.span())
            .await?;
        Ok(state.scheduling_info)
    }

    /// Credentials for an application bound to the instance
    pub async fn bind(&self, id: ClusterId, binding_id: &str) -> Result<Binding, BrokerError> {
        let ctx = OpContext::new(Operation::Bind, id);
        async {
            let id = &ctx.instance_id;
            let state = self.state_store.load_cluster(id).await?;

            let port = match self.router.port_allocation(id).await? {
                Some(port) => port,
                None => {
                    self.router
                        .wait_for_routing_port_allocation(id, self.port_wait_budget())
                        .await?
                }
            };

            info!("Binding {} to {} via port {}", binding_id, id, port);
            Ok::<_, BrokerError>(binding_for(&state, &self.config.broker.bind_host, port))
        }
        .instrument(ctx.span())
        .await
    }

    /// Bindings hold no server-side state
    pub async fn unbind(&self, id: ClusterId, binding_id: &str) -> Result<(), BrokerError> {
        let ctx = OpContext::new(Operation::Unbind, id);
        if !self.state_store.cluster_exists(&ctx.instance_id).await? {
            return Err(BrokerError::NotFound(format!(
                "service instance {} doesn't exist",
                ctx.instance_id
            )));
        }
        info!("Unbound {} from {}", binding_id, ctx.instance_id);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    /// Run the scheduler, then wait for the members to come up.
    ///
    /// Returns whether the cluster converged. A member wait that times out
    /// or is cancelled after a successful run is recorded in the message;
    /// the run's status stays as the scheduler left it.
    async fn converge(
        &self,
        ctx: &OpContext,
        state: &mut ClusterState,
        features: &ClusterFeatures,
        cancel: &CancellationToken,
    ) -> bool {
        if let Err(e) = self.scheduler.run_cluster(ctx, state, features, cancel).await {
            error!("Scheduling {} failed: {}", state.instance_id, e);
            return false;
        }
        if state.node_count() == 0 {
            return true;
        }

        let wait = self
            .status
            .wait_for_all_running(&state.instance_id, self.config.status.wait_timeout(), cancel)
            .await;
        // every step succeeded, so the status is final; the wait outcome
        // only extends the message
        match wait {
            Ok(()) => true,
            Err(StatusError::Cancelled(_)) => {
                warn!("Waiting for members of {} cancelled", state.instance_id);
                let message = format!("{}; {}", state.scheduling_info.last_message, CANCELLED_MESSAGE);
                state.scheduling_info.note(message);
                false
            }
            Err(e) => {
                warn!("{} scheduled but not running: {}", state.instance_id, e);
                let message = format!("{}; {}", state.scheduling_info.last_message, e);
                state.scheduling_info.note(message);
                false
            }
        }
    }

    /// Save the snapshot and refresh the backup, logging failures
    async fn persist(&self, state: &ClusterState) {
        if let Err(e) = self.state_store.save_cluster(state).await {
            error!("Saving state of {} failed: {}", state.instance_id, e);
        }
        if let Err(e) = self
            .backups
            .write_recreation_data(&state.recreation_data())
            .await
        {
            warn!("Backing up {} failed: {}", state.instance_id, e);
        }
    }

    /// Undo a claim made by a provision that cannot go ahead
    async fn abandon(&self, state: &ClusterState) {
        if let Err(e) = self.state_store.delete_cluster(&state.instance_id).await {
            warn!("Removing claim on {} failed: {}", state.instance_id, e);
        }
        self.release_port(state.allocated_port).await;
    }

    async fn release_port(&self, port: u16) {
        if let Err(e) = self.router.release_port(port).await {
            warn!("Releasing port {} failed: {}", port, e);
        }
    }

    fn port_wait_budget(&self) -> Duration {
        self.config.routing.wait_interval() * self.config.routing.wait_attempts
    }
}
