//! End-to-end broker lifecycle tests
//!
//! The broker runs over the in-memory store with in-process backends that
//! behave like node supervisors: provisioning a node publishes its health
//! record, deprovisioning removes it.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use pgbroker::backend::{BackendError, Backends, NodeBackend, ProvisionRequest, SharedBackend};
use pgbroker::backup::{BackupError, BackupStore, MemoryBackupStore, SharedBackupStore};
use pgbroker::broker::{Broker, BrokerError, DeprovisionDetails, ProvisionDetails, UpdateDetails};
use pgbroker::cluster::{ClusterId, ClusterRecreationData, Node, Role, SchedulingStatus};
use pgbroker::config::{BackendConfig, BrokerConfig};
use pgbroker::kv::{KvStore, MemoryStore, SharedKvStore};
use pgbroker::status::{members_key, MemberRecord, RUNNING};

/// Backend that publishes member records like a node supervisor would
struct SupervisedBackend {
    guid: String,
    az: String,
    kv: SharedKvStore,
    delay: Duration,
    fail: AtomicBool,
    /// Members stay "starting" forever
    stalled: AtomicBool,
    provisioned: AtomicUsize,
    deprovisioned: AtomicUsize,
}

impl SupervisedBackend {
    fn new(guid: &str, az: &str, kv: SharedKvStore, delay: Duration) -> Self {
        Self {
            guid: guid.to_string(),
            az: az.to_string(),
            kv,
            delay,
            fail: AtomicBool::new(false),
            stalled: AtomicBool::new(false),
            provisioned: AtomicUsize::new(0),
            deprovisioned: AtomicUsize::new(0),
        }
    }

    fn check(&self) -> Result<(), BackendError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(BackendError::Api {
                backend: self.guid.clone(),
                status: 503,
                message: "no capacity".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl NodeBackend for SupervisedBackend {
    fn guid(&self) -> &str {
        &self.guid
    }

    fn availability_zone(&self) -> &str {
        &self.az
    }

    async fn provision_node(&self, request: &ProvisionRequest) -> Result<Node, BackendError> {
        tokio::time::sleep(self.delay).await;
        self.check()?;

        let record = MemberRecord {
            role: if request.role == Role::Primary { "master" } else { "replica" }.to_string(),
            state: if self.stalled.load(Ordering::SeqCst) { "starting" } else { RUNNING }
                .to_string(),
        };
        self.kv
            .set(
                &members_key(&request.instance_id, &request.node_id),
                &serde_json::to_string(&record).unwrap(),
            )
            .await
            .unwrap();
        self.provisioned.fetch_add(1, Ordering::SeqCst);

        Ok(Node {
            id: request.node_id.clone(),
            backend_id: self.guid.clone(),
            plan_id: request.plan_id.clone(),
            service_id: request.service_id.clone(),
            role: request.role,
        })
    }

    async fn deprovision_node(&self, instance_id: &ClusterId, node: &Node) -> Result<(), BackendError> {
        self.check()?;
        let _ = self.kv.delete(&members_key(instance_id, &node.id)).await;
        self.deprovisioned.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    broker: Broker,
    kv: SharedKvStore,
    backups: Arc<MemoryBackupStore>,
    backends: Vec<Arc<SupervisedBackend>>,
}

fn config(specs: &[(&str, &str)], ports: (u16, u16)) -> BrokerConfig {
    let mut config = BrokerConfig::with_backends(
        specs
            .iter()
            .map(|(guid, az)| BackendConfig {
                guid: guid.to_string(),
                uri: "http://unused".to_string(),
                username: String::new(),
                password: String::new(),
                availability_zone: az.to_string(),
            })
            .collect(),
    );
    config.broker.bind_host = "pg.example.com".to_string();
    config.routing.port_min = ports.0;
    config.routing.port_max = ports.1;
    config.routing.wait_attempts = 5;
    config.routing.wait_interval_ms = 10;
    config.status.poll_interval_ms = 10;
    config.status.wait_timeout_ms = 1000;
    config
}

fn harness_with(
    specs: &[(&str, &str)],
    ports: (u16, u16),
    delay: Duration,
    kv: SharedKvStore,
    backups: Arc<MemoryBackupStore>,
) -> Harness {
    let backends: Vec<Arc<SupervisedBackend>> = specs
        .iter()
        .map(|(guid, az)| Arc::new(SupervisedBackend::new(guid, az, kv.clone(), delay)))
        .collect();
    let registry = Backends::new(backends.iter().map(|b| b.clone() as SharedBackend).collect());
    let broker = Broker::new(
        config(specs, ports),
        kv.clone(),
        registry,
        backups.clone() as SharedBackupStore,
    );
    Harness {
        broker,
        kv,
        backups,
        backends,
    }
}

fn harness(specs: &[(&str, &str)]) -> Harness {
    harness_with(
        specs,
        (30000, 30009),
        Duration::ZERO,
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryBackupStore::new()),
    )
}

const THREE_ZONES: &[(&str, &str)] = &[("cell-a", "z1"), ("cell-b", "z2"), ("cell-c", "z3")];

fn provision_details(node_count: i64) -> ProvisionDetails {
    ProvisionDetails {
        service_id: "svc".to_string(),
        plan_id: "plan".to_string(),
        organization_guid: "org".to_string(),
        space_guid: "space".to_string(),
        parameters: Some(json!({ "node-count": node_count })),
        context: None,
    }
}

fn deprovision_details() -> DeprovisionDetails {
    DeprovisionDetails {
        service_id: "svc".to_string(),
        plan_id: "plan".to_string(),
    }
}

async fn provision_and_wait(h: &Harness, id: &str, node_count: i64) -> ClusterId {
    let id = ClusterId::from(id);
    h.broker
        .provision(id.clone(), provision_details(node_count))
        .await
        .unwrap();
    h.broker.wait_idle(&id).await;
    id
}

#[tokio::test]
async fn test_provision_converges_across_zones() {
    let h = harness(THREE_ZONES);
    let id = provision_and_wait(&h, "inst-1", 3).await;

    let info = h.broker.last_operation(id.clone()).await.unwrap();
    assert_eq!(info.status, SchedulingStatus::Success);
    assert_eq!(info.steps, 3);
    assert_eq!(info.completed_steps, 3);

    let state = h.broker.state_store().load_cluster(&id).await.unwrap();
    assert_eq!(state.node_count(), 3);
    assert_eq!(state.primary().map(|n| n.backend_id.as_str()), Some("cell-a"));
    let mut hosts: Vec<&str> = state.nodes.iter().map(|n| n.backend_id.as_str()).collect();
    hosts.sort();
    assert_eq!(hosts, vec!["cell-a", "cell-b", "cell-c"]);

    assert_eq!(h.broker.router().port_allocation(&id).await.unwrap(), Some(30000));

    let backup = h.backups.restore_recreation_data(&id).await.unwrap();
    assert_eq!(backup, state.recreation_data());
}

#[tokio::test]
async fn test_provision_rejects_duplicates_and_bad_features() {
    let h = harness(THREE_ZONES);
    let id = provision_and_wait(&h, "inst-1", 1).await;

    let err = h
        .broker
        .provision(id, provision_details(1))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Conflict(_)));

    let mut details = provision_details(2);
    details.parameters = Some(json!({ "node-count": 2, "cells": ["cell-x"] }));
    let other = ClusterId::from("inst-2");
    let err = h.broker.provision(other.clone(), details).await.unwrap_err();
    assert!(matches!(err, BrokerError::Validation(_)));
    assert!(!h.broker.state_store().cluster_exists(&other).await.unwrap());

    let err = h
        .broker
        .provision(other.clone(), provision_details(-2))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Validation(_)));
}

#[tokio::test]
async fn test_failed_node_is_reported_in_last_operation() {
    let h = harness(&[("cell-a", "z1")]);
    h.backends[0].fail.store(true, Ordering::SeqCst);

    let id = provision_and_wait(&h, "inst-1", 2).await;
    let info = h.broker.last_operation(id.clone()).await.unwrap();
    assert_eq!(info.status, SchedulingStatus::Failed);
    assert_eq!(info.completed_steps, 0);
    assert!(info.last_message.starts_with("AddNode failed"), "{}", info.last_message);

    // the public port is assigned whatever the outcome
    assert_eq!(h.broker.router().port_allocation(&id).await.unwrap(), Some(30000));
}

#[tokio::test]
async fn test_update_scales_down_keeping_the_primary() {
    let h = harness(THREE_ZONES);
    let id = provision_and_wait(&h, "inst-1", 3).await;
    let primary = h
        .broker
        .state_store()
        .load_cluster(&id)
        .await
        .unwrap()
        .primary()
        .cloned()
        .unwrap();

    h.broker
        .update(
            id.clone(),
            UpdateDetails {
                parameters: Some(json!({ "node-count": 1 })),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    h.broker.wait_idle(&id).await;

    let state = h.broker.state_store().load_cluster(&id).await.unwrap();
    assert_eq!(state.scheduling_info.status, SchedulingStatus::Success);
    assert_eq!(state.nodes, vec![primary]);
    assert_eq!(state.target_node_count, 1);

    let deprovisioned: usize = h
        .backends
        .iter()
        .map(|b| b.deprovisioned.load(Ordering::SeqCst))
        .sum();
    assert_eq!(deprovisioned, 2);
}

#[tokio::test]
async fn test_update_of_missing_instance() {
    let h = harness(THREE_ZONES);
    let err = h
        .broker
        .update(ClusterId::from("nope"), UpdateDetails::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::NotFound(_)));
}

#[tokio::test]
async fn test_deprovision_releases_everything() {
    let h = harness_with(
        THREE_ZONES,
        (30000, 30000),
        Duration::ZERO,
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryBackupStore::new()),
    );
    let id = provision_and_wait(&h, "inst-1", 2).await;

    let err = h
        .broker
        .deprovision(id.clone(), DeprovisionDetails::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Validation(_)));

    h.broker
        .deprovision(id.clone(), deprovision_details())
        .await
        .unwrap();
    h.broker.wait_idle(&id).await;

    assert!(!h.broker.state_store().cluster_exists(&id).await.unwrap());
    assert!(h.kv.list("service/inst-1/members").await.unwrap_or_default().is_empty());
    assert_eq!(h.broker.router().port_allocation(&id).await.unwrap(), None);

    // the single port of the range is free again
    assert_eq!(h.broker.router().allocate_port().await.unwrap(), 30000);

    let err = h
        .broker
        .deprovision(id, deprovision_details())
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::NotFound(_)));
}

#[tokio::test]
async fn test_deprovision_cancels_running_provision() {
    let h = harness_with(
        THREE_ZONES,
        (30000, 30009),
        Duration::from_millis(50),
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryBackupStore::new()),
    );
    let id = ClusterId::from("inst-1");
    h.broker
        .provision(id.clone(), provision_details(3))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    h.broker
        .deprovision(id.clone(), deprovision_details())
        .await
        .unwrap();
    h.broker.wait_idle(&id).await;

    assert!(!h.broker.state_store().cluster_exists(&id).await.unwrap());
    let provisioned: usize = h
        .backends
        .iter()
        .map(|b| b.provisioned.load(Ordering::SeqCst))
        .sum();
    let deprovisioned: usize = h
        .backends
        .iter()
        .map(|b| b.deprovisioned.load(Ordering::SeqCst))
        .sum();
    assert!(provisioned < 3);
    assert_eq!(provisioned, deprovisioned);
}

#[tokio::test]
async fn test_deprovision_does_not_wait_out_member_startup() {
    let kv: SharedKvStore = Arc::new(MemoryStore::new());
    let backend = Arc::new(SupervisedBackend::new("cell-a", "z1", kv.clone(), Duration::ZERO));
    backend.stalled.store(true, Ordering::SeqCst);
    let mut config = config(&[("cell-a", "z1")], (30000, 30009));
    config.status.wait_timeout_ms = 10_000;
    let broker = Broker::new(
        config,
        kv,
        Backends::new(vec![backend.clone() as SharedBackend]),
        Arc::new(MemoryBackupStore::new()),
    );
    let id = ClusterId::from("inst-1");

    broker.provision(id.clone(), provision_details(1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let requested = std::time::Instant::now();
    broker
        .deprovision(id.clone(), deprovision_details())
        .await
        .unwrap();
    broker.wait_idle(&id).await;

    assert!(
        requested.elapsed() < Duration::from_secs(2),
        "deprovision took {:?}",
        requested.elapsed()
    );
    assert!(!broker.state_store().cluster_exists(&id).await.unwrap());
    assert_eq!(backend.provisioned.load(Ordering::SeqCst), 1);
    assert_eq!(backend.deprovisioned.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_recreate_restores_identity() {
    let backups = Arc::new(MemoryBackupStore::new());
    let original = harness_with(
        THREE_ZONES,
        (30000, 30009),
        Duration::ZERO,
        Arc::new(MemoryStore::new()),
        backups.clone(),
    );
    let id = provision_and_wait(&original, "inst-1", 2).await;
    let before = original
        .broker
        .state_store()
        .load_cluster(&id)
        .await
        .unwrap();

    // the shared store is lost, the backups survive
    let rebuilt = harness_with(
        THREE_ZONES,
        (30000, 30009),
        Duration::ZERO,
        Arc::new(MemoryStore::new()),
        backups,
    );
    rebuilt
        .broker
        .provision(id.clone(), ProvisionDetails::default())
        .await
        .unwrap();
    rebuilt.broker.wait_idle(&id).await;

    let after = rebuilt.broker.state_store().load_cluster(&id).await.unwrap();
    assert_eq!(after.recreation_data(), before.recreation_data());
    assert_eq!(after.node_count(), 2);
    assert_eq!(after.scheduling_info.status, SchedulingStatus::Success);
    assert_eq!(
        rebuilt.broker.router().port_allocation(&id).await.unwrap(),
        Some(before.allocated_port)
    );

    let binding = rebuilt.broker.bind(id, "b-1").await.unwrap();
    assert_eq!(binding.credentials.password, before.app_credentials.password);
    assert_eq!(binding.credentials.port, before.allocated_port);
}

#[tokio::test]
async fn test_recreate_preconditions() {
    let h = harness(THREE_ZONES);
    let id = provision_and_wait(&h, "inst-1", 1).await;

    let err = h.broker.recreate(id).await.unwrap_err();
    assert!(matches!(err, BrokerError::Conflict(_)));

    let err = h.broker.recreate(ClusterId::from("never-existed")).await.unwrap_err();
    assert!(matches!(err, BrokerError::NotFound(_)));
}

fn backed_up_identity(id: &str, port: u16, target_node_count: i64) -> ClusterRecreationData {
    let mut state = pgbroker::cluster::ClusterState::new(id);
    state.service_id = "svc".to_string();
    state.plan_id = "plan".to_string();
    state.allocated_port = port;
    state.target_node_count = target_node_count;
    state.recreation_data()
}

#[tokio::test]
async fn test_recreate_with_taken_port_is_reported() {
    let h = harness(THREE_ZONES);
    let other = ClusterId::from("other");
    h.broker
        .router()
        .assign_port_to_cluster(&other, 30000)
        .await
        .unwrap();
    h.backups
        .write_recreation_data(&backed_up_identity("inst-1", 30000, 1))
        .await
        .unwrap();

    let id = ClusterId::from("inst-1");
    h.broker.recreate(id.clone()).await.unwrap();
    h.broker.wait_idle(&id).await;

    let info = h.broker.last_operation(id.clone()).await.unwrap();
    assert_eq!(info.status, SchedulingStatus::Failed);
    assert!(
        info.last_message.starts_with("reclaiming public port 30000 failed"),
        "{}",
        info.last_message
    );

    // the other instance keeps its port and no node was started
    assert_eq!(h.broker.router().port_allocation(&other).await.unwrap(), Some(30000));
    assert_eq!(h.broker.router().port_allocation(&id).await.unwrap(), None);
    let provisioned: usize = h
        .backends
        .iter()
        .map(|b| b.provisioned.load(Ordering::SeqCst))
        .sum();
    assert_eq!(provisioned, 0);

    // the failed instance can be cleaned out without touching the port
    h.broker
        .deprovision(id.clone(), deprovision_details())
        .await
        .unwrap();
    h.broker.wait_idle(&id).await;
    assert!(!h.broker.state_store().cluster_exists(&id).await.unwrap());
    assert_eq!(h.broker.router().port_allocation(&other).await.unwrap(), Some(30000));
}

#[tokio::test]
async fn test_recreate_of_legacy_backup_records_one_node() {
    let h = harness(THREE_ZONES);
    let legacy = backed_up_identity("inst-1", 30004, 0);
    h.backups.write_recreation_data(&legacy).await.unwrap();

    let id = ClusterId::from("inst-1");
    h.broker.recreate(id.clone()).await.unwrap();
    h.broker.wait_idle(&id).await;

    let state = h.broker.state_store().load_cluster(&id).await.unwrap();
    assert_eq!(state.scheduling_info.status, SchedulingStatus::Success);
    assert_eq!(state.node_count(), 1);

    // backups without a target count are rebuilt with one node, and the
    // rebuilt identity records that count
    let expected = ClusterRecreationData {
        target_node_count: 1,
        ..legacy
    };
    assert_eq!(state.recreation_data(), expected);
    assert_eq!(h.backups.restore_recreation_data(&id).await.unwrap(), expected);
}

#[tokio::test]
async fn test_bind_and_unbind() {
    let h = harness(THREE_ZONES);
    let id = provision_and_wait(&h, "inst-1", 1).await;
    let state = h.broker.state_store().load_cluster(&id).await.unwrap();

    let binding = h.broker.bind(id.clone(), "b-1").await.unwrap();
    let creds = binding.credentials;
    assert_eq!(creds.host, "pg.example.com");
    assert_eq!(creds.port, 30000);
    assert_eq!(creds.username, "appuser");
    assert_eq!(creds.password, state.app_credentials.password);
    assert_eq!(creds.superuser_username, "postgres");
    assert_eq!(
        creds.uri,
        format!(
            "postgres://appuser:{}@pg.example.com:30000/postgres",
            state.app_credentials.password
        )
    );

    h.broker.unbind(id, "b-1").await.unwrap();
    let err = h
        .broker
        .unbind(ClusterId::from("nope"), "b-1")
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::NotFound(_)));
}

/// Backup store that loses everything written to it
struct ForgetfulBackups;

#[async_trait]
impl BackupStore for ForgetfulBackups {
    async fn write_recreation_data(&self, _data: &ClusterRecreationData) -> Result<(), BackupError> {
        Ok(())
    }

    async fn restore_recreation_data(&self, id: &ClusterId) -> Result<ClusterRecreationData, BackupError> {
        Err(BackupError::NotFound(id.clone()))
    }
}

#[tokio::test]
async fn test_provision_refused_without_usable_backup() {
    let kv: SharedKvStore = Arc::new(MemoryStore::new());
    let backend = Arc::new(SupervisedBackend::new("cell-a", "z1", kv.clone(), Duration::ZERO));
    let broker = Broker::new(
        config(&[("cell-a", "z1")], (30000, 30000)),
        kv,
        Backends::new(vec![backend.clone() as SharedBackend]),
        Arc::new(ForgetfulBackups),
    );
    let id = ClusterId::from("inst-1");

    let err = broker
        .provision(id.clone(), provision_details(1))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Internal(_)));

    // the claim and the port are released again
    assert!(!broker.state_store().cluster_exists(&id).await.unwrap());
    assert_eq!(broker.router().allocate_port().await.unwrap(), 30000);
    assert_eq!(backend.provisioned.load(Ordering::SeqCst), 0);
}
