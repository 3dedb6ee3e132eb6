//! Provisioning backends
//!
//! A backend is a pool of hosts in one availability zone that can start and
//! stop PostgreSQL nodes on request. Backends are static configuration; the
//! broker never mutates them.

pub mod http;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::cluster::{ClusterId, Node, Role};
use crate::config::BackendConfig;

pub use http::HttpBackend;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("Request to backend {backend} failed: {message}")]
    Request { backend: String, message: String },

    #[error("Backend {backend} returned {status}: {message}")]
    Api {
        backend: String,
        status: u16,
        message: String,
    },

    #[error("Backend {0} is misconfigured: {1}")]
    Config(String, String),
}

/// Everything a backend needs to start one node
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionRequest {
    pub instance_id: ClusterId,
    pub node_id: String,
    pub plan_id: String,
    pub service_id: String,
    pub role: Role,
}

// ============================================================================
// SBIO: Trait for abstraction (allows fake backends in tests)
// ============================================================================

#[async_trait]
pub trait NodeBackend: Send + Sync {
    fn guid(&self) -> &str;

    fn availability_zone(&self) -> &str;

    /// Start a node and return its record
    async fn provision_node(&self, request: &ProvisionRequest) -> Result<Node, BackendError>;

    /// Stop and remove a node
    async fn deprovision_node(&self, instance_id: &ClusterId, node: &Node)
        -> Result<(), BackendError>;
}

pub type SharedBackend = Arc<dyn NodeBackend>;

/// The configured set of backends, in configuration order
#[derive(Clone, Default)]
pub struct Backends {
    backends: Vec<SharedBackend>,
}

impl Backends {
    pub fn new(backends: Vec<SharedBackend>) -> Self {
        Self { backends }
    }

    /// Build HTTP backends from configuration
    pub fn from_config(configs: &[BackendConfig]) -> Result<Self, BackendError> {
        let backends = configs
            .iter()
            .map(|c| HttpBackend::new(c.clone()).map(|b| Arc::new(b) as SharedBackend))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { backends })
    }

    pub fn all(&self) -> &[SharedBackend] {
        &self.backends
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn get(&self, guid: &str) -> Option<SharedBackend> {
        self.backends.iter().find(|b| b.guid() == guid).cloned()
    }

    pub fn contains(&self, guid: &str) -> bool {
        self.backends.iter().any(|b| b.guid() == guid)
    }

    /// Availability zones offered by the backends, deduplicated and sorted
    pub fn azs(&self) -> Vec<String> {
        self.backends
            .iter()
            .map(|b| b.availability_zone().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Availability zone of the backend with `guid`
    pub fn az_of(&self, guid: &str) -> Option<String> {
        self.get(guid).map(|b| b.availability_zone().to_string())
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// In-process backend recording calls
    pub struct MockBackend {
        guid: String,
        az: String,
        fail: AtomicBool,
        pub provisioned: AtomicUsize,
        pub deprovisioned: AtomicUsize,
    }

    impl MockBackend {
        pub fn new(guid: &str, az: &str) -> Self {
            Self {
                guid: guid.to_string(),
                az: az.to_string(),
                fail: AtomicBool::new(false),
                provisioned: AtomicUsize::new(0),
                deprovisioned: AtomicUsize::new(0),
            }
        }

        pub fn failing(self) -> Self {
            self.fail.store(true, Ordering::SeqCst);
            self
        }

        pub fn set_failing(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }

        fn check(&self) -> Result<(), BackendError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(BackendError::Api {
                    backend: self.guid.clone(),
                    status: 500,
                    message: "mock failure".to_string(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl NodeBackend for MockBackend {
        fn guid(&self) -> &str {
            &self.guid
        }

        fn availability_zone(&self) -> &str {
            &self.az
        }

        async fn provision_node(&self, request: &ProvisionRequest) -> Result<Node, BackendError> {
            self.check()?;
            self.provisioned.fetch_add(1, Ordering::SeqCst);
            Ok(Node {
                id: request.node_id.clone(),
                backend_id: self.guid.clone(),
                plan_id: request.plan_id.clone(),
                service_id: request.service_id.clone(),
                role: request.role,
            })
        }

        async fn deprovision_node(
            &self,
            _instance_id: &ClusterId,
            _node: &Node,
        ) -> Result<(), BackendError> {
            self.check()?;
            self.deprovisioned.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Backends `(guid, az)` as a registry plus handles to the mocks
    pub fn backends(specs: &[(&str, &str)]) -> (Backends, Vec<Arc<MockBackend>>) {
        let mocks: Vec<Arc<MockBackend>> = specs
            .iter()
            .map(|(guid, az)| Arc::new(MockBackend::new(guid, az)))
            .collect();
        let shared = mocks.iter().map(|m| m.clone() as SharedBackend).collect();
        (Backends::new(shared), mocks)
    }
}
