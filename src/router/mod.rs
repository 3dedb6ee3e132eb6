//! Public port allocation
//!
//! Every cluster is reachable through one public port on the routing tier.
//! Ports are reserved in the shared store so that every broker process sees
//! the same allocations:
//!
//! ```text
//! routing/ports/<port>           reservation; value is the owning instance ("" until assigned)
//! routing/allocation/<instance>  decimal port assigned to the instance
//! ```
//!
//! Reservations are made with the store's atomic set-if-absent, so two
//! allocations can never return the same port.

use std::collections::HashSet;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cluster::ClusterId;
use crate::config::RoutingConfig;
use crate::kv::{KvError, SharedKvStore};

pub const ALLOCATION_DIR: &str = "routing/allocation";
pub const PORTS_DIR: &str = "routing/ports";

pub fn allocation_key(id: &ClusterId) -> String {
    format!("{}/{}", ALLOCATION_DIR, id)
}

pub fn port_key(port: u16) -> String {
    format!("{}/{}", PORTS_DIR, port)
}

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("No free public port in range {min}-{max}")]
    Exhausted { min: u16, max: u16 },

    #[error("Instance {instance} is already assigned port {existing}, cannot assign {requested}")]
    PortConflict {
        instance: ClusterId,
        existing: u16,
        requested: u16,
    },

    #[error("Port {port} is owned by instance {owner}")]
    PortTaken { port: u16, owner: String },

    #[error("Invalid port value '{0}'")]
    InvalidPort(String),

    #[error("Timed out waiting for port allocation of {instance} after {attempts} attempts")]
    Timeout { instance: ClusterId, attempts: u32 },

    #[error("Store error: {0}")]
    Store(#[from] KvError),
}

fn parse_port(value: &str) -> Result<u16, RouterError> {
    value
        .trim()
        .parse::<u16>()
        .map_err(|_| RouterError::InvalidPort(value.to_string()))
}

#[derive(Clone)]
pub struct Router {
    kv: SharedKvStore,
    config: RoutingConfig,
}

impl Router {
    pub fn new(kv: SharedKvStore, config: RoutingConfig) -> Self {
        Self { kv, config }
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    /// Reserve an unused port from the configured range
    pub async fn allocate_port(&self) -> Result<u16, RouterError> {
        let reserved: HashSet<u16> = match self.kv.list(PORTS_DIR).await {
            Ok(entries) => entries
                .iter()
                .filter_map(|e| e.name().parse::<u16>().ok())
                .collect(),
            Err(KvError::NotFound(_)) => HashSet::new(),
            Err(e) => return Err(e.into()),
        };

        for port in self.config.port_min..=self.config.port_max {
            if reserved.contains(&port) {
                continue;
            }
            match self.kv.create(&port_key(port), "").await {
                Ok(()) => {
                    debug!("Reserved public port {}", port);
                    return Ok(port);
                }
                // lost a race with another broker
                Err(KvError::AlreadyExists(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        warn!(
            "Public port range {}-{} exhausted",
            self.config.port_min, self.config.port_max
        );
        Err(RouterError::Exhausted {
            min: self.config.port_min,
            max: self.config.port_max,
        })
    }

    /// Return a reserved but never assigned port to the pool
    pub async fn release_port(&self, port: u16) -> Result<(), RouterError> {
        match self.kv.get(&port_key(port)).await {
            Ok(owner) if owner.is_empty() => match self.kv.delete(&port_key(port)).await {
                Ok(()) | Err(KvError::NotFound(_)) => Ok(()),
                Err(e) => Err(e.into()),
            },
            Ok(owner) => Err(RouterError::PortTaken { port, owner }),
            Err(KvError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Durably map an instance to a port.
    ///
    /// Re-assigning the same port is a no-op; assigning a different port to
    /// an already mapped instance is an error. A port that is not reserved
    /// yet (restoring from backup) is reserved on the way.
    pub async fn assign_port_to_cluster(&self, id: &ClusterId, port: u16) -> Result<(), RouterError> {
        match self.kv.get(&allocation_key(id)).await {
            Ok(value) => {
                let existing = parse_port(&value)?;
                if existing != port {
                    return Err(RouterError::PortConflict {
                        instance: id.clone(),
                        existing,
                        requested: port,
                    });
                }
            }
            Err(KvError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        match self.kv.create(&port_key(port), id.as_str()).await {
            Ok(()) => {}
            Err(KvError::AlreadyExists(_)) => {
                let owner = self.kv.get(&port_key(port)).await?;
                if !owner.is_empty() && owner != id.as_str() {
                    return Err(RouterError::PortTaken { port, owner });
                }
                self.kv.set(&port_key(port), id.as_str()).await?;
            }
            Err(e) => return Err(e.into()),
        }

        self.kv.set(&allocation_key(id), &port.to_string()).await?;
        info!("Assigned public port {} to {}", port, id);
        Ok(())
    }

    /// Delete the instance's mapping and return its port to the free pool
    pub async fn remove_cluster_assignment(&self, id: &ClusterId) -> Result<(), RouterError> {
        match self.kv.delete(&allocation_key(id)).await {
            Ok(()) | Err(KvError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let entries = match self.kv.list(PORTS_DIR).await {
            Ok(entries) => entries,
            Err(KvError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            if entry.value.as_deref() == Some(id.as_str()) {
                match self.kv.delete(&entry.key).await {
                    Ok(()) | Err(KvError::NotFound(_)) => {
                        info!("Released public port {} of {}", entry.name(), id);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    /// Port currently mapped to the instance, if any
    pub async fn port_allocation(&self, id: &ClusterId) -> Result<Option<u16>, RouterError> {
        match self.kv.get(&allocation_key(id)).await {
            Ok(value) => parse_port(&value).map(Some),
            Err(KvError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Poll the instance's mapping until it appears.
    ///
    /// Polls every `wait_interval` for at most `wait_attempts` attempts, and
    /// never longer than `timeout`.
    pub async fn wait_for_routing_port_allocation(
        &self,
        id: &ClusterId,
        timeout: Duration,
    ) -> Result<u16, RouterError> {
        let attempts = self.config.wait_attempts;
        let interval = self.config.wait_interval();

        let poll = async {
            for attempt in 1..=attempts {
                match self.port_allocation(id).await {
                    Ok(Some(port)) => return Some(port),
                    Ok(None) => debug!("Port allocation of {} not present (attempt {})", id, attempt),
                    Err(e) => debug!("Polling port allocation of {} failed: {}", id, e),
                }
                if attempt < attempts {
                    tokio::time::sleep(interval).await;
                }
            }
            None
        };

        match tokio::time::timeout(timeout, poll).await {
            Ok(Some(port)) => Ok(port),
            _ => {
                warn!("Timed out waiting for port allocation of {}", id);
                Err(RouterError::Timeout {
                    instance: id.clone(),
                    attempts,
                })
            }
        }
    }
}
