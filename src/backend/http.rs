//! HTTP backend client
//!
//! Each backend exposes a small REST API:
//!
//! - `PUT    <uri>/api/v1/clusters/<instance>/nodes/<node>` starts a node
//! - `DELETE <uri>/api/v1/clusters/<instance>/nodes/<node>` stops it
//!
//! Requests use HTTP basic auth with the backend's configured credentials.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

use super::{BackendError, NodeBackend, ProvisionRequest};
use crate::cluster::{ClusterId, Node, Role};
use crate::config::BackendConfig;

/// Default timeout for a single backend call
const REQUEST_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Serialize)]
struct NodeRequestBody<'a> {
    node_id: &'a str,
    plan_id: &'a str,
    service_id: &'a str,
    role: Role,
}

#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    config: BackendConfig,
}

impl HttpBackend {
    pub fn new(config: BackendConfig) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| BackendError::Config(config.guid.clone(), e.to_string()))?;
        Ok(Self { client, config })
    }

    fn node_url(&self, instance_id: &ClusterId, node_id: &str) -> String {
        format!(
            "{}/api/v1/clusters/{}/nodes/{}",
            self.config.uri.trim_end_matches('/'),
            instance_id,
            node_id
        )
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.config.username.is_empty() {
            request
        } else {
            request.basic_auth(&self.config.username, Some(&self.config.password))
        }
    }

    async fn check(&self, response: reqwest::Response) -> Result<(), BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(BackendError::Api {
            backend: self.config.guid.clone(),
            status: status.as_u16(),
            message,
        })
    }

    fn request_error(&self, e: reqwest::Error) -> BackendError {
        BackendError::Request {
            backend: self.config.guid.clone(),
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl NodeBackend for HttpBackend {
    fn guid(&self) -> &str {
        &self.config.guid
    }

    fn availability_zone(&self) -> &str {
        &self.config.availability_zone
    }

    async fn provision_node(&self, request: &ProvisionRequest) -> Result<Node, BackendError> {
        let url = self.node_url(&request.instance_id, &request.node_id);
        debug!("Provisioning node {} via {}", request.node_id, url);

        let body = NodeRequestBody {
            node_id: &request.node_id,
            plan_id: &request.plan_id,
            service_id: &request.service_id,
            role: request.role,
        };

        let response = self
            .authorize(self.client.put(&url).json(&body))
            .send()
            .await
            .map_err(|e| self.request_error(e))?;
        self.check(response).await?;

        Ok(Node {
            id: request.node_id.clone(),
            backend_id: self.config.guid.clone(),
            plan_id: request.plan_id.clone(),
            service_id: request.service_id.clone(),
            role: request.role,
        })
    }

    async fn deprovision_node(
        &self,
        instance_id: &ClusterId,
        node: &Node,
    ) -> Result<(), BackendError> {
        let url = self.node_url(instance_id, &node.id);
        debug!("Deprovisioning node {} via {}", node.id, url);

        let response = self
            .authorize(self.client.delete(&url))
            .send()
            .await
            .map_err(|e| self.request_error(e))?;
        self.check(response).await
    }
}
