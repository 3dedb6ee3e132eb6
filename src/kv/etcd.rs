//! etcd v2 keys API client
//!
//! Talks to `<endpoint>/v2/keys/<prefix>/<key>` over HTTP. The broker only
//! needs the small subset of the v2 API used below: plain get/set/delete,
//! `prevExist=false` for atomic creation, directory listing and recursive
//! directory deletion.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;

use super::{normalize_key, KvEntry, KvError, KvStore};

/// etcd error code for "Key not found"
const ETCD_KEY_NOT_FOUND: u32 = 100;

/// etcd error code for "Key already exists"
const ETCD_NODE_EXIST: u32 = 105;

// ============================================================================
// Data structures (pure, no I/O)
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
struct EtcdResponse {
    node: EtcdNode,
}

#[derive(Debug, Clone, Deserialize)]
struct EtcdNode {
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    nodes: Vec<EtcdNode>,
}

#[derive(Debug, Clone, Deserialize)]
struct EtcdErrorBody {
    #[serde(rename = "errorCode")]
    error_code: u32,
    #[serde(default)]
    message: String,
    #[serde(default)]
    cause: String,
}

/// Strip the store prefix from a key returned by etcd
fn relative_key(prefix: &str, absolute: &str) -> String {
    let absolute = normalize_key(absolute);
    if prefix.is_empty() {
        return absolute;
    }
    absolute
        .strip_prefix(prefix)
        .map(|rest| rest.trim_start_matches('/').to_string())
        .unwrap_or(absolute)
}

/// Convert an etcd directory listing into sorted entries
fn entries_from_node(prefix: &str, node: EtcdNode) -> Vec<KvEntry> {
    let mut entries: Vec<KvEntry> = node
        .nodes
        .into_iter()
        .map(|child| KvEntry {
            key: relative_key(prefix, &child.key),
            value: if child.dir {
                None
            } else {
                Some(child.value.unwrap_or_default())
            },
        })
        .collect();
    entries.sort_by(|a, b| a.key.cmp(&b.key));
    entries
}

// ============================================================================
// SBIO: I/O implementation
// ============================================================================

#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
    endpoint: String,
    prefix: String,
}

impl EtcdStore {
    /// Create a client for `endpoint` (e.g. `http://127.0.0.1:2379`) that
    /// roots all keys under `prefix`.
    pub fn new(endpoint: &str, prefix: &str, timeout: Duration) -> Result<Self, KvError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| KvError::Http(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            prefix: normalize_key(prefix),
        })
    }

    fn url(&self, key: &str) -> String {
        let key = normalize_key(key);
        match (self.prefix.is_empty(), key.is_empty()) {
            (true, _) => format!("{}/v2/keys/{}", self.endpoint, key),
            (false, true) => format!("{}/v2/keys/{}", self.endpoint, self.prefix),
            (false, false) => format!("{}/v2/keys/{}/{}", self.endpoint, self.prefix, key),
        }
    }

    async fn send(&self, key: &str, request: reqwest::RequestBuilder) -> Result<Response, KvError> {
        let response = request
            .send()
            .await
            .map_err(|e| KvError::Http(e.to_string()))?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let body: Option<EtcdErrorBody> = serde_json::from_str(&text).ok();

        match body {
            Some(b) if b.error_code == ETCD_KEY_NOT_FOUND => Err(KvError::NotFound(normalize_key(key))),
            Some(b) if b.error_code == ETCD_NODE_EXIST => {
                Err(KvError::AlreadyExists(normalize_key(key)))
            }
            Some(b) => Err(KvError::Api {
                status: status.as_u16(),
                message: format!("{} ({})", b.message, b.cause),
            }),
            None if status == StatusCode::NOT_FOUND => Err(KvError::NotFound(normalize_key(key))),
            None => Err(KvError::Api {
                status: status.as_u16(),
                message: text,
            }),
        }
    }

    async fn get_node(&self, key: &str) -> Result<EtcdNode, KvError> {
        let response = self.send(key, self.client.get(self.url(key))).await?;
        let body: EtcdResponse = response
            .json()
            .await
            .map_err(|e| KvError::Decode(e.to_string()))?;
        Ok(body.node)
    }
}

#[async_trait]
impl KvStore for EtcdStore {
    async fn get(&self, key: &str) -> Result<String, KvError> {
        let node = self.get_node(key).await?;
        if node.dir {
            return Err(KvError::Decode(format!("{} is a directory", node.key)));
        }
        Ok(node.value.unwrap_or_default())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let request = self.client.put(self.url(key)).form(&[("value", value)]);
        self.send(key, request).await.map(|_| ())
    }

    async fn create(&self, key: &str, value: &str) -> Result<(), KvError> {
        let request = self
            .client
            .put(self.url(key))
            .query(&[("prevExist", "false")])
            .form(&[("value", value)]);
        self.send(key, request).await.map(|_| ())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.send(key, self.client.delete(self.url(key)))
            .await
            .map(|_| ())
    }

    async fn delete_dir(&self, dir: &str) -> Result<(), KvError> {
        let request = self
            .client
            .delete(self.url(dir))
            .query(&[("recursive", "true")]);
        self.send(dir, request).await.map(|_| ())
    }

    async fn list(&self, dir: &str) -> Result<Vec<KvEntry>, KvError> {
        let node = self.get_node(dir).await?;
        if !node.dir {
            return Err(KvError::Decode(format!("{} is not a directory", node.key)));
        }
        Ok(entries_from_node(&self.prefix, node))
    }

    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        match self.get_node(key).await {
            Ok(node) => Ok(!node.dir || !node.nodes.is_empty()),
            Err(KvError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
