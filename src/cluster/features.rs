//! Desired cluster features parsed from provision/update parameters

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Node count used when a request does not specify one
pub const DEFAULT_NODE_COUNT: i64 = 2;

#[derive(Error, Debug, PartialEq)]
pub enum FeaturesError {
    #[error("node-count ({0}) must be a positive number")]
    NegativeNodeCount(i64),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
}

/// Desired topology of a cluster. Pure input, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ClusterFeatures {
    #[serde(rename = "node-count", default)]
    pub node_count: i64,

    /// Backend GUIDs the cluster is restricted to (empty = any backend)
    #[serde(rename = "cells", default)]
    pub cell_guids: Vec<String>,
}

impl ClusterFeatures {
    pub fn with_node_count(node_count: i64) -> Self {
        Self {
            node_count,
            cell_guids: Vec::new(),
        }
    }

    /// Parse request parameters, resolving an unset node count to the default.
    ///
    /// `null` or a missing object yields the defaults. A negative node count
    /// is rejected.
    pub fn from_parameters(params: Option<&serde_json::Value>) -> Result<Self, FeaturesError> {
        let features = match params {
            None | Some(serde_json::Value::Null) => ClusterFeatures::default(),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| FeaturesError::InvalidParameters(e.to_string()))?,
        };
        features.resolved()
    }

    /// Apply the default node count and reject negative values
    pub fn resolved(mut self) -> Result<Self, FeaturesError> {
        if self.node_count == 0 {
            self.node_count = DEFAULT_NODE_COUNT;
        }
        if self.node_count < 0 {
            return Err(FeaturesError::NegativeNodeCount(self.node_count));
        }
        Ok(self)
    }

    /// Resolved node count as an unsigned target
    pub fn target_nodes(&self) -> usize {
        self.node_count.max(0) as usize
    }
}
