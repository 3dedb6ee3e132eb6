//! Backups of cluster identities
//!
//! Each cluster's `ClusterRecreationData` is written to a durable store
//! outside the shared key-value store, so a cluster can be recreated after
//! its live state is lost. The production store runs operator-provided
//! commands; the memory store serves development and tests.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::cluster::{ClusterId, ClusterRecreationData};
use crate::config::CallbacksConfig;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("No backup found for service instance {0}")]
    NotFound(ClusterId),

    #[error("Backup command '{command}' failed: {message}")]
    Command { command: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid backup data: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ============================================================================
// SBIO: Trait for abstraction (allows in-memory backups in tests)
// ============================================================================

#[async_trait]
pub trait BackupStore: Send + Sync {
    async fn write_recreation_data(&self, data: &ClusterRecreationData) -> Result<(), BackupError>;

    async fn restore_recreation_data(
        &self,
        id: &ClusterId,
    ) -> Result<ClusterRecreationData, BackupError>;
}

pub type SharedBackupStore = Arc<dyn BackupStore>;

/// Backups kept in process memory
#[derive(Clone, Default)]
pub struct MemoryBackupStore {
    backups: Arc<DashMap<ClusterId, ClusterRecreationData>>,
}

impl MemoryBackupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.backups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backups.is_empty()
    }
}

#[async_trait]
impl BackupStore for MemoryBackupStore {
    async fn write_recreation_data(&self, data: &ClusterRecreationData) -> Result<(), BackupError> {
        self.backups.insert(data.instance_id.clone(), data.clone());
        Ok(())
    }

    async fn restore_recreation_data(
        &self,
        id: &ClusterId,
    ) -> Result<ClusterRecreationData, BackupError> {
        self.backups
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BackupError::NotFound(id.clone()))
    }
}

/// Backups handled by external commands.
///
/// Both commands get the instance id appended as their last argument. The
/// backup command reads the recreation data as JSON from stdin; the restore
/// command prints it to stdout, or prints nothing when no backup exists.
#[derive(Debug, Clone)]
pub struct CommandBackupStore {
    config: CallbacksConfig,
}

impl CommandBackupStore {
    pub fn new(config: CallbacksConfig) -> Self {
        Self { config }
    }

    fn command(argv: &[String], id: &ClusterId) -> Result<Command, BackupError> {
        let (program, args) = argv.split_first().ok_or_else(|| BackupError::Command {
            command: String::new(),
            message: "empty command".to_string(),
        })?;
        let mut cmd = Command::new(program);
        cmd.args(args).arg(id.as_str());
        Ok(cmd)
    }

    fn failure(argv: &[String], stderr: &[u8]) -> BackupError {
        BackupError::Command {
            command: argv.join(" "),
            message: String::from_utf8_lossy(stderr).trim().to_string(),
        }
    }
}

#[async_trait]
impl BackupStore for CommandBackupStore {
    async fn write_recreation_data(&self, data: &ClusterRecreationData) -> Result<(), BackupError> {
        let payload = serde_json::to_vec(data)?;
        let mut child = Self::command(&self.config.backup_cmd, &data.instance_id)?
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(Self::failure(&self.config.backup_cmd, &output.stderr));
        }
        info!("Backed up recreation data of {}", data.instance_id);
        Ok(())
    }

    async fn restore_recreation_data(
        &self,
        id: &ClusterId,
    ) -> Result<ClusterRecreationData, BackupError> {
        let output = Self::command(&self.config.restore_cmd, id)?
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            return Err(Self::failure(&self.config.restore_cmd, &output.stderr));
        }
        if output.stdout.iter().all(u8::is_ascii_whitespace) {
            return Err(BackupError::NotFound(id.clone()));
        }

        debug!("Restored recreation data of {}", id);
        Ok(serde_json::from_slice(&output.stdout)?)
    }
}
