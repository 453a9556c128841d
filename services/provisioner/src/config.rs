//! Configuration for the provisioner.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use voldr_reconcile::{WaitPolicy, DEFAULT_WAIT_INTERVAL, DEFAULT_WAIT_TIMEOUT};

use crate::cloud::OutputConfig;
use crate::provision::ProvisionerSettings;

/// Provisioner configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Provider region.
    pub region: String,

    /// Record store table holding the master volume record.
    pub record_table: String,

    /// Topic failure notifications are published to.
    pub notify_topic: String,

    /// Remote command document that mounts the attached device.
    pub mount_document: String,

    /// Data directory for local state.
    pub data_dir: PathBuf,

    /// Webhook that receives notifications. Notifications are only logged
    /// when unset.
    pub notify_webhook_url: Option<String>,

    /// Upper bound for each provider wait.
    pub wait_timeout: Duration,

    /// Delay between provider wait polls.
    pub wait_interval: Duration,

    /// Volume type for replicas.
    pub volume_type: Option<String>,

    /// `Name` tag for snapshots.
    pub snapshot_name: String,

    pub command_output_bucket: Option<String>,
    pub command_output_prefix: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &str| var(key).with_context(|| format!("{} must be set", key));
        let secs = |key: &str, default: Duration| -> Result<Duration> {
            match var(key) {
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .with_context(|| format!("{} must be a whole number of seconds", key)),
                None => Ok(default),
            }
        };

        let wait_timeout = secs("VOLDR_WAIT_TIMEOUT_SECS", DEFAULT_WAIT_TIMEOUT)?;
        let wait_interval = secs("VOLDR_WAIT_INTERVAL_SECS", DEFAULT_WAIT_INTERVAL)?;
        if wait_interval.is_zero() {
            bail!("VOLDR_WAIT_INTERVAL_SECS must be greater than zero");
        }

        Ok(Self {
            region: var("VOLDR_REGION").unwrap_or_else(|| "ap-southeast-2".to_string()),
            record_table: var("VOLDR_RECORD_TABLE").unwrap_or_else(|| "master-volume".to_string()),
            notify_topic: required("VOLDR_NOTIFY_TOPIC")?,
            mount_document: required("VOLDR_MOUNT_DOCUMENT")?,
            data_dir: var("VOLDR_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/var/lib/voldr")),
            notify_webhook_url: var("VOLDR_NOTIFY_WEBHOOK_URL"),
            wait_timeout,
            wait_interval,
            volume_type: var("VOLDR_VOLUME_TYPE"),
            snapshot_name: var("VOLDR_SNAPSHOT_NAME")
                .unwrap_or_else(|| "master-volume".to_string()),
            command_output_bucket: var("VOLDR_COMMAND_OUTPUT_BUCKET"),
            command_output_prefix: var("VOLDR_COMMAND_OUTPUT_PREFIX"),
            log_level: var("VOLDR_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    pub fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy::new(self.wait_timeout, self.wait_interval)
    }

    /// Path of the record store database.
    pub fn records_path(&self) -> PathBuf {
        self.data_dir.join("records.db")
    }

    pub fn provisioner_settings(&self) -> ProvisionerSettings {
        ProvisionerSettings {
            mount_document: self.mount_document.clone(),
            snapshot_name: self.snapshot_name.clone(),
            volume_type: self.volume_type.clone(),
            command_output: OutputConfig {
                bucket: self.command_output_bucket.clone(),
                key_prefix: self.command_output_prefix.clone(),
            },
        }
    }
}
