//! Command line interface.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::io::AsyncReadExt;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use voldr_id::{SnapshotId, VolumeId};
use voldr_provisioner::cloud::SimulatedCloud;
use voldr_provisioner::completion::write_completion;
use voldr_provisioner::config::Config;
use voldr_provisioner::notify::{LogSink, NotificationSink, Notifier, WebhookSink};
use voldr_provisioner::records::{SqliteTable, VolumeRecord, VolumeRecordStore};
use voldr_provisioner::{LaunchEvent, Provisioner, ScheduleTick, Snapshotter, WorkflowError};

/// voldr - keep the master volume attached wherever the fleet launches.
#[derive(Debug, Parser)]
#[command(name = "voldr")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// State fixture for the simulated compute provider.
    #[arg(
        long,
        global = true,
        env = "VOLDR_CLOUD_STATE",
        default_value = "cloud-state.json"
    )]
    cloud_state: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Provision a launched instance with the master volume.
    Provision(EventArgs),

    /// Snapshot the master volume.
    Snapshot(EventArgs),

    /// Inspect or seed the master volume record.
    #[command(subcommand)]
    Record(RecordCommand),
}

#[derive(Debug, Args)]
struct EventArgs {
    /// Trigger payload file. Read from stdin when omitted.
    #[arg(long)]
    event: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum RecordCommand {
    /// Print the master volume record.
    Show,

    /// Create or replace the master volume record.
    Seed {
        #[arg(long)]
        volume_id: VolumeId,

        /// Device path the volume is attached at.
        #[arg(long)]
        device: String,

        #[arg(long)]
        snapshot_id: Option<SnapshotId>,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let config = Config::from_env()?;
        init_tracing(&config.log_level);
        info!(
            region = %config.region,
            record_table = %config.record_table,
            data_dir = %config.data_dir.display(),
            cloud_state = %self.cloud_state.display(),
            "Configuration loaded"
        );

        let records = open_records(&config)?;

        match self.command {
            Commands::Provision(args) => {
                let cloud =
                    Arc::new(SimulatedCloud::load(&self.cloud_state, config.wait_policy()).await?);
                let provisioner = Provisioner::new(
                    cloud.clone(),
                    cloud.clone(),
                    records,
                    Notifier::new(notification_sink(&config)?, config.notify_topic.clone()),
                    config.provisioner_settings(),
                );

                let outcome = match read_payload(args.event.as_deref()).await {
                    Ok(payload) => match LaunchEvent::from_slice(&payload) {
                        Ok(event) => provisioner.run(&event).await,
                        Err(e) => Err(e),
                    },
                    Err(e) => Err(WorkflowError::InvalidEvent(format!("{:#}", e))),
                };

                cloud.save(&self.cloud_state).await?;
                write_completion(&mut std::io::stdout().lock(), outcome)
            }
            Commands::Snapshot(args) => {
                let cloud =
                    Arc::new(SimulatedCloud::load(&self.cloud_state, config.wait_policy()).await?);
                let snapshotter =
                    Snapshotter::new(cloud.clone(), records, config.snapshot_name.clone());

                let payload = read_payload(args.event.as_deref()).await?;
                let outcome = match ScheduleTick::from_slice(&payload) {
                    Ok(tick) => snapshotter.run(&tick).await,
                    Err(e) => Err(e),
                };

                cloud.save(&self.cloud_state).await?;
                write_completion(&mut std::io::stdout().lock(), outcome)
            }
            Commands::Record(RecordCommand::Show) => {
                let record = records.fetch().await?;
                println!("{}", serde_json::to_string_pretty(&record)?);
                Ok(())
            }
            Commands::Record(RecordCommand::Seed {
                volume_id,
                device,
                snapshot_id,
            }) => {
                let record = VolumeRecord {
                    snapshot_id,
                    ..VolumeRecord::new(volume_id, device)
                };
                let persisted = records.seed(&record).await?;
                println!("{}", serde_json::to_string_pretty(&persisted)?);
                Ok(())
            }
        }
    }
}

fn init_tracing(log_level: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| log_level.into()))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();
}

fn open_records(config: &Config) -> Result<VolumeRecordStore> {
    std::fs::create_dir_all(&config.data_dir).with_context(|| {
        format!("failed to create data directory {}", config.data_dir.display())
    })?;
    let table = SqliteTable::open(config.records_path(), &config.record_table)
        .context("failed to open record store")?;
    Ok(VolumeRecordStore::new(Arc::new(table)))
}

fn notification_sink(config: &Config) -> Result<Arc<dyn NotificationSink>> {
    match &config.notify_webhook_url {
        Some(url) => Ok(Arc::new(WebhookSink::new(url.clone())?)),
        None => Ok(Arc::new(LogSink)),
    }
}

async fn read_payload(path: Option<&Path>) -> Result<Vec<u8>> {
    match path {
        Some(path) => tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read event {}", path.display())),
        None => {
            let mut payload = Vec::new();
            tokio::io::stdin()
                .read_to_end(&mut payload)
                .await
                .context("failed to read event from stdin")?;
            Ok(payload)
        }
    }
}
