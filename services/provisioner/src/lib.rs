//! voldr provisioner library.
//!
//! Keeps one master data volume attached to whichever instance an
//! auto-scaling group launches, in whatever zone it lands.
//!
//! ## Workflows
//!
//! - **Provisioning** ([`provision`]): on an instance-launch event, attach the
//!   master volume to the instance, replicating it into the instance's zone
//!   first when needed, then dispatch the mount command.
//! - **Snapshot** ([`snapshot`]): on a schedule, snapshot the master volume so
//!   a lost volume can be restored.
//!
//! ## Modules
//!
//! - `cloud`: compute and remote command interfaces, plus a simulated provider
//! - `records`: the singleton volume record and its stores
//! - `notify`: failure notification sinks
//! - `event`: trigger payload parsing
//! - `completion`: the JSON line each workflow run ends with

pub mod cloud;
pub mod completion;
pub mod config;
pub mod error;
pub mod event;
pub mod notify;
pub mod provision;
pub mod records;
pub mod snapshot;

pub use error::WorkflowError;
pub use event::{LaunchEvent, ScheduleTick};
pub use provision::{ProvisionState, Provisioner, ProvisionerSettings};
pub use snapshot::Snapshotter;
