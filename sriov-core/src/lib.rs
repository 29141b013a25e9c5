//! SR-IOV Core Library
//!
//! Partitions physical functions into virtual functions, moves Mellanox
//! eswitches to switchdev, keeps the udev rules that name representors, and
//! tunes per-VF link attributes.

pub mod bind;
pub mod command;
pub mod config;
pub mod error;
pub mod events;
pub mod numvfs;
pub mod observability;
pub mod orchestrator;
pub mod paths;
pub mod switchdev;
pub mod sysfs;
pub mod udev;
pub mod vf;

#[cfg(test)]
mod testing;

// Re-export commonly used items
pub use command::{CommandRunner, Invocation, SystemCommandRunner};
pub use config::{LinkMode, PfDescriptor, SriovConfig, VfDescriptor};
pub use error::{Result, SriovError};
pub use observability::init as init_observability;
pub use orchestrator::{ProvisionOptions, ProvisionReport, Provisioner};
pub use paths::Paths;
