//! Kernel hotplug events for the network subsystem.
//!
//! The [`monitor`] turns uevents into [`UdevEvent`]s on an unbounded channel;
//! the [`sync`] module consumes them to learn when freshly requested VFs have
//! actually appeared.
//!
//! # Example
//!
//! ```ignore
//! let mut handle = NetlinkMonitor::new("/sys").start()?;
//!
//! // ... write sriov_numvfs ...
//!
//! let mut links = PfVfLinks::default();
//! let seen = VfCreationSync::new()
//!     .wait(handle.events(), &mut links, "ens1f0", 4, false)
//!     .await;
//!
//! handle.stop();
//! ```

pub mod monitor;
pub mod sync;

pub use monitor::{EventMonitor, MonitorHandle, NetlinkMonitor};
pub use sync::{VfCreationSync, QUIET_PERIOD};

use std::collections::BTreeMap;
use std::path::PathBuf;

/// One hotplug notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdevEvent {
    /// `add`, `remove`, `change`, `move`, ...
    pub action: String,
    /// Absolute sysfs path of the device
    pub device_syspath: PathBuf,
}

/// Where a VF netdev was observed and which PF owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfLink {
    pub device_syspath: PathBuf,
    pub pf_name: String,
}

/// VF interface name to owning PF, accumulated over one provisioning run.
///
/// The first observation of a VF name wins; later ones are ignored.
#[derive(Debug, Default, Clone)]
pub struct PfVfLinks {
    links: BTreeMap<String, VfLink>,
}

impl PfVfLinks {
    /// Record a VF. Returns `false` if the name was already known.
    pub fn insert(&mut self, vf_name: &str, link: VfLink) -> bool {
        if self.links.contains_key(vf_name) {
            return false;
        }
        self.links.insert(vf_name.to_string(), link);
        true
    }

    pub fn contains(&self, vf_name: &str) -> bool {
        self.links.contains_key(vf_name)
    }

    pub fn get(&self, vf_name: &str) -> Option<&VfLink> {
        self.links.get(vf_name)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// VFs recorded for one PF, in name order.
    pub fn for_pf<'a>(&'a self, pf_name: &'a str) -> impl Iterator<Item = (&'a str, &'a VfLink)> {
        self.links
            .iter()
            .filter(move |(_, link)| link.pf_name == pf_name)
            .map(|(name, link)| (name.as_str(), link))
    }
}
