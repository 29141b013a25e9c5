//! `sriov_numvfs` control for a PF.
//!
//! The kernel refuses to change a non-zero VF count without first returning
//! it to zero, so [`NumVfsController::set`] never attempts that: it reports
//! the current count and lets the caller notice the divergence.

use crate::error::{Result, SriovError};
use crate::events::{MonitorHandle, PfVfLinks, VfCreationSync};
use crate::sysfs::Sysfs;
use tracing::{debug, info, instrument, warn};

/// Event channel and VF links of one provisioning run.
pub struct RunState {
    pub monitor: MonitorHandle,
    pub links: PfVfLinks,
}

impl RunState {
    pub fn new(monitor: MonitorHandle) -> Self {
        Self { monitor, links: PfVfLinks::default() }
    }

    /// Stop the monitor, keeping the accumulated links.
    pub fn finish(self) -> PfVfLinks {
        self.monitor.stop();
        self.links
    }
}

/// Reads and writes the VF count of PFs.
#[derive(Debug, Clone)]
pub struct NumVfsController {
    sysfs: Sysfs,
    sync: VfCreationSync,
}

impl NumVfsController {
    pub fn new(sysfs: Sysfs, sync: VfCreationSync) -> Self {
        Self { sysfs, sync }
    }

    /// Current VF count of `ifname`.
    pub fn get(&self, ifname: &str) -> Result<u32> {
        let path = self.sysfs.numvfs_path(ifname);
        debug!("{}: Getting numvfs for interface", ifname);

        let raw = self.sysfs.read_attr(&path).map_err(|e| SriovError::NumVfs {
            iface: ifname.to_string(),
            reason: format!("unable to read numvfs: {}", e),
        })?;
        let numvfs = raw.parse().map_err(|_| SriovError::NumVfs {
            iface: ifname.to_string(),
            reason: format!("unexpected sriov_numvfs content {:?}", raw),
        })?;

        debug!("{}: Interface has {} configured", ifname, numvfs);
        Ok(numvfs)
    }

    /// Set the VF count of `ifname` to `numvfs`.
    ///
    /// # Returns
    /// The VF count after the call. This differs from `numvfs` only when the
    /// PF already had a different non-zero count, which is left untouched.
    ///
    /// # Errors
    /// `SriovError::NumVfs` if the count cannot be read or written, or if the
    /// kernel does not report `numvfs` after the write.
    #[instrument(skip(self, run))]
    pub async fn set(&self, ifname: &str, numvfs: u32, vdpa: bool, run: &mut RunState) -> Result<u32> {
        let current = self.get(ifname)?;
        debug!("{}: Interface has {} configured, setting to {}", ifname, current, numvfs);

        if current == numvfs {
            return Ok(current);
        }
        if current != 0 {
            warn!("{}: Numvfs already configured to {}", ifname, current);
            return Ok(current);
        }

        let path = self.sysfs.numvfs_path(ifname);
        self.sysfs.write_attr(&path, &numvfs.to_string()).map_err(|e| SriovError::NumVfs {
            iface: ifname.to_string(),
            reason: format!("unable to write numvfs {}: {}", numvfs, e),
        })?;

        self.sync.wait(run.monitor.events(), &mut run.links, ifname, numvfs, vdpa).await;

        let current = self.get(ifname)?;
        if current != numvfs {
            return Err(SriovError::NumVfs {
                iface: ifname.to_string(),
                reason: format!(
                    "sriov_numvfs reports {} after requesting {} VFs",
                    current, numvfs
                ),
            });
        }

        info!("{}: Configured {} VFs", ifname, numvfs);
        Ok(current)
    }
}
