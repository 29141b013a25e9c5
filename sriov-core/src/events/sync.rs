//! Waiting for the kernel to materialize requested VFs.
//!
//! Best effort by nature: hotplug ordering between the driver and userspace
//! is not guaranteed and there is no completion signal, so the wait ends
//! either when enough distinct VFs were seen or after a quiet period with no
//! events at all. Callers re-read `sriov_numvfs` afterwards.

use super::{PfVfLinks, UdevEvent, VfLink};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

/// Silence after which no more VF events are expected.
pub const QUIET_PERIOD: Duration = Duration::from_secs(5);

/// Counts VF creation events for one PF.
#[derive(Debug, Clone)]
pub struct VfCreationSync {
    quiet_period: Duration,
}

impl Default for VfCreationSync {
    fn default() -> Self {
        Self::new()
    }
}

impl VfCreationSync {
    pub fn new() -> Self {
        Self { quiet_period: QUIET_PERIOD }
    }

    pub fn with_quiet_period(quiet_period: Duration) -> Self {
        Self { quiet_period }
    }

    pub fn quiet_period(&self) -> Duration {
        self.quiet_period
    }

    /// Consume events until `numvfs` new VFs of `pf_name` were recorded in
    /// `links`, the quiet period elapses, or the channel closes.
    ///
    /// # Returns
    /// Number of VFs newly recorded for this PF.
    #[instrument(skip(self, events, links))]
    pub async fn wait(
        &self,
        events: &mut mpsc::UnboundedReceiver<UdevEvent>,
        links: &mut PfVfLinks,
        pf_name: &str,
        numvfs: u32,
        vdpa: bool,
    ) -> u32 {
        let mut created = 0;

        while created < numvfs {
            let event = match tokio::time::timeout(self.quiet_period, events.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => {
                    warn!("{}: Event channel closed while waiting for VFs", pf_name);
                    return created;
                }
                Err(_) => {
                    info!("{}: Timeout in the creation of VFs ({}/{})", pf_name, created, numvfs);
                    return created;
                }
            };

            debug!(action = %event.action, device = %event.device_syspath.display(), "Got udev event");
            if self.record(&event, links, pf_name, vdpa) {
                created += 1;
                metrics::counter!("sriov_vfs_created_total").increment(1);
            }
        }

        info!("{}: Required VFs are created", pf_name);
        created
    }

    /// Classify one event. Returns `true` if it revealed a new VF of `pf_name`.
    fn record(&self, event: &UdevEvent, links: &mut PfVfLinks, pf_name: &str, vdpa: bool) -> bool {
        let syspath = &event.device_syspath;
        let Some(vf_name) = syspath.file_name().map(|n| n.to_string_lossy().to_string()) else {
            warn!("{}: Unable to parse event", syspath.display());
            return false;
        };

        let Some(pf_dir) = resolve_pf_dir(syspath) else {
            if !vdpa {
                warn!("{}: Unable to find PF", syspath.display());
            }
            return false;
        };

        // For vDPA the event we care about lists every VF netdev next to the
        // PF, e.g. [enp6s0f1np1_0, enp6s0f1np1_1, enp6s0f1np1].
        let pf_nics = list_dir(&pf_dir);
        if !links.contains(&vf_name) && pf_nics.iter().any(|nic| nic == pf_name) {
            links.insert(
                &vf_name,
                VfLink { device_syspath: syspath.clone(), pf_name: pf_name.to_string() },
            );
            info!("{}: VF {} created", pf_name, vf_name);
            true
        } else if links.contains(&vf_name) {
            debug!("{}: VF {} was already created", pf_name, vf_name);
            false
        } else if vdpa {
            warn!("{}: This PF is not in {}", pf_name, pf_dir.display());
            false
        } else {
            warn!("{}: Unable to parse event {}", pf_name, syspath.display());
            false
        }
    }
}

/// Find the `physfn/net` directory of a VF netdev.
///
/// Checked relative to the device (`<syspath>/../../physfn/net`) and then
/// directly below it (`<syspath>/physfn/net`).
pub fn resolve_pf_dir(syspath: &Path) -> Option<PathBuf> {
    let sibling = syspath.parent().and_then(Path::parent).map(|dev| dev.join("physfn/net"));
    let direct = Some(syspath.join("physfn/net"));

    [sibling, direct].into_iter().flatten().find(|dir| dir.is_dir())
}

fn list_dir(dir: &Path) -> Vec<String> {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.file_name().to_string_lossy().to_string())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sysfs::MELLANOX_VENDOR_ID;
    use crate::testing::{add_event, FakeSysfs};

    fn fake_with_vfs(count: u32) -> (FakeSysfs, Vec<PathBuf>) {
        let fake = FakeSysfs::new();
        fake.add_pf("ens1f0", "0000:3b:00.0", "0x1017", MELLANOX_VENDOR_ID);
        let syspaths = (0..count)
            .map(|vfid| {
                fake.add_vf("ens1f0", vfid, &format!("0000:3b:00.{}", vfid + 2), &format!("ens1f0v{}", vfid))
            })
            .collect();
        (fake, syspaths)
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_vfs_observed() {
        let (_fake, syspaths) = fake_with_vfs(4);
        let (tx, mut rx) = mpsc::unbounded_channel();
        for path in &syspaths {
            tx.send(add_event(path)).unwrap();
        }

        let mut links = PfVfLinks::default();
        let created = VfCreationSync::new().wait(&mut rx, &mut links, "ens1f0", 4, false).await;

        assert_eq!(created, 4);
        assert_eq!(links.len(), 4);
        assert_eq!(links.get("ens1f0v3").unwrap().pf_name, "ens1f0");
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_period_returns_early() {
        let (_fake, syspaths) = fake_with_vfs(2);
        let (tx, mut rx) = mpsc::unbounded_channel();
        for path in &syspaths {
            tx.send(add_event(path)).unwrap();
        }

        let mut links = PfVfLinks::default();
        let started = tokio::time::Instant::now();
        let created = VfCreationSync::new().wait(&mut rx, &mut links, "ens1f0", 4, false).await;

        assert_eq!(created, 2);
        assert_eq!(links.len(), 2);
        assert!(started.elapsed() >= QUIET_PERIOD);
        // The sender is still alive: only the timeout ended the wait.
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_events_ignored() {
        let (_fake, syspaths) = fake_with_vfs(2);
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(add_event(&syspaths[0])).unwrap();
        tx.send(UdevEvent { action: "change".into(), device_syspath: syspaths[0].clone() }).unwrap();
        tx.send(add_event(&syspaths[1])).unwrap();

        let mut links = PfVfLinks::default();
        let created = VfCreationSync::new().wait(&mut rx, &mut links, "ens1f0", 2, false).await;

        assert_eq!(created, 2);
        assert_eq!(links.len(), 2);
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolvable_and_foreign_events_skipped() {
        let (fake, syspaths) = fake_with_vfs(1);
        let (tx, mut rx) = mpsc::unbounded_channel();

        // Not a VF at all: no physfn.
        tx.send(add_event(&fake.root().join("sys/devices/virtual/net/lo"))).unwrap();
        // A VF of another PF.
        fake.add_pf("ens2f0", "0000:5e:00.0", "0x1017", MELLANOX_VENDOR_ID);
        let other = fake.add_vf("ens2f0", 0, "0000:5e:00.2", "ens2f0v0");
        tx.send(add_event(&other)).unwrap();
        tx.send(add_event(&syspaths[0])).unwrap();

        let mut links = PfVfLinks::default();
        let created = VfCreationSync::new().wait(&mut rx, &mut links, "ens1f0", 1, false).await;

        assert_eq!(created, 1);
        assert!(links.contains("ens1f0v0"));
        assert!(!links.contains("ens2f0v0"));
        drop(tx);
    }

    #[tokio::test]
    async fn test_closed_channel_ends_wait() {
        let (tx, mut rx) = mpsc::unbounded_channel::<UdevEvent>();
        drop(tx);

        let mut links = PfVfLinks::default();
        let created = VfCreationSync::new().wait(&mut rx, &mut links, "ens1f0", 4, false).await;
        assert_eq!(created, 0);
    }

    #[test]
    fn test_resolve_pf_dir_variants() {
        let (fake, syspaths) = fake_with_vfs(1);
        let sibling = resolve_pf_dir(&syspaths[0]).unwrap();
        assert!(sibling.ends_with("0000:3b:00.2/physfn/net"));

        let direct_dev = fake.root().join("sys/devices/pci0000:00/0000:3b:00.9");
        std::fs::create_dir_all(direct_dev.join("physfn/net/ens1f0")).unwrap();
        assert_eq!(resolve_pf_dir(&direct_dev).unwrap(), direct_dev.join("physfn/net"));

        assert!(resolve_pf_dir(&fake.root().join("sys/devices/none")).is_none());
    }
}
