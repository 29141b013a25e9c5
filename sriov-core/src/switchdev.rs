//! PF mode transitions: switchdev, vDPA and DPDK preparation.
//!
//! Ordering matters here. A vDPA PF must be in switchdev mode before its VFs
//! exist, otherwise representor naming is inconsistent. A DPDK PF is switched
//! after its VFs are unbound and its udev rules are in place. Switching the
//! eswitch removes the PF netdev and brings back an uplink representor, which
//! must show up before anything else touches the PF.

use crate::command::{programs, CommandRunner, Invocation};
use crate::config::PfDescriptor;
use crate::error::{Result, SriovError};
use crate::events::{PfVfLinks, VfCreationSync};
use crate::numvfs::{NumVfsController, RunState};
use crate::paths::Paths;
use crate::sysfs::{PciAddress, Sysfs};
use crate::udev::{self, UdevReconciler, UdevRule};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

/// Device IDs (ConnectX-4 and ConnectX-4 Lx) that need inline-mode `transport`
/// before switchdev.
pub const INLINE_MODE_DEVICE_IDS: [&str; 2] = ["0x1013", "0x1015"];

/// Checks of `phys_switch_id` before giving up on the uplink representor.
pub const UPLINK_ATTEMPTS: u32 = 10;

pub const UPLINK_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Kernel modules needed to create vDPA devices on ConnectX NICs.
pub const VDPA_KMODS: [&str; 3] = ["vdpa", "vhost_vdpa", "mlx5_vdpa"];

/// What configuring one PF produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PfOutcome {
    /// VF count reported by the kernel after the run.
    pub numvfs: u32,
    /// VFs handed over to the DPDK bind map.
    pub dpdk_vfs: Vec<PciAddress>,
    /// VFs whose mlx5 driver was unbound.
    pub unbound_vfs: Vec<PciAddress>,
    /// VFs for which a vDPA device was created.
    pub vdpa_devices: Vec<PciAddress>,
    /// Whether any rule file changed.
    pub rules_changed: bool,
}

#[derive(Deserialize)]
struct VdpaDevList {
    #[serde(default)]
    dev: BTreeMap<String, serde_json::Value>,
}

/// Sequences the per-PF steps of a provisioning run.
#[derive(Clone)]
pub struct PfModeController {
    paths: Paths,
    sysfs: Sysfs,
    runner: Arc<dyn CommandRunner>,
    udev: UdevReconciler,
    numvfs: NumVfsController,
    uplink_attempts: u32,
    uplink_interval: Duration,
}

impl PfModeController {
    pub fn new(paths: Paths, runner: Arc<dyn CommandRunner>, sync: VfCreationSync) -> Self {
        let sysfs = Sysfs::new(&paths.sysfs_root);
        Self {
            udev: UdevReconciler::new(runner.clone()),
            numvfs: NumVfsController::new(sysfs.clone(), sync),
            paths,
            sysfs,
            runner,
            uplink_attempts: UPLINK_ATTEMPTS,
            uplink_interval: UPLINK_POLL_INTERVAL,
        }
    }

    /// Override the uplink representor poll budget.
    pub fn with_uplink_poll(mut self, attempts: u32, interval: Duration) -> Self {
        self.uplink_attempts = attempts.max(1);
        self.uplink_interval = interval;
        self
    }

    pub fn numvfs(&self) -> &NumVfsController {
        &self.numvfs
    }

    pub fn udev(&self) -> &UdevReconciler {
        &self.udev
    }

    /// Partition `pf` and, for Mellanox switchdev PFs, prepare its VFs and
    /// move the eswitch.
    ///
    /// `vdpa_devices` is the set of vDPA device names present before the run.
    /// `interactive` brings the PF back up afterwards; at boot the network
    /// scripts do that.
    #[instrument(skip(self, pf, vdpa_devices, run), fields(pf = %pf.name))]
    pub async fn apply(
        &self,
        pf: &PfDescriptor,
        vdpa_devices: &BTreeSet<String>,
        interactive: bool,
        run: &mut RunState,
    ) -> Result<PfOutcome> {
        let mut outcome = PfOutcome::default();
        let is_mlnx = self.sysfs.is_mellanox(&pf.name);

        if pf.vdpa && is_mlnx {
            self.configure_switchdev(&pf.name).await?;
        }

        outcome.numvfs = self.numvfs.set(&pf.name, pf.numvfs, pf.vdpa, run).await?;

        if !(pf.is_switchdev() && is_mlnx) {
            return Ok(outcome);
        }
        info!("{}: Mellanox card", pf.name);

        let vf_pcis = self.sysfs.vf_pci_addresses(&pf.name)?;
        for pci in &vf_pcis {
            if !pf.vdpa {
                if self.sysfs.driver_unbind(pci)? {
                    outcome.unbound_vfs.push(pci.clone());
                }
            } else if vdpa_devices.contains(pci.as_str()) {
                info!("{}: vDPA device already created for {}", pf.name, pci);
            } else {
                self.create_vdpa_device(pci).await?;
                outcome.vdpa_devices.push(pci.clone());
            }
        }
        if pf.vdpa {
            self.relabel_vhost_devices().await;
        }

        info!("{}: Adding udev rules", pf.name);
        outcome.rules_changed = self.add_switchdev_rules(pf).await?;

        if !pf.vdpa {
            outcome.dpdk_vfs = vf_pcis;
            self.configure_flow_steering(&pf.name, pf.steering_mode()).await?;
            self.configure_switchdev(&pf.name).await?;
        } else {
            outcome.rules_changed |= self.add_vdpa_representor_rules(&pf.name, &run.links).await?;
        }

        if interactive {
            self.if_up(&pf.name).await?;
        }
        Ok(outcome)
    }

    /// Move the eswitch of `pf_name` to switchdev, wait for the uplink
    /// representor and enable TC offload.
    #[instrument(skip(self))]
    pub async fn configure_switchdev(&self, pf_name: &str) -> Result<()> {
        let pci = self.sysfs.pf_pci_address(pf_name)?;
        let device_id = self.sysfs.device_id(pf_name)?;
        let devlink_dev = format!("pci/{}", pci);

        if INLINE_MODE_DEVICE_IDS.contains(&device_id.as_str()) {
            self.run_logged(
                pf_name,
                "set inline-mode to transport",
                Invocation::new(
                    programs::DEVLINK,
                    ["dev", "eswitch", "set", devlink_dev.as_str(), "inline-mode", "transport"],
                ),
            )
            .await?;
        }

        self.run_logged(
            pf_name,
            "set mode to switchdev",
            Invocation::new(
                programs::DEVLINK,
                ["dev", "eswitch", "set", devlink_dev.as_str(), "mode", "switchdev"],
            ),
        )
        .await?;
        info!("{}: Device {} set to switchdev mode.", pf_name, devlink_dev);
        metrics::counter!("sriov_switchdev_transitions_total").increment(1);

        self.wait_for_uplink(pf_name).await?;

        self.run_logged(
            pf_name,
            "enable hw-tc-offload",
            Invocation::new(programs::ETHTOOL, ["-K", pf_name, "hw-tc-offload", "on"]),
        )
        .await?;
        info!("{}: Enabled \"hw-tc-offload\" for PF.", pf_name);
        Ok(())
    }

    /// Poll `phys_switch_id` until the uplink representor is ready.
    pub async fn wait_for_uplink(&self, pf_name: &str) -> Result<()> {
        for attempt in 1..=self.uplink_attempts {
            if self.sysfs.phys_switch_id(pf_name).is_some() {
                info!("{} Uplink representor ready", pf_name);
                return Ok(());
            }
            if attempt < self.uplink_attempts {
                tokio::time::sleep(self.uplink_interval).await;
            }
        }
        Err(SriovError::Timeout { iface: pf_name.to_string(), what: "uplink representor".to_string() })
    }

    /// Set the flow steering mode. Not every firmware supports every mode, so
    /// a failing `devlink` call only warns.
    pub async fn configure_flow_steering(&self, pf_name: &str, mode: &str) -> Result<()> {
        let pci = self.sysfs.pf_pci_address(pf_name)?;
        let devlink_dev = format!("pci/{}", pci);
        let invocation = Invocation::new(
            programs::DEVLINK,
            [
                "dev",
                "param",
                "set",
                devlink_dev.as_str(),
                "name",
                "flow_steering_mode",
                "value",
                mode,
                "cmode",
                "runtime",
            ],
        );

        match self.runner.run(&invocation).await {
            Ok(_) => {
                info!("{}: Device {} is set to {} steering mode.", pf_name, devlink_dev, mode);
                Ok(())
            }
            Err(e) if e.is_command_failure() => {
                warn!("{}: Could not set {} to {} steering mode: {}", pf_name, devlink_dev, mode, e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// `modprobe` the vDPA kernel modules.
    pub async fn load_vdpa_kmods(&self) -> Result<()> {
        for kmod in VDPA_KMODS {
            self.runner.run(&Invocation::new(programs::MODPROBE, [kmod])).await?;
        }
        Ok(())
    }

    /// Names of the vDPA devices that already exist.
    pub async fn list_vdpa_devices(&self) -> Result<BTreeSet<String>> {
        info!("Getting list of vdpa devices");
        let invocation = Invocation::new(programs::VDPA, ["-j", "dev"]);
        let output = self.runner.run(&invocation).await.map_err(|e| {
            error!("Failed to get vdpa vhost devices: {}", e);
            e
        })?;

        let list: VdpaDevList =
            serde_json::from_str(&output.stdout).map_err(|e| SriovError::CommandFailed {
                command: invocation.command_line(),
                reason: format!("unexpected output: {}", e),
            })?;
        Ok(list.dev.into_keys().collect())
    }

    /// `vdpa dev add name <pci> mgmtdev pci/<pci>`
    pub async fn create_vdpa_device(&self, pci: &PciAddress) -> Result<()> {
        info!("{}: Creating vdpa device", pci);
        let mgmtdev = format!("pci/{}", pci);
        self.run_logged(
            pci.as_str(),
            "create vdpa vhost device",
            Invocation::new(
                programs::VDPA,
                ["dev", "add", "name", pci.as_str(), "mgmtdev", mgmtdev.as_str()],
            ),
        )
        .await
    }

    /// Restore SELinux labels on `/dev/vhost-*`. Failures only warn.
    async fn relabel_vhost_devices(&self) {
        let nodes: Vec<PathBuf> = match std::fs::read_dir(&self.paths.dev_root) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_name().to_string_lossy().starts_with("vhost-"))
                .map(|entry| entry.path())
                .collect(),
            Err(e) => {
                warn!("Unable to list {}: {}", self.paths.dev_root.display(), e);
                return;
            }
        };
        if nodes.is_empty() {
            return;
        }

        let args: Vec<String> = nodes.iter().map(|p| p.to_string_lossy().to_string()).collect();
        if let Err(e) = self.runner.run(&Invocation::new(programs::RESTORECON, args)).await {
            warn!("Unable to restore vhost device labels: {}", e);
        }
    }

    /// Representor unmanage rule, PF name rule and, for non-vDPA PFs, the
    /// VF representor rename rule.
    async fn add_switchdev_rules(&self, pf: &PfDescriptor) -> Result<bool> {
        let file = &self.paths.udev_rules_file;

        info!("adding udev rules to unmanage vf representators");
        let mut changed = self.udev.upsert(&UdevRule::unmanage_representors(), file).await?;

        info!("{}: adding udev rules for sriov", pf.name);
        let pci = self.sysfs.pf_pci_address(&pf.name)?;
        changed |= self.udev.upsert(&UdevRule::pf_name(&pf.name, &pci), file).await?;

        if !pf.vdpa {
            info!("{}: adding udev rules for vf representators", pf.name);
            let switch_id = self.sysfs.phys_switch_id(&pf.name).unwrap_or_default();
            let rule = UdevRule::vf_representors(&pf.name, &pci, &switch_id, &self.paths.rep_link_name_script);
            udev::write_rep_link_script(&self.paths.rep_link_name_script)?;
            changed |= self.udev.upsert(&rule, file).await?;
        }
        Ok(changed)
    }

    /// One MAC-based rename rule per VF of `pf_name` seen during this run.
    async fn add_vdpa_representor_rules(&self, pf_name: &str, links: &PfVfLinks) -> Result<bool> {
        info!("{}: adding udev rules for vdpa representators", pf_name);

        let mut rules = Vec::new();
        for (vf_name, link) in links.for_pf(pf_name) {
            let Some(rep_name) = udev::vdpa_representor_name(&link.device_syspath) else {
                error!(
                    "{}/{}: Failed to get pf/vf numbers and so failed to create a udev rule for renaming vdpa dev",
                    link.device_syspath.display(),
                    vf_name
                );
                continue;
            };
            let mac = self.sysfs.mac_address(vf_name)?;
            info!("{}: Adding udev representor rule.", rep_name);
            rules.push(UdevRule::vdpa_representor(&mac, &rep_name));
        }

        self.udev.upsert_all(&rules, &self.paths.udev_rules_file).await
    }

    async fn if_up(&self, pf_name: &str) -> Result<()> {
        info!("{}: Running /sbin/ifup", pf_name);
        self.run_logged(pf_name, "ifup", Invocation::new(programs::IFUP, [pf_name])).await
    }

    async fn run_logged(&self, target: &str, what: &str, invocation: Invocation) -> Result<()> {
        self.runner.run(&invocation).await.map(|_| ()).map_err(|e| {
            error!("{}: Failed to {}: {}", target, what, e);
            e
        })
    }
}
