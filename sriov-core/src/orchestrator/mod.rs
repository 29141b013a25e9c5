//! Provisioning runs over a whole configuration map.
//!
//! A run owns the kernel event subscription and the VF link map for its
//! duration. PFs are configured one after the other in configuration order,
//! then VFs are tuned. Nothing is rolled back on failure: every step is
//! idempotent, so the next run picks up where this one stopped.

use crate::bind;
use crate::command::{programs, CommandRunner, Invocation, SystemCommandRunner};
use crate::config::{PfDescriptor, SriovConfig};
use crate::error::{Result, SriovError};
use crate::events::{EventMonitor, NetlinkMonitor, VfCreationSync};
use crate::numvfs::RunState;
use crate::observability::metrics as sriov_metrics;
use crate::paths::Paths;
use crate::switchdev::{PfModeController, UPLINK_ATTEMPTS, UPLINK_POLL_INTERVAL};
use crate::sysfs::{PciAddress, Sysfs, MLX5_DRIVER};
use crate::udev::UdevRule;
use crate::vf::VfTuner;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};


/// Line of the deployment-era `ifup-local` hook that called `allocate_vfs`.
const ALLOCATE_VFS_MARKER: &str = "/etc/sysconfig/allocate_vfs";

/// Switches of a provisioning run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProvisionOptions {
    /// Invoked by an operator rather than the boot-time service: bring PFs
    /// up after switchdev and bind DPDK VFs immediately.
    pub interactive: bool,
    /// Restart Open vSwitch and bounce every PF once PFs are configured.
    pub restart_openvswitch: bool,
}

/// Summary of a provisioning run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionReport {
    pub configured_pfs: Vec<String>,
    /// PFs whose VF count already matched.
    pub skipped_pfs: Vec<String>,
    pub dpdk_vfs: Vec<PciAddress>,
    pub unbound_vfs: Vec<PciAddress>,
    pub rules_changed: bool,
    pub tuned_vfs: usize,
}

/// Drives PF and VF configuration against one host.
pub struct Provisioner {
    paths: Paths,
    sysfs: Sysfs,
    runner: Arc<dyn CommandRunner>,
    monitor: Arc<dyn EventMonitor>,
    sync: VfCreationSync,
    uplink_attempts: u32,
    uplink_interval: Duration,
}

impl Provisioner {
    pub fn new(paths: Paths, runner: Arc<dyn CommandRunner>, monitor: Arc<dyn EventMonitor>) -> Self {
        Self {
            sysfs: Sysfs::new(&paths.sysfs_root),
            paths,
            runner,
            monitor,
            sync: VfCreationSync::new(),
            uplink_attempts: UPLINK_ATTEMPTS,
            uplink_interval: UPLINK_POLL_INTERVAL,
        }
    }

    /// Provisioner using real programs and the netlink monitor.
    pub fn system(paths: Paths) -> Self {
        let monitor = NetlinkMonitor::new(&paths.sysfs_root);
        Self::new(paths, Arc::new(SystemCommandRunner), Arc::new(monitor))
    }

    pub fn with_quiet_period(mut self, quiet_period: Duration) -> Self {
        self.sync = VfCreationSync::with_quiet_period(quiet_period);
        self
    }

    pub fn with_uplink_poll(mut self, attempts: u32, interval: Duration) -> Self {
        self.uplink_attempts = attempts;
        self.uplink_interval = interval;
        self
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    fn mode_controller(&self) -> PfModeController {
        PfModeController::new(self.paths.clone(), self.runner.clone(), self.sync.clone())
            .with_uplink_poll(self.uplink_attempts, self.uplink_interval)
    }

    /// Configure every PF, then every VF.
    pub async fn provision(&self, config: &SriovConfig, options: ProvisionOptions) -> Result<ProvisionReport> {
        let started = Instant::now();
        let mut report = self.configure_pfs(config, options).await?;
        report.tuned_vfs = self.configure_vfs(config).await?;
        sriov_metrics::record_provision(started.elapsed().as_secs_f64());
        Ok(report)
    }

    /// Configure every PF of `config` in order.
    ///
    /// The event monitor runs from before the first PF until after the last
    /// one, so no VF creation event can slip between a count write and the
    /// wait that follows it.
    #[instrument(skip_all, fields(pfs = config.pfs().count()))]
    pub async fn configure_pfs(&self, config: &SriovConfig, options: ProvisionOptions) -> Result<ProvisionReport> {
        let mut run = RunState::new(self.monitor.start()?);
        let result = self.configure_pfs_with(config, options, &mut run).await;
        let links = run.finish();
        debug!(vfs = links.len(), "VF links observed during run");

        let report = result?;
        if options.restart_openvswitch {
            self.restart_network(config).await?;
        }
        Ok(report)
    }

    async fn configure_pfs_with(
        &self,
        config: &SriovConfig,
        options: ProvisionOptions,
        run: &mut RunState,
    ) -> Result<ProvisionReport> {
        let mode = self.mode_controller();
        let mut report = ProvisionReport::default();

        self.cleanup_legacy_artifacts()?;

        let vdpa_devices = if config.has_vdpa() {
            mode.load_vdpa_kmods().await?;
            mode.list_vdpa_devices().await?
        } else {
            BTreeSet::new()
        };

        for pf in config.pfs() {
            if mode.numvfs().get(&pf.name)? == pf.numvfs {
                debug!("PF {} is already configured", pf.name);
                sriov_metrics::record_pf_skipped();
                report.skipped_pfs.push(pf.name.clone());
                continue;
            }

            self.pf_interface_up(pf).await?;

            if !pf.is_switchdev() {
                match config.claimed_vf(&pf.name) {
                    Some(vf_name) => warn!("{} has VF({}) used by host", pf.name, vf_name),
                    None => {
                        info!("{}: adding udev rules for legacy sriov: {}", pf.name, pf.numvfs);
                        // Re-plug rules only matter on the next hotplug.
                        mode.udev()
                            .upsert(
                                &UdevRule::legacy_replug(&pf.name, pf.numvfs),
                                &self.paths.udev_legacy_rules_file,
                            )
                            .await?;
                    }
                }
            }

            let outcome = mode.apply(pf, &vdpa_devices, options.interactive, run).await?;
            if outcome.numvfs != pf.numvfs {
                warn!("{}: has {} VFs, {} requested", pf.name, outcome.numvfs, pf.numvfs);
            }

            report.rules_changed |= outcome.rules_changed;
            report.dpdk_vfs.extend(outcome.dpdk_vfs);
            report.unbound_vfs.extend(outcome.unbound_vfs);
            report.configured_pfs.push(pf.name.clone());
            sriov_metrics::record_pf_configured(if pf.is_switchdev() { "switchdev" } else { "legacy" });
        }

        if !report.dpdk_vfs.is_empty() {
            bind::update(&self.paths.bind_config_file, MLX5_DRIVER, &report.dpdk_vfs)?;
            if options.interactive {
                let mut current = bind::BindMap::new();
                current.insert(
                    MLX5_DRIVER.to_string(),
                    report.dpdk_vfs.iter().map(ToString::to_string).collect(),
                );
                bind::bind_all(&self.sysfs, &current)?;
            }
        }

        if report.rules_changed {
            mode.udev().trigger().await?;
        }
        Ok(report)
    }

    /// Apply every VF descriptor in configuration order.
    ///
    /// # Returns
    /// Number of descriptors applied.
    #[instrument(skip_all)]
    pub async fn configure_vfs(&self, config: &SriovConfig) -> Result<usize> {
        let tuner = VfTuner::new(self.sysfs.clone(), self.runner.clone());
        let mut tuned = 0;
        for vf in config.vfs() {
            tuner.apply(vf).await?;
            tuned += 1;
        }
        Ok(tuned)
    }

    /// Set the VF count of a single PF, as done on re-plug.
    pub async fn set_numvfs(&self, pf_name: &str, numvfs: u32, vdpa: bool) -> Result<u32> {
        let mode = self.mode_controller();
        let mut run = RunState::new(self.monitor.start()?);
        let result = mode.numvfs().set(pf_name, numvfs, vdpa, &mut run).await;
        run.finish();
        result
    }

    async fn pf_interface_up(&self, pf: &PfDescriptor) -> Result<()> {
        if let Some(promisc) = pf.promisc {
            let value = if promisc { "on" } else { "off" };
            self.runner.run(&Invocation::ip(["link", "set", "dev", pf.name.as_str(), "promisc", value])).await?;
        }
        info!("{}: Bringing up PF", pf.name);
        self.runner.run(&Invocation::ip(["link", "set", "dev", pf.name.as_str(), "up"])).await?;
        Ok(())
    }

    /// Remove files older deployment tooling used to allocate VFs.
    pub fn cleanup_legacy_artifacts(&self) -> Result<()> {
        remove_if_exists(&self.paths.reset_sriov_rules_file)?;
        remove_if_exists(&self.paths.allocate_vfs_file)?;

        let ifup_local = &self.paths.ifup_local_file;
        let contents = match fs::read_to_string(ifup_local) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(SriovError::io(ifup_local, e)),
        };

        let kept: String = contents
            .split_inclusive('\n')
            .filter(|line| !line.contains(ALLOCATE_VFS_MARKER))
            .collect();
        if kept.trim() == "#!/bin/bash" {
            info!(path = %ifup_local.display(), "Removing empty ifup-local hook");
            remove_if_exists(ifup_local)
        } else if kept != contents {
            fs::write(ifup_local, kept).map_err(|e| SriovError::io(ifup_local, e))
        } else {
            Ok(())
        }
    }

    async fn restart_network(&self, config: &SriovConfig) -> Result<()> {
        self.runner.run(&Invocation::new(programs::SYSTEMCTL, ["restart", "openvswitch"])).await?;
        for pf in config.pfs() {
            info!("{}: Running /sbin/ifdown", pf.name);
            self.runner.run(&Invocation::new(programs::IFDOWN, [pf.name.as_str()])).await?;
            info!("{}: Running /sbin/ifup", pf.name);
            self.runner.run(&Invocation::new(programs::IFUP, [pf.name.as_str()])).await?;
        }
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            info!(path = %path.display(), "Removed legacy file");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SriovError::io(path, e)),
    }
}
