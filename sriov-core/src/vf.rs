//! Per-VF link attribute tuning.

use crate::command::{programs, CommandRunner, Invocation};
use crate::config::VfDescriptor;
use crate::error::Result;
use crate::sysfs::{PciAddress, Sysfs};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// A tuning command and whether its failure may be ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfCommand {
    pub invocation: Invocation,
    /// Clearing a rate limit that was never set is rejected by some drivers.
    pub best_effort: bool,
}

impl VfCommand {
    fn required(invocation: Invocation) -> Self {
        Self { invocation, best_effort: false }
    }
}

fn on_off(value: bool) -> &'static str {
    if value {
        "on"
    } else {
        "off"
    }
}

/// The `ip link` commands implementing a VF descriptor, in application order.
pub fn vf_commands(vf: &VfDescriptor) -> Vec<VfCommand> {
    let pf = vf.device.name.as_str();
    let vfid = vf.device.vfid.to_string();
    let base = |extra: Vec<String>| {
        let mut args: Vec<String> =
            ["link", "set", "dev", pf, "vf", vfid.as_str()].iter().map(|s| s.to_string()).collect();
        args.extend(extra);
        Invocation::ip(args)
    };

    let mut commands = Vec::new();

    if let Some(mac) = &vf.macaddr {
        commands.push(VfCommand::required(base(vec!["mac".into(), mac.clone()])));
    }
    if let Some(vlan) = vf.vlan_id {
        let mut extra = vec!["vlan".to_string(), vlan.to_string()];
        if let Some(qos) = vf.qos {
            extra.extend(["qos".to_string(), qos.to_string()]);
        }
        commands.push(VfCommand::required(base(extra)));
    }
    if let Some(rate) = vf.max_tx_rate {
        commands.push(VfCommand {
            invocation: base(vec!["max_tx_rate".into(), rate.to_string()]),
            best_effort: rate == 0,
        });
    }
    if let Some(rate) = vf.min_tx_rate {
        commands.push(VfCommand {
            invocation: base(vec!["min_tx_rate".into(), rate.to_string()]),
            best_effort: rate == 0,
        });
    }
    if let Some(spoofchk) = vf.spoofcheck {
        commands.push(VfCommand::required(base(vec!["spoofchk".into(), on_off(spoofchk).into()])));
    }
    if let Some(state) = vf.state {
        commands.push(VfCommand::required(base(vec!["state".into(), state.as_str().into()])));
    }
    if let Some(trust) = vf.trust {
        commands.push(VfCommand::required(base(vec!["trust".into(), on_off(trust).into()])));
    }
    if let Some(promisc) = vf.promisc {
        commands.push(VfCommand::required(Invocation::ip([
            "link",
            "set",
            "dev",
            vf.name.as_str(),
            "promisc",
            on_off(promisc),
        ])));
    }

    commands
}

/// Applies VF descriptors once their PF is partitioned.
#[derive(Clone)]
pub struct VfTuner {
    sysfs: Sysfs,
    runner: Arc<dyn CommandRunner>,
}

impl VfTuner {
    pub fn new(sysfs: Sysfs, runner: Arc<dyn CommandRunner>) -> Self {
        Self { sysfs, runner }
    }

    /// Apply every setting present in `vf`.
    ///
    /// # Errors
    /// The first failing command, except zero rate limits, which only warn.
    #[instrument(skip(self, vf), fields(vf = %vf.name, pf = %vf.device.name, vfid = vf.device.vfid))]
    pub async fn apply(&self, vf: &VfDescriptor) -> Result<()> {
        info!("{}: Configuring settings for VF: {} VF name: {}", vf.device.name, vf.device.vfid, vf.name);

        for command in vf_commands(vf) {
            match self.runner.run(&command.invocation).await {
                Ok(_) => {}
                Err(e) if command.best_effort && e.is_command_failure() => {
                    warn!("{}: Ignoring failure to clear rate limit: {}", vf.name, e);
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(driver) = &vf.driver {
            let pci = self.vf_pci_address(vf)?;
            self.set_driver_override(&pci, driver).await?;
        }
        Ok(())
    }

    /// `driverctl set-override <pci> <driver>`
    pub async fn set_driver_override(&self, pci: &PciAddress, driver: &str) -> Result<()> {
        info!(pci = %pci, driver, "Setting driver override");
        self.runner
            .run(&Invocation::new(programs::DRIVERCTL, ["set-override", pci.as_str(), driver]))
            .await?;
        Ok(())
    }

    fn vf_pci_address(&self, vf: &VfDescriptor) -> Result<PciAddress> {
        match &vf.pci_address {
            Some(pci) => pci.parse(),
            None => self.sysfs.vf_pci_address(&vf.device.name, vf.device.vfid),
        }
    }
}
