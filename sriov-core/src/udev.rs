//! Persistent udev rule files.
//!
//! Every rule carries a match pattern; after [`UdevReconciler::upsert`] the
//! target file holds exactly one line matching that pattern. Whether a write
//! is needed at all is decided by [`plan_upsert`], which does no I/O.

use crate::command::{programs, CommandRunner, Invocation};
use crate::error::{Result, SriovError};
use crate::sysfs::PciAddress;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// First line of every file this crate generates.
pub const AUTOGEN_HEADER: &str = "# This file is autogenerated by os-net-config";

/// Name of the installed command-line binary.
pub const BINARY_NAME: &str = "sriov-config";

/// Program that re-applies the VF count when a legacy PF is re-plugged:
/// [`BINARY_NAME`] at its install location.
pub const REPLUG_PROGRAM: &str = "/usr/bin/sriov-config";

/// Body of the representor-name helper: turns `pf0vf3` into `NUMBER=3`.
const REP_LINK_NAME_SCRIPT: &str = r#"#!/bin/bash
# This file is autogenerated by os-net-config
set -x
PORT="$1"
echo "NUMBER=${PORT##pf*vf}"
"#;

/// `.../0000:3b:00.2/net/<ifname>` captures bus, device and function.
static VF_SYSPATH_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[[:xdigit:]]{4}:([[:xdigit:]]+):([[:xdigit:]]+)\.(\d+)/net/[^/]+$")
        .expect("Invalid VF syspath regex")
});

/// One rule line and the pattern identifying earlier versions of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdevRule {
    line: String,
    pattern: String,
}

impl UdevRule {
    /// A rule that only matches itself.
    pub fn new(line: impl Into<String>) -> Self {
        let line = line.into().trim().to_string();
        Self { pattern: line.clone(), line }
    }

    /// A rule replacing any line that contains `pattern`.
    pub fn with_pattern(line: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self { line: line.into().trim().to_string(), pattern: pattern.into() }
    }

    pub fn line(&self) -> &str {
        &self.line
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Whether an existing file line is a version of this rule.
    pub fn matches(&self, candidate: &str) -> bool {
        !self.pattern.is_empty() && candidate.contains(&self.pattern)
    }

    /// Keep VF representors away from NetworkManager.
    pub fn unmanage_representors() -> Self {
        Self::new(
            r#"SUBSYSTEM=="net", ACTION=="add", ATTR{phys_switch_id}!="", ATTR{phys_port_name}=="pf*vf*", ENV{NM_UNMANAGED}="1""#,
        )
    }

    /// Pin the PF (uplink representor) name to its PCI address.
    pub fn pf_name(pf_name: &str, pci: &PciAddress) -> Self {
        Self::new(format!(
            r#"SUBSYSTEM=="net", ACTION=="add", DRIVERS=="?*", KERNELS=="{}", NAME="{}""#,
            pci, pf_name
        ))
    }

    /// Name VF representors `<pf>_<vf index>` via the helper script.
    pub fn vf_representors(pf_name: &str, pf_pci: &PciAddress, phys_switch_id: &str, script: &Path) -> Self {
        Self::new(format!(
            r#"SUBSYSTEM=="net", ACTION=="add", ATTR{{phys_switch_id}}=="{}", ATTR{{phys_port_name}}=="pf{}vf*", IMPORT{{program}}="{} $attr{{phys_port_name}}", NAME="{}_$env{{NUMBER}}""#,
            phys_switch_id,
            pf_pci.function(),
            script.display(),
            pf_name
        ))
    }

    /// Name a vDPA representor by the VF's MAC address.
    pub fn vdpa_representor(mac: &str, rep_name: &str) -> Self {
        Self::new(format!(r#"SUBSYSTEM=="net", ACTION=="add", ATTR{{address}}=="{}", NAME="{}""#, mac, rep_name))
    }

    /// Re-apply `numvfs` whenever a legacy-mode PF shows up again.
    pub fn legacy_replug(pf_name: &str, numvfs: u32) -> Self {
        Self::with_pattern(
            format!(r#"KERNEL=="{}", RUN+="{} -n %k:{}""#, pf_name, REPLUG_PROGRAM, numvfs),
            // Any program: rules written by older tooling are replaced too.
            format!(r#"KERNEL=="{}", RUN+=""#, pf_name),
        )
    }
}

/// vDPA representor name for a VF netdev syspath, `vdpa<bus>p<dev>vf<fn>`.
pub fn vdpa_representor_name(device_syspath: &Path) -> Option<String> {
    let path = device_syspath.to_string_lossy();
    let caps = VF_SYSPATH_REGEX.captures(&path)?;
    Some(format!("vdpa{}p{}vf{}", &caps[1], &caps[2], &caps[3]))
}

/// What an upsert has to do to a rule file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RulePlan {
    /// File is missing; write these contents.
    Create { contents: String },
    /// No line matches; append the rule line.
    Append,
    /// Matching lines differ or repeat; write these contents instead.
    Rewrite { contents: String },
    /// Exactly one matching line, identical to the rule.
    Unchanged,
}

/// Decide how to converge `existing` (None if the file is missing) to `rule`.
///
/// The first matching line is replaced in place and any further matching
/// lines are dropped. Non-matching lines keep their order.
pub fn plan_upsert(existing: Option<&str>, rule: &UdevRule) -> RulePlan {
    let Some(existing) = existing else {
        return RulePlan::Create { contents: format!("{}\n{}\n", AUTOGEN_HEADER, rule.line) };
    };

    let matching: Vec<&str> = existing.lines().filter(|l| rule.matches(l)).collect();
    match matching.as_slice() {
        [] => RulePlan::Append,
        [only] if *only == rule.line => RulePlan::Unchanged,
        _ => {
            let mut replaced = false;
            let mut lines = Vec::new();
            for line in existing.lines() {
                if !rule.matches(line) {
                    lines.push(line);
                } else if !replaced {
                    lines.push(rule.line.as_str());
                    replaced = true;
                }
            }
            RulePlan::Rewrite { contents: format!("{}\n", lines.join("\n")) }
        }
    }
}

/// Applies rules to files and drives `udevadm`.
#[derive(Clone)]
pub struct UdevReconciler {
    runner: Arc<dyn CommandRunner>,
}

impl UdevReconciler {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Converge `file` to contain `rule`.
    ///
    /// # Returns
    /// `true` if the file was written (and the rule database reloaded).
    ///
    /// # Errors
    /// I/O failures on the rule file, or a failed `udevadm` reload.
    #[instrument(skip(self, rule), fields(file = %file.display()))]
    pub async fn upsert(&self, rule: &UdevRule, file: &Path) -> Result<bool> {
        if rule.line.is_empty() {
            return Ok(false);
        }
        debug!("Adding udev rule: {}", rule.line);

        let existing = match fs::read_to_string(file) {
            Ok(contents) => Some(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(SriovError::io(file, e)),
        };

        match plan_upsert(existing.as_deref(), rule) {
            RulePlan::Unchanged => {
                debug!("Udev rule already present");
                return Ok(false);
            }
            RulePlan::Create { contents } => {
                if let Some(parent) = file.parent() {
                    fs::create_dir_all(parent).map_err(|e| SriovError::io(parent, e))?;
                }
                fs::write(file, contents).map_err(|e| SriovError::io(file, e))?;
            }
            RulePlan::Rewrite { contents } => {
                fs::write(file, contents).map_err(|e| SriovError::io(file, e))?;
            }
            RulePlan::Append => {
                let existing = existing.unwrap_or_default();
                let separator = if existing.is_empty() || existing.ends_with('\n') { "" } else { "\n" };
                let mut f = fs::OpenOptions::new()
                    .append(true)
                    .open(file)
                    .map_err(|e| SriovError::io(file, e))?;
                writeln!(f, "{}{}", separator, rule.line).map_err(|e| SriovError::io(file, e))?;
            }
        }

        metrics::counter!("sriov_udev_rules_changed_total").increment(1);
        self.reload().await?;
        Ok(true)
    }

    /// Upsert several rules, one line at a time. Returns `true` if any changed.
    pub async fn upsert_all(&self, rules: &[UdevRule], file: &Path) -> Result<bool> {
        let mut changed = false;
        for rule in rules {
            changed |= self.upsert(rule, file).await?;
        }
        Ok(changed)
    }

    /// `udevadm control --reload-rules`
    pub async fn reload(&self) -> Result<()> {
        self.runner
            .run(&Invocation::new(programs::UDEVADM, ["control", "--reload-rules"]))
            .await?;
        info!("udev rules reloaded successfully");
        Ok(())
    }

    /// Replay `add` events for every network device.
    pub async fn trigger(&self) -> Result<()> {
        self.runner
            .run(&Invocation::new(
                programs::UDEVADM,
                ["trigger", "--action=add", "--attr-match=subsystem=net"],
            ))
            .await?;
        info!("udev rules triggered successfully");
        Ok(())
    }
}

/// Write the executable helper referenced by [`UdevRule::vf_representors`].
pub fn write_rep_link_script(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| SriovError::io(parent, e))?;
    }
    fs::write(path, REP_LINK_NAME_SCRIPT).map_err(|e| SriovError::io(path, e))?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).map_err(|e| SriovError::io(path, e))
}
