//! Centralized path configuration for SR-IOV provisioning.
//!
//! Every file the provisioner touches goes through [`Paths`], so the whole
//! run can be pointed at a scratch directory instead of the live host.

use std::path::{Path, PathBuf};

/// Environment variable that relocates every host path under a prefix.
pub const CONFIG_ROOT_ENV: &str = "SRIOV_CONFIG_ROOT";

/// Environment variable that overrides the sysfs mount point.
pub const SYSFS_ROOT_ENV: &str = "SRIOV_SYSFS_ROOT";

/// Persistent naming rules for PFs and representors.
pub const UDEV_RULE_FILE: &str = "etc/udev/rules.d/80-persistent-os-net-config.rules";

/// Rules that re-create VFs when a legacy-mode PF is re-plugged.
pub const UDEV_LEGACY_RULE_FILE: &str = "etc/udev/rules.d/70-os-net-config-sriov.rules";

/// Helper that maps a representor port name to a VF number.
pub const REP_LINK_NAME_FILE: &str = "etc/udev/rep-link-name.sh";

/// SR-IOV configuration map written by the network configuration tool.
pub const SRIOV_CONFIG_FILE: &str = "var/lib/os-net-config/sriov_config.yaml";

/// PCI addresses the bind service attaches to DPDK-capable drivers.
pub const SRIOV_BIND_CONFIG_FILE: &str = "var/lib/os-net-config/sriov_bind_config.yaml";

// Leftovers from the older deployment tooling.
const IFUP_LOCAL_FILE: &str = "sbin/ifup-local";
const RESET_SRIOV_RULES_FILE: &str = "etc/udev/rules.d/70-tripleo-reset-sriov.rules";
const ALLOCATE_VFS_FILE: &str = "etc/sysconfig/allocate_vfs";

/// Resolved host paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    /// sysfs mount point (normally `/sys`)
    pub sysfs_root: PathBuf,
    /// devfs mount point (normally `/dev`)
    pub dev_root: PathBuf,
    pub udev_rules_file: PathBuf,
    pub udev_legacy_rules_file: PathBuf,
    pub rep_link_name_script: PathBuf,
    pub sriov_config_file: PathBuf,
    pub bind_config_file: PathBuf,
    pub ifup_local_file: PathBuf,
    pub reset_sriov_rules_file: PathBuf,
    pub allocate_vfs_file: PathBuf,
}

impl Paths {
    /// Paths for the running host.
    ///
    /// Resolution order:
    /// 1. `SRIOV_CONFIG_ROOT` prefixes every configuration path
    /// 2. `SRIOV_SYSFS_ROOT` replaces the sysfs mount point
    /// 3. Otherwise the standard locations under `/`
    pub fn system() -> Self {
        let root = std::env::var(CONFIG_ROOT_ENV).map(PathBuf::from).unwrap_or_else(|_| "/".into());
        let mut paths = Self::under(&root);

        paths.sysfs_root = match std::env::var(SYSFS_ROOT_ENV) {
            Ok(dir) => PathBuf::from(dir),
            Err(_) if root == Path::new("/") => PathBuf::from("/sys"),
            Err(_) => root.join("sys"),
        };
        paths
    }

    /// Lay out every path below `root`, including `sys/` and `dev/`.
    pub fn under(root: &Path) -> Self {
        Self {
            sysfs_root: root.join("sys"),
            dev_root: root.join("dev"),
            udev_rules_file: root.join(UDEV_RULE_FILE),
            udev_legacy_rules_file: root.join(UDEV_LEGACY_RULE_FILE),
            rep_link_name_script: root.join(REP_LINK_NAME_FILE),
            sriov_config_file: root.join(SRIOV_CONFIG_FILE),
            bind_config_file: root.join(SRIOV_BIND_CONFIG_FILE),
            ifup_local_file: root.join(IFUP_LOCAL_FILE),
            reset_sriov_rules_file: root.join(RESET_SRIOV_RULES_FILE),
            allocate_vfs_file: root.join(ALLOCATE_VFS_FILE),
        }
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::system()
    }
}
