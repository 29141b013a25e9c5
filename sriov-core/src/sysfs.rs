//! Kernel pseudo-file access for SR-IOV network interfaces.
//!
//! Resolves PF/VF PCI addresses and reads or writes the handful of sysfs
//! attributes the provisioner depends on. All paths hang off a configurable
//! root so the accessor can run against a fake tree.

use crate::error::{Result, SriovError};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

/// Vendor ID of Mellanox/NVIDIA ConnectX NICs.
pub const MELLANOX_VENDOR_ID: &str = "0x15b3";

/// Kernel driver for ConnectX PFs and VFs.
pub const MLX5_DRIVER: &str = "mlx5_core";

/// Regular expression to validate PCI address format: 0000:01:00.0
static PCI_ADDRESS_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-fA-F]{4}:[0-9a-fA-F]{2}:[0-9a-fA-F]{2}\.[0-7]$")
        .expect("Invalid PCI address regex")
});

static PCI_SLOT_NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^PCI_SLOT_NAME=(.*)$").expect("Invalid PCI_SLOT_NAME regex"));

/// A PCI address in `domain:bus:device.function` form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PciAddress(String);

impl PciAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// PCI function number (the digit after the dot).
    pub fn function(&self) -> u8 {
        // The format check guarantees a single octal digit here.
        self.0.as_bytes()[self.0.len() - 1] - b'0'
    }
}

impl FromStr for PciAddress {
    type Err = SriovError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if !PCI_ADDRESS_REGEX.is_match(s) {
            return Err(SriovError::InvalidConfig {
                reason: format!("Invalid PCI address format: {} (expected: 0000:01:00.0)", s),
            });
        }
        Ok(Self(s.to_lowercase()))
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Extract `PCI_SLOT_NAME` from the contents of a device `uevent` file.
pub fn parse_pci_slot_name(uevent: &str) -> Option<PciAddress> {
    PCI_SLOT_NAME_REGEX
        .captures(uevent)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Accessor for `/sys` (or a stand-in tree with the same layout).
#[derive(Debug, Clone)]
pub struct Sysfs {
    root: PathBuf,
}

impl Sysfs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `/sys/class/net/<ifname>`
    pub fn net_dir(&self, ifname: &str) -> PathBuf {
        self.root.join("class/net").join(ifname)
    }

    /// `/sys/class/net/<ifname>/device/<attr>`
    pub fn device_attr_path(&self, ifname: &str, attr: &str) -> PathBuf {
        self.net_dir(ifname).join("device").join(attr)
    }

    /// `/sys/class/net/<ifname>/device/sriov_numvfs`
    pub fn numvfs_path(&self, ifname: &str) -> PathBuf {
        self.device_attr_path(ifname, "sriov_numvfs")
    }

    /// `/sys/bus/pci/devices/<pci>`
    pub fn pci_device_dir(&self, pci: &PciAddress) -> PathBuf {
        self.root.join("bus/pci/devices").join(pci.as_str())
    }

    /// `/sys/bus/pci/drivers/<driver>`
    pub fn pci_driver_dir(&self, driver: &str) -> PathBuf {
        self.root.join("bus/pci/drivers").join(driver)
    }

    /// Read a sysfs attribute, trimmed.
    pub fn read_attr(&self, path: &Path) -> Result<String> {
        fs::read_to_string(path)
            .map(|s| s.trim().to_string())
            .map_err(|e| SriovError::io(path, e))
    }

    /// Write a sysfs attribute.
    pub fn write_attr(&self, path: &Path, value: &str) -> Result<()> {
        debug!(path = %path.display(), value, "Writing sysfs attribute");
        fs::write(path, value).map_err(|e| SriovError::io(path, e))
    }

    /// PCI address of a PF, from `device/uevent`.
    pub fn pf_pci_address(&self, ifname: &str) -> Result<PciAddress> {
        self.pci_address_from_uevent(&self.device_attr_path(ifname, "uevent"))
    }

    /// PCI device ID of a PF (e.g. `0x1017`).
    pub fn device_id(&self, ifname: &str) -> Result<String> {
        self.read_attr(&self.device_attr_path(ifname, "device"))
    }

    /// PCI vendor ID of a PF (e.g. `0x15b3`).
    pub fn vendor_id(&self, ifname: &str) -> Result<String> {
        self.read_attr(&self.device_attr_path(ifname, "vendor"))
    }

    /// Whether the interface sits on a Mellanox/NVIDIA NIC.
    pub fn is_mellanox(&self, ifname: &str) -> bool {
        self.vendor_id(ifname).is_ok_and(|v| v.eq_ignore_ascii_case(MELLANOX_VENDOR_ID))
    }

    /// PCI addresses of every VF of a PF, ordered by VF index.
    pub fn vf_pci_addresses(&self, ifname: &str) -> Result<Vec<PciAddress>> {
        let device_dir = self.net_dir(ifname).join("device");
        let entries = fs::read_dir(&device_dir).map_err(|e| SriovError::io(&device_dir, e))?;

        let mut vf_ids: Vec<u32> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                entry.file_name().to_str()?.strip_prefix("virtfn")?.parse().ok()
            })
            .collect();
        vf_ids.sort_unstable();

        vf_ids.into_iter().map(|vfid| self.vf_pci_address(ifname, vfid)).collect()
    }

    /// PCI address of VF `vfid` of a PF, from `device/virtfn<vfid>/uevent`.
    pub fn vf_pci_address(&self, ifname: &str, vfid: u32) -> Result<PciAddress> {
        self.pci_address_from_uevent(
            &self.device_attr_path(ifname, &format!("virtfn{}/uevent", vfid)),
        )
    }

    /// `phys_switch_id` of an interface, if populated.
    ///
    /// The attribute exists but is empty until the eswitch exposes the uplink
    /// representor.
    pub fn phys_switch_id(&self, ifname: &str) -> Option<String> {
        self.read_attr(&self.net_dir(ifname).join("phys_switch_id"))
            .ok()
            .filter(|id| !id.is_empty())
    }

    /// MAC address of an interface.
    pub fn mac_address(&self, ifname: &str) -> Result<String> {
        self.read_attr(&self.net_dir(ifname).join("address"))
    }

    /// Whether a driver is bound to a PCI device.
    pub fn has_driver(&self, pci: &PciAddress) -> bool {
        self.pci_device_dir(pci).join("driver").exists()
    }

    /// Name of the driver currently bound to a PCI device.
    pub fn bound_driver(&self, pci: &PciAddress) -> Option<String> {
        fs::read_link(self.pci_device_dir(pci).join("driver"))
            .ok()
            .and_then(|target| target.file_name().map(|n| n.to_string_lossy().to_string()))
    }

    /// Unbind a VF from the mlx5 driver.
    ///
    /// # Returns
    /// * `Ok(true)` if the device was unbound
    /// * `Ok(false)` if no driver was bound
    pub fn driver_unbind(&self, pci: &PciAddress) -> Result<bool> {
        if !self.has_driver(pci) {
            info!(pci = %pci, "No driver to unbind");
            return Ok(false);
        }

        info!(pci = %pci, "Unbinding driver");
        self.write_attr(&self.pci_driver_dir(MLX5_DRIVER).join("unbind"), pci.as_str())?;
        Ok(true)
    }

    /// Bind a PCI device to `driver`. No-op if it is already bound to it.
    pub fn driver_bind(&self, driver: &str, pci: &PciAddress) -> Result<()> {
        if self.bound_driver(pci).as_deref() == Some(driver) {
            debug!(pci = %pci, driver, "Device already bound");
            return Ok(());
        }

        info!(pci = %pci, driver, "Binding driver");
        self.write_attr(&self.pci_driver_dir(driver).join("bind"), pci.as_str())
    }

    fn pci_address_from_uevent(&self, path: &Path) -> Result<PciAddress> {
        let uevent = self.read_attr(path)?;
        parse_pci_slot_name(&uevent).ok_or_else(|| SriovError::SysfsParse {
            path: path.to_path_buf(),
            reason: "no valid PCI_SLOT_NAME entry".to_string(),
        })
    }
}

impl Default for Sysfs {
    fn default() -> Self {
        Self::new("/sys")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeSysfs;

    #[test]
    fn test_pci_address_validation() {
        assert!("0000:01:00.0".parse::<PciAddress>().is_ok());
        assert!("0000:ff:1f.7".parse::<PciAddress>().is_ok());
        assert_eq!("ABCD:12:34.5".parse::<PciAddress>().unwrap().as_str(), "abcd:12:34.5");

        assert!("01:00.0".parse::<PciAddress>().is_err()); // Missing domain
        assert!("0000:01:00".parse::<PciAddress>().is_err()); // Missing function
        assert!("0000:01:00.8".parse::<PciAddress>().is_err()); // Invalid function (max 7)
        assert!("invalid".parse::<PciAddress>().is_err());
    }

    #[test]
    fn test_pci_function() {
        assert_eq!("0000:3b:00.1".parse::<PciAddress>().unwrap().function(), 1);
        assert_eq!("0000:3b:00.0".parse::<PciAddress>().unwrap().function(), 0);
    }

    #[test]
    fn test_parse_pci_slot_name() {
        let uevent = "DRIVER=mlx5_core\nPCI_CLASS=20000\nPCI_SLOT_NAME=0000:3b:00.0\nMODALIAS=pci:v000015B3";
        assert_eq!(parse_pci_slot_name(uevent).unwrap().as_str(), "0000:3b:00.0");
        assert!(parse_pci_slot_name("DRIVER=mlx5_core\n").is_none());
    }

    #[test]
    fn test_pf_attributes() {
        let fake = FakeSysfs::new();
        fake.add_pf("ens1f0", "0000:3b:00.0", "0x1017", MELLANOX_VENDOR_ID);
        let sysfs = fake.sysfs();

        assert_eq!(sysfs.pf_pci_address("ens1f0").unwrap().as_str(), "0000:3b:00.0");
        assert_eq!(sysfs.device_id("ens1f0").unwrap(), "0x1017");
        assert!(sysfs.is_mellanox("ens1f0"));
        assert!(!sysfs.is_mellanox("missing0"));
    }

    #[test]
    fn test_vf_pci_addresses_ordered() {
        let fake = FakeSysfs::new();
        fake.add_pf("ens1f0", "0000:3b:00.0", "0x1017", MELLANOX_VENDOR_ID);
        for vfid in [10, 2, 0, 1] {
            let pci = format!("0000:3b:{:02x}.0", vfid + 1);
            fake.add_vf("ens1f0", vfid, &pci, &format!("ens1f0v{}", vfid));
        }

        // Numeric order: virtfn10 comes after virtfn2.
        let vfs = fake.sysfs().vf_pci_addresses("ens1f0").unwrap();
        let addrs: Vec<_> = vfs.iter().map(PciAddress::as_str).collect();
        assert_eq!(addrs, vec!["0000:3b:01.0", "0000:3b:02.0", "0000:3b:03.0", "0000:3b:0b.0"]);
    }

    #[test]
    fn test_phys_switch_id_empty_is_none() {
        let fake = FakeSysfs::new();
        fake.add_pf("ens1f0", "0000:3b:00.0", "0x1017", MELLANOX_VENDOR_ID);
        let sysfs = fake.sysfs();

        assert!(sysfs.phys_switch_id("ens1f0").is_none());
        fake.set_phys_switch_id("ens1f0", "2c6a5bfffe0e0e0e");
        assert_eq!(sysfs.phys_switch_id("ens1f0").as_deref(), Some("2c6a5bfffe0e0e0e"));
    }

    #[test]
    fn test_driver_unbind_idempotent() {
        let fake = FakeSysfs::new();
        let pci: PciAddress = "0000:3b:00.2".parse().unwrap();
        let sysfs = fake.sysfs();

        // No driver symlink: nothing to do.
        assert!(!sysfs.driver_unbind(&pci).unwrap());
        assert!(fake.unbound_devices().is_empty());

        fake.bind_driver(&pci, MLX5_DRIVER);
        assert!(sysfs.driver_unbind(&pci).unwrap());
        assert_eq!(fake.unbound_devices(), vec!["0000:3b:00.2".to_string()]);
    }
}
