//! SR-IOV configuration map.
//!
//! The map is a YAML (or JSON) list of PF and VF descriptors, each tagged with
//! `device_type`. Toggles accept booleans as well as `on`/`off`.

use crate::error::{Result, SriovError};
use crate::sysfs::PciAddress;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

/// Flow steering mode used when a PF does not name one.
pub const DEFAULT_STEERING_MODE: &str = "smfs";

/// Highest valid 802.1Q VLAN ID.
pub const MAX_VLAN_ID: u16 = 4095;

/// Highest valid 802.1p priority.
pub const MAX_QOS: u8 = 7;

/// eswitch forwarding model of a PF.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkMode {
    #[default]
    Legacy,
    Switchdev,
}

/// A physical function and how it should be partitioned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PfDescriptor {
    pub name: String,
    pub numvfs: u32,
    #[serde(default)]
    pub link_mode: LinkMode,
    #[serde(default)]
    pub vdpa: bool,
    #[serde(default, with = "on_off", skip_serializing_if = "Option::is_none")]
    pub promisc: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steering_mode: Option<String>,
}

impl PfDescriptor {
    pub fn is_switchdev(&self) -> bool {
        self.link_mode == LinkMode::Switchdev
    }

    pub fn steering_mode(&self) -> &str {
        self.steering_mode.as_deref().unwrap_or(DEFAULT_STEERING_MODE)
    }
}

/// PF and VF index a VF descriptor refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VfParent {
    pub name: String,
    pub vfid: u32,
}

/// Administrative link state of a VF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VfLinkState {
    Auto,
    Enable,
    Disable,
}

impl VfLinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Enable => "enable",
            Self::Disable => "disable",
        }
    }
}

/// Per-VF settings. Absent fields leave the kernel default in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VfDescriptor {
    pub name: String,
    pub device: VfParent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub macaddr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan_id: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qos: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tx_rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_tx_rate: Option<u32>,
    #[serde(default, with = "on_off", skip_serializing_if = "Option::is_none")]
    pub spoofcheck: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<VfLinkState>,
    #[serde(default, with = "on_off", skip_serializing_if = "Option::is_none")]
    pub trust: Option<bool>,
    #[serde(default, with = "on_off", skip_serializing_if = "Option::is_none")]
    pub promisc: Option<bool>,
    /// Driver override applied through `driverctl`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pci_address: Option<String>,
}

/// One entry of the configuration map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "device_type", rename_all = "lowercase")]
pub enum SriovDevice {
    Pf(PfDescriptor),
    Vf(VfDescriptor),
}

/// Ordered list of devices. Order is preserved and meaningful.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SriovConfig {
    pub devices: Vec<SriovDevice>,
}

impl SriovConfig {
    /// Load the map from disk. A missing file is an empty map.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No SR-IOV configuration, nothing to do");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| SriovError::io(path, e))?;
        Self::from_str(&content)
    }

    /// Parse and validate a YAML or JSON document.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(content).map_err(|e| SriovError::InvalidConfig {
            reason: format!("Failed to parse SR-IOV config: {}", e),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn pfs(&self) -> impl Iterator<Item = &PfDescriptor> {
        self.devices.iter().filter_map(|d| match d {
            SriovDevice::Pf(pf) => Some(pf),
            SriovDevice::Vf(_) => None,
        })
    }

    pub fn vfs(&self) -> impl Iterator<Item = &VfDescriptor> {
        self.devices.iter().filter_map(|d| match d {
            SriovDevice::Vf(vf) => Some(vf),
            SriovDevice::Pf(_) => None,
        })
    }

    pub fn pf(&self, name: &str) -> Option<&PfDescriptor> {
        self.pfs().find(|pf| pf.name == name)
    }

    pub fn has_vdpa(&self) -> bool {
        self.pfs().any(|pf| pf.vdpa)
    }

    /// Name of the first VF descriptor that claims a VF of `pf_name`.
    pub fn claimed_vf(&self, pf_name: &str) -> Option<&str> {
        self.vfs().find(|vf| vf.device.name == pf_name).map(|vf| vf.name.as_str())
    }

    /// Check cross-entry constraints serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for pf in self.pfs() {
            if pf.name.is_empty() {
                return Err(invalid("PF entry without a name".to_string()));
            }
            if !seen.insert(pf.name.as_str()) {
                return Err(invalid(format!("PF {} is listed more than once", pf.name)));
            }
        }

        for vf in self.vfs() {
            if vf.device.name.is_empty() {
                return Err(invalid(format!("VF {} has no parent PF", vf.name)));
            }
            if let Some(vlan) = vf.vlan_id {
                if vlan > MAX_VLAN_ID {
                    return Err(invalid(format!("VF {}: vlan_id {} out of range", vf.name, vlan)));
                }
            }
            if let Some(qos) = vf.qos {
                if qos > MAX_QOS {
                    return Err(invalid(format!("VF {}: qos {} out of range", vf.name, qos)));
                }
            }
            if let Some(pci) = &vf.pci_address {
                pci.parse::<PciAddress>()?;
            }
        }
        Ok(())
    }
}

fn invalid(reason: String) -> SriovError {
    SriovError::InvalidConfig { reason }
}

/// `Option<bool>` that also reads `on`/`off` and writes them back.
mod on_off {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Toggle {
        Bool(bool),
        Text(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<Toggle>::deserialize(deserializer)? {
            None => Ok(None),
            Some(Toggle::Bool(b)) => Ok(Some(b)),
            Some(Toggle::Text(s)) => match s.to_ascii_lowercase().as_str() {
                "on" | "true" | "yes" => Ok(Some(true)),
                "off" | "false" | "no" => Ok(Some(false)),
                other => Err(D::Error::custom(format!("expected on/off, got {:?}", other))),
            },
        }
    }

    pub fn serialize<S>(value: &Option<bool>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(true) => serializer.serialize_str("on"),
            Some(false) => serializer.serialize_str("off"),
            None => serializer.serialize_none(),
        }
    }
}
