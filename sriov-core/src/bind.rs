//! DPDK bind map: which driver each unbound VF should end up on.
//!
//! The map is consumed by the separate binding service at boot. It is stored
//! as YAML, `driver: [pci, ...]`, and only ever grows.

use crate::error::{Result, SriovError};
use crate::sysfs::{PciAddress, Sysfs};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Driver name to PCI addresses.
pub type BindMap = BTreeMap<String, Vec<String>>;

/// Read the bind map. A missing or empty file is an empty map.
pub fn load(path: &Path) -> Result<BindMap> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BindMap::new()),
        Err(e) => return Err(SriovError::io(path, e)),
    };
    if content.trim().is_empty() {
        return Ok(BindMap::new());
    }
    serde_yaml::from_str(&content).map_err(|e| SriovError::InvalidConfig {
        reason: format!("Failed to parse bind map {}: {}", path.display(), e),
    })
}

/// Merge `pcis` under `driver` into the map at `path` and write it back.
///
/// # Returns
/// The merged map.
pub fn update(path: &Path, driver: &str, pcis: &[PciAddress]) -> Result<BindMap> {
    let mut map = load(path)?;
    let entry = map.entry(driver.to_string()).or_default();
    for pci in pcis {
        if !entry.iter().any(|known| known == pci.as_str()) {
            entry.push(pci.to_string());
        }
    }

    let content = serde_yaml::to_string(&map)
        .map_err(|e| SriovError::Internal(format!("Failed to serialize bind map: {}", e)))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| SriovError::io(parent, e))?;
    }
    fs::write(path, content).map_err(|e| SriovError::io(path, e))?;

    info!(path = %path.display(), driver, count = pcis.len(), "Updated DPDK bind map");
    Ok(map)
}

/// Bind every device of `map` to its driver right away.
pub fn bind_all(sysfs: &Sysfs, map: &BindMap) -> Result<()> {
    for (driver, pcis) in map {
        for pci in pcis {
            let pci: PciAddress = pci.parse()?;
            debug!(pci = %pci, driver = %driver, "Binding VF");
            sysfs.driver_bind(driver, &pci)?;
        }
    }
    Ok(())
}
