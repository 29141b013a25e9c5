//! `sriov-config --numvfs DEVICE:COUNT`
//!
//! Run by the legacy re-plug udev rule when a PF appears again.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use sriov_core::{Paths, Provisioner, SriovConfig};
use std::path::Path;
use tracing::info;

static NUMVFS_ARG_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\w+:\d+$").expect("Invalid numvfs regex"));

/// A parsed `DEVICE:COUNT` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumVfsArg {
    pub device: String,
    pub numvfs: u32,
}

/// clap value parser for `--numvfs`.
pub fn parse_numvfs_arg(value: &str) -> Result<NumVfsArg, String> {
    if !NUMVFS_ARG_REGEX.is_match(value) {
        return Err(format!("Invalid numvfs format: {} (expected DEVICE:COUNT)", value));
    }
    let (device, count) = value
        .split_once(':')
        .ok_or_else(|| format!("Invalid numvfs format: {}", value))?;
    let numvfs = count
        .parse()
        .map_err(|e| format!("Invalid VF count {}: {}", count, e))?;
    Ok(NumVfsArg { device: device.to_string(), numvfs })
}

/// Set the VF count of one PF.
///
/// Whether the PF is a vDPA PF comes from the configuration map; a PF
/// missing from the map is treated as a plain one.
pub async fn set_numvfs(paths: Paths, config_path: &Path, arg: &NumVfsArg) -> Result<()> {
    let config = SriovConfig::load(config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    let vdpa = config.pf(&arg.device).map(|pf| pf.vdpa).unwrap_or(false);

    let numvfs = Provisioner::system(paths)
        .set_numvfs(&arg.device, arg.numvfs, vdpa)
        .await
        .with_context(|| format!("Failed to set numvfs on {}", arg.device))?;

    info!("{}: {} VFs configured", arg.device, numvfs);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_numvfs_arg() {
        assert_eq!(
            parse_numvfs_arg("ens1f0:8").unwrap(),
            NumVfsArg { device: "ens1f0".to_string(), numvfs: 8 }
        );
        assert_eq!(parse_numvfs_arg("p1p1:0").unwrap().numvfs, 0);
    }

    #[test]
    fn test_parse_numvfs_arg_rejects_malformed() {
        for bad in ["", "p1p1", "p1p1:", ":4", "p1p1:4:5", "p1-p1:4", "p1p1:-1", "p1p1: 4"] {
            assert!(parse_numvfs_arg(bad).is_err(), "{} should be rejected", bad);
        }
    }

    #[test]
    fn test_parse_numvfs_arg_overflow() {
        assert!(parse_numvfs_arg("p1p1:99999999999").is_err());
    }
}
