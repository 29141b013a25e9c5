//! Full provisioning run: every PF, then every VF.

use anyhow::{Context, Result};
use sriov_core::{Paths, ProvisionOptions, Provisioner, SriovConfig};
use std::path::Path;
use tracing::info;

pub async fn provision(paths: Paths, config_path: &Path, options: ProvisionOptions) -> Result<()> {
    let config = SriovConfig::load(config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    if config.devices.is_empty() {
        info!("No SR-IOV devices in {}", config_path.display());
        return Ok(());
    }

    let report = Provisioner::system(paths)
        .provision(&config, options)
        .await
        .context("SR-IOV provisioning failed")?;

    info!(
        configured = report.configured_pfs.len(),
        skipped = report.skipped_pfs.len(),
        vfs = report.tuned_vfs,
        "SR-IOV provisioning complete"
    );
    Ok(())
}
