use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = sriov_core::udev::BINARY_NAME)]
#[command(about = "Configure SR-IOV PFs and VFs from the SR-IOV configuration map", long_about = None)]
struct Cli {
    /// Set the VF count of a single PF (DEVICE:COUNT), as done on re-plug
    #[arg(short, long, value_name = "DEVICE:COUNT", value_parser = commands::numvfs::parse_numvfs_arg)]
    numvfs: Option<commands::numvfs::NumVfsArg>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Enable informational logging
    #[arg(short, long)]
    verbose: bool,

    /// Path to the SR-IOV configuration map
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bring PFs up after switchdev and bind DPDK VFs immediately
    #[arg(long)]
    interactive: bool,

    /// Restart Open vSwitch and bounce every PF afterwards
    #[arg(long)]
    restart_openvswitch: bool,
}

impl Cli {
    fn log_level(&self) -> tracing::Level {
        if self.debug {
            tracing::Level::DEBUG
        } else if self.verbose {
            tracing::Level::INFO
        } else {
            tracing::Level::WARN
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    sriov_core::init_observability(cli.log_level())
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    let paths = sriov_core::Paths::system();
    let config_path = cli.config.clone().unwrap_or_else(|| paths.sriov_config_file.clone());

    match cli.numvfs {
        Some(arg) => {
            commands::numvfs::set_numvfs(paths, &config_path, &arg).await?;
        }
        None => {
            let options = sriov_core::ProvisionOptions {
                interactive: cli.interactive,
                restart_openvswitch: cli.restart_openvswitch,
            };
            commands::provision(paths, &config_path, options).await?;
        }
    }

    Ok(())
}
