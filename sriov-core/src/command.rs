//! External command execution.
//!
//! Every program the provisioner shells out to (`ip`, `devlink`, `ethtool`,
//! `udevadm`, `vdpa`, ...) goes through [`CommandRunner`], so control flow can
//! be exercised against a recording double.

use crate::error::{Result, SriovError};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, instrument, warn};

/// Program locations.
pub mod programs {
    pub const IP: &str = "ip";
    pub const DEVLINK: &str = "/usr/sbin/devlink";
    pub const ETHTOOL: &str = "/usr/sbin/ethtool";
    pub const UDEVADM: &str = "/usr/sbin/udevadm";
    pub const VDPA: &str = "vdpa";
    pub const SYSTEMCTL: &str = "/usr/bin/systemctl";
    pub const IFUP: &str = "/sbin/ifup";
    pub const IFDOWN: &str = "/sbin/ifdown";
    pub const MODPROBE: &str = "modprobe";
    pub const RESTORECON: &str = "restorecon";
    pub const DRIVERCTL: &str = "driverctl";
}

/// Attempts for `ip link` commands, which race with udev renames.
pub const IP_ATTEMPTS: u32 = 10;

/// Delay between `ip link` attempts.
pub const IP_RETRY_DELAY: Duration = Duration::from_secs(1);

/// One external program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// Total tries, including the first one. Never zero.
    pub attempts: u32,
    pub retry_delay: Duration,
}

impl Invocation {
    /// Single-shot invocation.
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            attempts: 1,
            retry_delay: Duration::ZERO,
        }
    }

    /// `ip` invocation with the standard retry policy.
    pub fn ip<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(programs::IP, args).with_retries(IP_ATTEMPTS, IP_RETRY_DELAY)
    }

    pub fn with_retries(mut self, attempts: u32, retry_delay: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.retry_delay = retry_delay;
        self
    }

    /// Human-readable command line, for logs and errors.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured output of a successful invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs external programs.
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the invocation, retrying per its policy.
    ///
    /// # Returns
    /// * `Ok(output)` if any attempt exited successfully
    /// * `Err(SriovError::CommandFailed)` once every attempt failed
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput>;
}

/// Runs programs on the host with `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner;

#[async_trait::async_trait]
impl CommandRunner for SystemCommandRunner {
    #[instrument(skip(self), fields(command = %invocation.command_line()))]
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        let mut attempt = 1;
        loop {
            debug!(attempt, "Running command");
            let reason = match Command::new(&invocation.program).args(&invocation.args).output().await
            {
                Ok(output) if output.status.success() => {
                    return Ok(CommandOutput {
                        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                    });
                }
                Ok(output) => format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
                Err(e) => format!("failed to spawn: {}", e),
            };

            if attempt >= invocation.attempts {
                error!(attempts = attempt, "Command failed: {}", reason);
                metrics::counter!("sriov_command_failures_total", "program" => invocation.program.clone())
                    .increment(1);
                return Err(SriovError::CommandFailed {
                    command: invocation.command_line(),
                    reason,
                });
            }

            warn!(attempt, "Command failed, retrying: {}", reason);
            tokio::time::sleep(invocation.retry_delay).await;
            attempt += 1;
        }
    }
}
