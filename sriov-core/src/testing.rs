//! Test doubles shared by the unit tests.

use crate::command::{CommandOutput, CommandRunner, Invocation};
use crate::error::{Result, SriovError};
use crate::events::{EventMonitor, MonitorHandle, UdevEvent};
use crate::paths::Paths;
use crate::sysfs::{PciAddress, Sysfs, MLX5_DRIVER};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::TempDir;
use tokio::sync::mpsc;

/// A scratch host: sysfs tree plus `/etc` and `/var` below one temp dir.
pub struct FakeSysfs {
    dir: TempDir,
}

impl FakeSysfs {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sys/bus/pci/drivers").join(MLX5_DRIVER)).unwrap();
        fs::create_dir_all(dir.path().join("etc/udev/rules.d")).unwrap();
        fs::create_dir_all(dir.path().join("dev")).unwrap();
        Self { dir }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn paths(&self) -> Paths {
        Paths::under(self.dir.path())
    }

    pub fn sysfs(&self) -> Sysfs {
        Sysfs::new(self.dir.path().join("sys"))
    }

    fn sys(&self) -> PathBuf {
        self.dir.path().join("sys")
    }

    pub fn add_pf(&self, name: &str, pci: &str, device_id: &str, vendor_id: &str) {
        let net = self.sys().join("class/net").join(name);
        let device = net.join("device");
        fs::create_dir_all(&device).unwrap();
        fs::write(device.join("uevent"), format!("DRIVER=mlx5_core\nPCI_SLOT_NAME={}\n", pci))
            .unwrap();
        fs::write(device.join("device"), format!("{}\n", device_id)).unwrap();
        fs::write(device.join("vendor"), format!("{}\n", vendor_id)).unwrap();
        fs::write(device.join("sriov_numvfs"), "0\n").unwrap();
        fs::write(net.join("phys_switch_id"), "").unwrap();
        fs::write(net.join("address"), "0c:42:a1:00:00:00\n").unwrap();
    }

    /// Create VF `vfid` of `pf`: the `virtfn` entry, a bound driver, and the
    /// VF netdev under `devices/` with its `physfn/net` back-reference.
    pub fn add_vf(&self, pf: &str, vfid: u32, pci: &str, vf_name: &str) -> PathBuf {
        let virtfn = self.sys().join("class/net").join(pf).join(format!("device/virtfn{}", vfid));
        fs::create_dir_all(&virtfn).unwrap();
        fs::write(virtfn.join("uevent"), format!("PCI_SLOT_NAME={}\n", pci)).unwrap();

        let device_dir = self.sys().join("devices/pci0000:00").join(pci);
        let syspath = device_dir.join("net").join(vf_name);
        fs::create_dir_all(&syspath).unwrap();
        fs::create_dir_all(device_dir.join("physfn/net").join(pf)).unwrap();

        let vf_net = self.sys().join("class/net").join(vf_name);
        fs::create_dir_all(&vf_net).unwrap();
        fs::write(vf_net.join("address"), format!("0c:42:a1:00:01:{:02x}\n", vfid)).unwrap();

        self.bind_driver(&pci.parse().unwrap(), MLX5_DRIVER);
        syspath
    }

    pub fn bind_driver(&self, pci: &PciAddress, driver: &str) {
        let device_dir = self.sys().join("bus/pci/devices").join(pci.as_str());
        fs::create_dir_all(&device_dir).unwrap();
        let driver_dir = self.sys().join("bus/pci/drivers").join(driver);
        fs::create_dir_all(&driver_dir).unwrap();
        let link = device_dir.join("driver");
        if !link.exists() {
            std::os::unix::fs::symlink(&driver_dir, link).unwrap();
        }
    }

    pub fn set_numvfs(&self, pf: &str, numvfs: u32) {
        fs::write(self.sysfs().numvfs_path(pf), numvfs.to_string()).unwrap();
    }

    pub fn numvfs(&self, pf: &str) -> String {
        fs::read_to_string(self.sysfs().numvfs_path(pf)).unwrap().trim().to_string()
    }

    pub fn set_phys_switch_id(&self, pf: &str, id: &str) {
        fs::write(self.sys().join("class/net").join(pf).join("phys_switch_id"), id).unwrap();
    }

    pub fn unbound_devices(&self) -> Vec<String> {
        fs::read_to_string(self.sys().join("bus/pci/drivers").join(MLX5_DRIVER).join("unbind"))
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn read(&self, path: &Path) -> Option<String> {
        fs::read_to_string(path).ok()
    }
}

/// Build an `add` event for a syspath.
pub fn add_event(syspath: &Path) -> UdevEvent {
    UdevEvent { action: "add".to_string(), device_syspath: syspath.to_path_buf() }
}

/// Monitor replaying a fixed list of events. Later starts see a closed,
/// empty channel.
pub struct SeededMonitor {
    events: Mutex<Option<mpsc::UnboundedReceiver<UdevEvent>>>,
}

impl SeededMonitor {
    pub fn new(events: Vec<UdevEvent>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        for event in events {
            tx.send(event).unwrap();
        }
        Self { events: Mutex::new(Some(rx)) }
    }
}

impl EventMonitor for SeededMonitor {
    fn start(&self) -> Result<MonitorHandle> {
        let rx = self.events.lock().unwrap().take().unwrap_or_else(|| mpsc::unbounded_channel().1);
        Ok(MonitorHandle::from_receiver(rx))
    }
}

type Hook = Box<dyn Fn(&Invocation) + Send + Sync>;

/// Command runner that records every invocation and replays scripted results.
#[derive(Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<Invocation>>,
    failures: Mutex<Vec<String>>,
    responses: Mutex<Vec<(String, String)>>,
    hooks: Mutex<Vec<Hook>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every invocation whose command line contains `needle`.
    pub fn fail_when(&self, needle: &str) {
        self.failures.lock().unwrap().push(needle.to_string());
    }

    /// Return `stdout` for invocations whose command line contains `needle`.
    pub fn respond(&self, needle: &str, stdout: &str) {
        self.responses.lock().unwrap().push((needle.to_string(), stdout.to_string()));
    }

    /// Run `hook` before every invocation is answered.
    pub fn on_call(&self, hook: impl Fn(&Invocation) + Send + Sync + 'static) {
        self.hooks.lock().unwrap().push(Box::new(hook));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(Invocation::command_line).collect()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.calls().iter().filter(|c| c.contains(needle)).count()
    }
}

#[async_trait::async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        for hook in self.hooks.lock().unwrap().iter() {
            hook(invocation);
        }
        self.calls.lock().unwrap().push(invocation.clone());

        let line = invocation.command_line();
        if self.failures.lock().unwrap().iter().any(|n| line.contains(n.as_str())) {
            return Err(SriovError::CommandFailed { command: line, reason: "scripted failure".into() });
        }

        let stdout = self
            .responses
            .lock()
            .unwrap()
            .iter()
            .find(|(n, _)| line.contains(n.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default();
        Ok(CommandOutput { stdout, stderr: String::new() })
    }
}
