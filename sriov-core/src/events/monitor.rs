//! Netlink uevent monitor for the `net` subsystem.
//!
//! A dedicated thread reads `NETLINK_KOBJECT_UEVENT` datagrams and forwards
//! matching ones, in arrival order, onto an unbounded channel. The thread
//! carries no provisioning logic; consumers decide what an event means.

use super::UdevEvent;
use crate::error::{Result, SriovError};
use std::collections::HashMap;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Multicast group of uevents re-broadcast by udevd after rule processing.
pub const UDEV_GROUP: u32 = 2;

const LIBUDEV_PREFIX: &[u8] = b"libudev\0";
const LIBUDEV_MAGIC: u32 = 0xfeed_cafe;
const LIBUDEV_HEADER_LEN: usize = 40;

/// How long the reader blocks before re-checking for shutdown.
const POLL_INTERVAL_MS: libc::c_int = 250;
const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Starts kernel event delivery.
pub trait EventMonitor: Send + Sync {
    /// Subscribe and start forwarding events.
    ///
    /// Every successful `start` must be paired with exactly one
    /// [`MonitorHandle::stop`] (or drop of the handle).
    fn start(&self) -> Result<MonitorHandle>;
}

/// A running subscription and the receiving end of its channel.
pub struct MonitorHandle {
    events: mpsc::UnboundedReceiver<UdevEvent>,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Wrap a channel fed by something other than a monitor thread.
    pub fn from_receiver(events: mpsc::UnboundedReceiver<UdevEvent>) -> Self {
        Self { events, shutdown: Arc::new(AtomicBool::new(false)), worker: None }
    }

    pub fn events(&mut self) -> &mut mpsc::UnboundedReceiver<UdevEvent> {
        &mut self.events
    }

    /// Stop the subscription and release the socket.
    pub fn stop(mut self) {
        self.shutdown_worker();
    }

    fn shutdown_worker(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("uevent monitor thread panicked");
            }
            info!("Kernel event monitor stopped");
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.shutdown_worker();
    }
}

/// Uevent monitor over a netlink socket.
#[derive(Debug, Clone)]
pub struct NetlinkMonitor {
    sysfs_root: PathBuf,
    subsystem: String,
}

impl NetlinkMonitor {
    /// Monitor `net` events as published by udevd.
    pub fn new(sysfs_root: impl Into<PathBuf>) -> Self {
        Self { sysfs_root: sysfs_root.into(), subsystem: "net".to_string() }
    }

    fn open_socket(&self) -> Result<OwnedFd> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
                libc::NETLINK_KOBJECT_UEVENT,
            )
        };
        if fd < 0 {
            return Err(monitor_error("socket(AF_NETLINK)"));
        }
        // SAFETY: fd was just returned by socket() and is owned by nobody else.
        let socket = unsafe { OwnedFd::from_raw_fd(fd) };

        let on: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_PASSCRED,
                &on as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(monitor_error("setsockopt(SO_PASSCRED)"));
        }

        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_groups = UDEV_GROUP;

        let rc = unsafe {
            libc::bind(
                socket.as_raw_fd(),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(monitor_error("bind(NETLINK_KOBJECT_UEVENT)"));
        }

        Ok(socket)
    }
}

impl EventMonitor for NetlinkMonitor {
    fn start(&self) -> Result<MonitorHandle> {
        let socket = self.open_socket()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(AtomicBool::new(false));

        let reader = Reader {
            socket,
            tx,
            shutdown: Arc::clone(&shutdown),
            sysfs_root: self.sysfs_root.clone(),
            subsystem: self.subsystem.clone(),
        };
        let worker = std::thread::Builder::new()
            .name("uevent-monitor".to_string())
            .spawn(move || reader.run())
            .map_err(|e| SriovError::Monitor { reason: format!("spawn failed: {}", e) })?;

        info!(subsystem = %self.subsystem, group = UDEV_GROUP, "Kernel event monitor started");
        Ok(MonitorHandle { events: rx, shutdown, worker: Some(worker) })
    }
}

struct Reader {
    socket: OwnedFd,
    tx: mpsc::UnboundedSender<UdevEvent>,
    shutdown: Arc<AtomicBool>,
    sysfs_root: PathBuf,
    subsystem: String,
}

impl Reader {
    fn run(self) {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let fd = self.socket.as_raw_fd();

        while !self.shutdown.load(Ordering::Acquire) {
            let mut pollfd = libc::pollfd { fd, events: libc::POLLIN, revents: 0 };
            let rc = unsafe { libc::poll(&mut pollfd, 1, POLL_INTERVAL_MS) };
            if rc < 0 {
                if std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                error!("poll on uevent socket failed: {}", std::io::Error::last_os_error());
                return;
            }
            if rc == 0 {
                continue;
            }

            let (n, sender) = match recv_datagram(fd, &mut buf) {
                Ok(received) => received,
                Err(e) => {
                    warn!("recvmsg on uevent socket failed: {}", e);
                    continue;
                }
            };
            if let Err(reason) = check_sender(&sender) {
                debug!(nl_pid = sender.nl_pid, uid = ?sender.uid, "Dropping uevent: {}", reason);
                continue;
            }

            let Some(uevent) = parse_uevent(&buf[..n]) else {
                continue;
            };
            if uevent.subsystem() != Some(self.subsystem.as_str()) {
                continue;
            }
            let Some(event) = uevent.to_event(&self.sysfs_root) else {
                continue;
            };

            info!(action = %event.action, device = %event.device_syspath.display(), "Received udev event");
            if self.tx.send(event).is_err() {
                debug!("Event receiver dropped, stopping monitor");
                return;
            }
        }
    }
}

/// Origin of a datagram on the udev multicast group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sender {
    /// Netlink port of the sending socket; 0 for the kernel.
    pub nl_pid: u32,
    /// Uid from `SCM_CREDENTIALS`, if the kernel attached any.
    pub uid: Option<u32>,
}

/// Accept only datagrams udevd (running as root, from userspace) sent.
///
/// Any local process may multicast on the netlink uevent groups.
pub fn check_sender(sender: &Sender) -> std::result::Result<(), &'static str> {
    match sender.uid {
        None => return Err("no sender credentials"),
        Some(0) => {}
        Some(_) => return Err("sender uid is not 0"),
    }
    if sender.nl_pid == 0 {
        return Err("kernel sender on the udev group");
    }
    Ok(())
}

/// Receive one datagram into `buf` along with its sender.
fn recv_datagram(fd: libc::c_int, buf: &mut [u8]) -> std::io::Result<(usize, Sender)> {
    let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
    let mut iov = libc::iovec { iov_base: buf.as_mut_ptr() as *mut libc::c_void, iov_len: buf.len() };
    // u64 elements keep the control buffer aligned for cmsghdr.
    let mut control = [0u64; 8];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = &mut addr as *mut libc::sockaddr_nl as *mut libc::c_void;
    msg.msg_namelen = mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = mem::size_of_val(&control) as _;

    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if n < 0 {
        return Err(std::io::Error::last_os_error());
    }

    let mut uid = None;
    // SAFETY: msg was filled in by recvmsg and control outlives the walk.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_CREDENTIALS {
                let cred = std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::ucred);
                uid = Some(cred.uid);
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok((n as usize, Sender { nl_pid: addr.nl_pid, uid }))
}

/// Properties of one uevent datagram.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawUevent {
    pub properties: HashMap<String, String>,
}

impl RawUevent {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn subsystem(&self) -> Option<&str> {
        self.get("SUBSYSTEM")
    }

    /// Build an event, anchoring `DEVPATH` under the sysfs root.
    pub fn to_event(&self, sysfs_root: &Path) -> Option<UdevEvent> {
        let action = self.get("ACTION")?;
        let devpath = self.get("DEVPATH")?;
        Some(UdevEvent {
            action: action.to_string(),
            device_syspath: sysfs_root.join(devpath.trim_start_matches('/')),
        })
    }
}

/// Decode a uevent datagram in either the udevd or the raw kernel format.
pub fn parse_uevent(buf: &[u8]) -> Option<RawUevent> {
    let properties = if buf.starts_with(LIBUDEV_PREFIX) {
        if buf.len() < LIBUDEV_HEADER_LEN {
            return None;
        }
        let magic = u32::from_be_bytes(buf[8..12].try_into().ok()?);
        if magic != LIBUDEV_MAGIC {
            return None;
        }
        let offset = u32::from_ne_bytes(buf[16..20].try_into().ok()?) as usize;
        let len = u32::from_ne_bytes(buf[20..24].try_into().ok()?) as usize;
        buf.get(offset..offset.checked_add(len)?)?
    } else {
        // "<action>@<devpath>\0KEY=VALUE\0..."
        let header_end = buf.iter().position(|&b| b == 0)?;
        if !buf[..header_end].contains(&b'@') {
            return None;
        }
        &buf[header_end + 1..]
    };

    let properties = properties
        .split(|&b| b == 0)
        .filter_map(|field| {
            let field = std::str::from_utf8(field).ok()?;
            let (key, value) = field.split_once('=')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect();

    Some(RawUevent { properties })
}

fn monitor_error(op: &str) -> SriovError {
    SriovError::Monitor { reason: format!("{}: {}", op, std::io::Error::last_os_error()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kernel_datagram(fields: &[&str]) -> Vec<u8> {
        let mut buf = b"add@/devices/pci0000:00/0000:3b:00.2/net/eth0\0".to_vec();
        for field in fields {
            buf.extend_from_slice(field.as_bytes());
            buf.push(0);
        }
        buf
    }

    fn udev_datagram(fields: &[&str]) -> Vec<u8> {
        let mut props = Vec::new();
        for field in fields {
            props.extend_from_slice(field.as_bytes());
            props.push(0);
        }
        let mut buf = Vec::new();
        buf.extend_from_slice(LIBUDEV_PREFIX);
        buf.extend_from_slice(&LIBUDEV_MAGIC.to_be_bytes());
        buf.extend_from_slice(&(LIBUDEV_HEADER_LEN as u32).to_ne_bytes());
        buf.extend_from_slice(&(LIBUDEV_HEADER_LEN as u32).to_ne_bytes());
        buf.extend_from_slice(&(props.len() as u32).to_ne_bytes());
        buf.resize(LIBUDEV_HEADER_LEN, 0);
        buf.extend_from_slice(&props);
        buf
    }

    #[test]
    fn test_parse_kernel_format() {
        let buf = kernel_datagram(&[
            "ACTION=add",
            "DEVPATH=/devices/pci0000:00/0000:3b:00.2/net/eth0",
            "SUBSYSTEM=net",
            "INTERFACE=eth0",
        ]);
        let uevent = parse_uevent(&buf).unwrap();
        assert_eq!(uevent.subsystem(), Some("net"));

        let event = uevent.to_event(Path::new("/sys")).unwrap();
        assert_eq!(event.action, "add");
        assert_eq!(
            event.device_syspath,
            PathBuf::from("/sys/devices/pci0000:00/0000:3b:00.2/net/eth0")
        );
    }

    #[test]
    fn test_parse_udev_format() {
        let buf = udev_datagram(&[
            "ACTION=add",
            "DEVPATH=/devices/pci0000:00/0000:3b:00.2/net/ens1f0v0",
            "SUBSYSTEM=net",
        ]);
        let event = parse_uevent(&buf).unwrap().to_event(Path::new("/sys")).unwrap();
        assert!(event.device_syspath.ends_with("net/ens1f0v0"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_uevent(b"libudev\0short").is_none());
        assert!(parse_uevent(b"no-header-here\0ACTION=add\0").is_none());

        let mut bad_magic = udev_datagram(&["ACTION=add"]);
        bad_magic[8] = 0;
        assert!(parse_uevent(&bad_magic).is_none());
    }

    #[test]
    fn test_event_requires_action_and_devpath() {
        let buf = kernel_datagram(&["SUBSYSTEM=net"]);
        assert!(parse_uevent(&buf).unwrap().to_event(Path::new("/sys")).is_none());
    }

    #[test]
    fn test_check_sender() {
        assert!(check_sender(&Sender { nl_pid: 812, uid: Some(0) }).is_ok());

        // Unprivileged process forging udevd traffic.
        assert_eq!(check_sender(&Sender { nl_pid: 4242, uid: Some(1000) }), Err("sender uid is not 0"));
        // Kernel messages never belong on the udev group.
        assert_eq!(
            check_sender(&Sender { nl_pid: 0, uid: Some(0) }),
            Err("kernel sender on the udev group")
        );
        assert_eq!(check_sender(&Sender { nl_pid: 812, uid: None }), Err("no sender credentials"));
    }

    #[test]
    fn test_recv_datagram_reports_sender_credentials() {
        let mut fds = [0 as libc::c_int; 2];
        let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_DGRAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        let (rx, tx) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        let on: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                rx.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_PASSCRED,
                &on as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        assert_eq!(rc, 0);

        let datagram = udev_datagram(&["ACTION=add", "SUBSYSTEM=net"]);
        let sent = unsafe {
            libc::send(tx.as_raw_fd(), datagram.as_ptr() as *const libc::c_void, datagram.len(), 0)
        };
        assert_eq!(sent as usize, datagram.len());

        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let (n, sender) = recv_datagram(rx.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], datagram.as_slice());
        assert_eq!(sender.uid, Some(unsafe { libc::getuid() }));
        assert_eq!(parse_uevent(&buf[..n]).unwrap().subsystem(), Some("net"));
    }

    #[tokio::test]
    async fn test_handle_from_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut handle = MonitorHandle::from_receiver(rx);
        tx.send(UdevEvent { action: "add".into(), device_syspath: "/sys/x".into() }).unwrap();

        let event = handle.events().recv().await.unwrap();
        assert_eq!(event.action, "add");
        handle.stop();
    }
}
