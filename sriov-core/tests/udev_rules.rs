//! Integration tests for udev rule reconciliation against real files.

use sriov_core::command::{CommandOutput, CommandRunner, Invocation};
use sriov_core::error::Result;
use sriov_core::sysfs::PciAddress;
use sriov_core::udev::{UdevReconciler, UdevRule, AUTOGEN_HEADER};
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Counts `udevadm` invocations.
#[derive(Default)]
struct CountingRunner {
    reloads: AtomicUsize,
}

#[async_trait::async_trait]
impl CommandRunner for CountingRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        if invocation.command_line().contains("--reload-rules") {
            self.reloads.fetch_add(1, Ordering::SeqCst);
        }
        Ok(CommandOutput { stdout: String::new(), stderr: String::new() })
    }
}

#[tokio::test]
async fn test_switchdev_rules_converge() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("80-persistent-os-net-config.rules");
    let script = dir.path().join("rep-link-name.sh");
    let runner = Arc::new(CountingRunner::default());
    let udev = UdevReconciler::new(runner.clone());
    let pci: PciAddress = "0000:3b:00.1".parse().unwrap();

    let rules = vec![
        UdevRule::unmanage_representors(),
        UdevRule::pf_name("ens1f1", &pci),
        UdevRule::vf_representors("ens1f1", &pci, "b8cef6000a5c", &script),
    ];

    assert!(udev.upsert_all(&rules, &file).await.unwrap());
    assert!(!udev.upsert_all(&rules, &file).await.unwrap());
    assert_eq!(runner.reloads.load(Ordering::SeqCst), 3);

    let contents = fs::read_to_string(&file).unwrap();
    assert!(contents.starts_with(AUTOGEN_HEADER));
    for rule in &rules {
        assert_eq!(contents.lines().filter(|l| *l == rule.line()).count(), 1);
    }
    assert!(contents.contains(r#"ATTR{phys_port_name}=="pf1vf*""#));
}

#[tokio::test]
async fn test_replug_rule_follows_vf_count() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("70-os-net-config-sriov.rules");
    let runner = Arc::new(CountingRunner::default());
    let udev = UdevReconciler::new(runner.clone());

    udev.upsert(&UdevRule::legacy_replug("p1p1", 4), &file).await.unwrap();
    udev.upsert(&UdevRule::legacy_replug("p2p1", 2), &file).await.unwrap();
    assert!(udev.upsert(&UdevRule::legacy_replug("p1p1", 8), &file).await.unwrap());

    let lines: Vec<String> = fs::read_to_string(&file)
        .unwrap()
        .lines()
        .filter(|l| l.starts_with("KERNEL"))
        .map(str::to_string)
        .collect();
    assert_eq!(
        lines,
        vec![
            r#"KERNEL=="p1p1", RUN+="/usr/bin/sriov-config -n %k:8""#,
            r#"KERNEL=="p2p1", RUN+="/usr/bin/sriov-config -n %k:2""#,
        ]
    );
}
