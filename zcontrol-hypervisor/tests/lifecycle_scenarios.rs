//! Integration tests for the lifecycle drivers.
//!
//! These tests drive validated hypervisors end to end against the mock
//! HMC, terminal and shell collaborators.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use zcontrol_hypervisor::hmc::PartitionBoot;
use zcontrol_hypervisor::mock::{
    MockHmc, MockReachability, MockShellConnector, MockShellSession, MockTerminal, MockTerminalConnector,
};
use zcontrol_hypervisor::{
    Collaborators, Credentials, DriverConfig, EntityState, ErrorKind, Hypervisor, HypervisorError, HypervisorKind,
    Lifecycle, RetryPolicy, SchemaRepository, Validated,
};

fn config() -> DriverConfig {
    zcontrol_common::init_logging(&zcontrol_common::level_from_env()).unwrap();

    let quick = RetryPolicy::fixed(3, Duration::from_millis(1));
    let mut config = DriverConfig {
        activation: quick.clone(),
        ..Default::default()
    };
    config.netboot.rescue_ipl = quick.clone();
    config.netboot.network = quick;
    config
}

fn schemas() -> Arc<SchemaRepository> {
    Arc::new(SchemaRepository::builtin().expect("built-in schemas must compile"))
}

struct HmcSetup {
    hmc: MockHmc,
    shells: Arc<MockShellConnector>,
    reachability: Arc<MockReachability>,
    driver: Validated<Hypervisor>,
}

fn hmc_driver(hmc: MockHmc) -> HmcSetup {
    let shells = Arc::new(MockShellConnector::new());
    let reachability = Arc::new(MockReachability::always());
    let collaborators = Collaborators::default()
        .with_hmc(Arc::new(hmc.clone()))
        .with_shells(shells.clone())
        .with_reachability(reachability.clone());
    let driver = Hypervisor::build(
        HypervisorKind::Hmc,
        "cpc1",
        Credentials::new("hmc01.example.com", "automation", "secret"),
        &json!({}),
        &collaborators,
        schemas(),
        config(),
    )
    .expect("HMC driver");
    HmcSetup {
        hmc,
        shells,
        reachability,
        driver,
    }
}

fn dasd_boot() -> Value {
    json!({"boot_params": {"boot_method": "dasd", "devicenr": "9999"}})
}

fn netboot_params() -> Value {
    json!({"boot_params": {
        "boot_method": "dasd",
        "devicenr": "9999",
        "netsetup": {
            "ip": "10.3.0.42",
            "mask": 24,
            "gateway": "10.3.0.1",
            "device": "f500",
            "password": "rescue-pw"
        },
        "netboot": {
            "kernel_url": "http://install.example.com/s390x/kernel.img",
            "initrd_url": "http://install.example.com/s390x/initrd.img",
            "cmdline": "inst.repo=http://install.example.com/s390x"
        }
    }})
}

/// Test a classic DASD start: profile update, activation and load.
#[tokio::test]
async fn test_hmc_classic_dasd_start() {
    let setup = hmc_driver(MockHmc::classic("CPC1").with_lpar("L1", "not-activated"));
    setup.driver.login().await.unwrap();
    setup.driver.start("L1", 2, 4096, &dasd_boot()).await.unwrap();

    let calls = setup.hmc.calls();
    let activate = calls.iter().position(|c| c == "activate L1").unwrap();
    let load = calls.iter().position(|c| c == "load L1 9999 force=false").unwrap();
    assert!(activate < load);
    let resources = setup.hmc.resources_of("L1").unwrap();
    assert_eq!((resources.cp, resources.ifl, resources.memory_mb), (0, 2, 4096));
    assert_eq!(setup.hmc.status_of("L1").as_deref(), Some("operating"));
    assert_eq!(setup.driver.entity_state("l1").await.unwrap(), EntityState::Active);

    setup.driver.reboot("L1", &dasd_boot()).await.unwrap();
    assert!(setup.hmc.calls().contains(&"load L1 9999 force=true".to_string()));
}

/// Test that a rejected document never reaches the HMC.
#[tokio::test]
async fn test_hmc_invalid_parameters_have_no_side_effects() {
    let setup = hmc_driver(MockHmc::classic("CPC1").with_lpar("L1", "not-activated"));
    setup.driver.login().await.unwrap();

    let err = setup
        .driver
        .start("L1", 2, 4096, &json!({"boot_params": {"boot_method": "dasd"}}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameters);
    assert!(err.report().unwrap().mentions("boot_params.devicenr"));
    assert_eq!(setup.hmc.calls(), vec!["connect".to_string()]);
    assert_eq!(setup.hmc.status_of("L1").as_deref(), Some("not-activated"));
}

/// Test a simulated network boot from a rescue disk.
#[tokio::test]
async fn test_hmc_simulated_netboot() {
    let setup = hmc_driver(MockHmc::classic("CPC1").with_lpar("L2", "not-activated"));
    setup.driver.login().await.unwrap();
    setup.driver.start("L2", 1, 2048, &netboot_params()).await.unwrap();

    assert!(setup.hmc.calls().contains(&"load L2 9999 force=false".to_string()));
    let typed = setup.hmc.os_commands();
    assert_eq!(typed[0], "root");
    assert_eq!(typed[1], "rescue-pw");
    assert!(setup.reachability.probes() >= 1);
    assert_eq!(setup.shells.connections(), vec![("10.3.0.42".to_string(), 22)]);
    let commands = setup.shells.commands();
    assert!(commands.iter().any(|c| c.contains("initrd.img")));
    assert!(commands.last().unwrap().contains("kexec /tmp/kernel"));
    assert_eq!(setup.driver.entity_state("L2").await.unwrap(), EntityState::Active);
}

/// Test that a rescue system that never comes up is a timeout and no shell
/// is ever opened.
#[tokio::test]
async fn test_hmc_netboot_rescue_timeout() {
    let setup = hmc_driver(
        MockHmc::classic("CPC1")
            .with_lpar("L1", "not-activated")
            .never_boots(),
    );
    setup.driver.login().await.unwrap();

    let err = setup.driver.start("L1", 1, 2048, &netboot_params()).await.unwrap_err();
    assert!(matches!(err, HypervisorError::Timeout { ref stage, .. } if stage == "rescue IPL"));
    assert!(err.is_retryable());
    assert!(setup.shells.connections().is_empty());
    assert!(setup.hmc.os_commands().is_empty());
    assert_eq!(setup.reachability.probes(), 0);
}

/// Test that stopping an LPAR that is not active surfaces the HMC error.
#[tokio::test]
async fn test_hmc_stop_inactive_lpar() {
    let setup = hmc_driver(MockHmc::classic("CPC1").with_lpar("L1", "not-activated"));
    setup.driver.login().await.unwrap();

    let err = setup.driver.stop("L1", &json!({})).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Backend);
    assert!(matches!(err, HypervisorError::OperationFailed { .. }));
    assert_eq!(err.diagnostic().unwrap()["http-status"], 409);
    assert!(!err.is_retryable());
}

/// Test a DPM start from an FCP path.
#[tokio::test]
async fn test_hmc_dpm_scsi_start() {
    let hmc = MockHmc::dpm("CPC2").with_lpar("lp02", "active");
    let driver = Hypervisor::build(
        HypervisorKind::Hmc,
        "cpc2",
        Credentials::new("hmc01.example.com", "automation", "secret"),
        &json!({"port": 6794}),
        &Collaborators::default().with_hmc(Arc::new(hmc.clone())),
        schemas(),
        config(),
    )
    .unwrap();
    driver.login().await.unwrap();
    let caps = driver.capabilities().await.unwrap();
    assert_eq!(caps.backend, "hmc-dpm");
    assert!(!caps.atomic_reboot);

    let params = json!({"boot_params": {
        "boot_method": "scsi",
        "devicenr": "1800",
        "wwpn": "500507630b1b4a12",
        "lun": "4001400000000000"
    }});
    driver.start("lp02", 2, 8192, &params).await.unwrap();

    let calls = hmc.calls();
    let stop = calls.iter().position(|c| c == "stop_partition lp02").unwrap();
    let start = calls.iter().position(|c| c == "start_partition lp02").unwrap();
    assert!(stop < start);
    assert_eq!(
        hmc.boot_of("lp02"),
        Some(PartitionBoot::StorageAdapter {
            devno: "1800".to_string(),
            wwpn: "500507630b1b4a12".to_string(),
            lun: "4001400000000000".to_string(),
        })
    );
    assert_eq!(hmc.status_of("lp02").as_deref(), Some("active"));
}

/// Test that a DPM install file boots over the protocol of the boot method.
#[tokio::test]
async fn test_hmc_dpm_install_file_protocol() {
    let hmc = MockHmc::dpm("CPC2").with_lpar("lp02", "stopped");
    let driver = Hypervisor::build(
        HypervisorKind::Hmc,
        "cpc2",
        Credentials::new("hmc01.example.com", "automation", "secret"),
        &json!({}),
        &Collaborators::default().with_hmc(Arc::new(hmc.clone())),
        schemas(),
        config(),
    )
    .unwrap();
    driver.login().await.unwrap();

    let mismatched = json!({"boot_params": {
        "boot_method": "sftp",
        "insfile": "http://repo.example.com/x.ins"
    }});
    let err = driver.start("lp02", 2, 4096, &mismatched).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameters);
    assert!(err.report().unwrap().mentions("boot_params.insfile"));
    assert!(!hmc.calls().iter().any(|c| c.starts_with("start_partition")));

    let params = json!({"boot_params": {
        "boot_method": "sftp",
        "insfile": "sftp://install:pw@repo.example.com/distro/generic.ins"
    }});
    driver.start("lp02", 2, 4096, &params).await.unwrap();
    match hmc.boot_of("lp02") {
        Some(PartitionBoot::Ftp { protocol, host, insfile, .. }) => {
            assert_eq!(protocol, "sftp");
            assert_eq!(host, "repo.example.com");
            assert_eq!(insfile, "/distro/generic.ins");
        }
        other => panic!("unexpected boot {other:?}"),
    }
}

/// Test that rejected credentials are an authentication error.
#[tokio::test]
async fn test_hmc_login_rejected() {
    let setup = hmc_driver(MockHmc::classic("CPC1").reject_login());
    let err = setup.driver.login().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authentication);
    let err = setup.driver.stop("L1", &json!({})).await.unwrap_err();
    assert!(matches!(err, HypervisorError::NotLoggedIn));
}

fn zvm_driver(terminal: MockTerminal) -> Validated<Hypervisor> {
    let connector = Arc::new(MockTerminalConnector::new(terminal, "pw"));
    Hypervisor::build(
        HypervisorKind::Zvm,
        "",
        Credentials::new("zvm01.example.com", "linux01", "pw"),
        &json!({}),
        &Collaborators::default().with_terminals(connector),
        schemas(),
        config(),
    )
    .expect("z/VM driver")
}

fn zvm_disk_boot() -> Value {
    json!({
        "boot_method": "disk",
        "storage_volumes": [{"type": "dasd", "devno": "3a2c", "boot_device": true}],
        "ifaces": [{"type": "osa", "id": "f500"}]
    })
}

/// Test a z/VM disk boot: the guest is reset, resources are defined and
/// the boot disk is IPLed.
#[tokio::test]
async fn test_zvm_disk_boot_and_stop() {
    let terminal = MockTerminal::new("LINUX01");
    let driver = zvm_driver(terminal.clone());
    driver.login().await.unwrap();
    driver.start("linux01", 2, 4096, &zvm_disk_boot()).await.unwrap();

    let commands = terminal.commands();
    assert!(commands.contains(&"define storage 4096M".to_string()));
    assert!(commands.contains(&"define cpu 1".to_string()));
    assert!(commands.contains(&"att 3a2c *".to_string()));
    assert_eq!(commands.last().map(String::as_str), Some("i 3a2c"));
    assert_eq!(terminal.events(), vec!["logon", "logoff", "logon"]);
    assert_eq!(driver.entity_state("LINUX01").await.unwrap(), EntityState::Active);

    driver.stop("linux01", &json!({})).await.unwrap();
    assert_eq!(terminal.events().last().map(String::as_str), Some("logoff"));
    assert_eq!(driver.entity_state("linux01").await.unwrap(), EntityState::Inactive);

    // stop ended the session, a new start logs on again
    driver.start("linux01", 1, 0, &zvm_disk_boot()).await.unwrap();
    assert_eq!(terminal.events().last().map(String::as_str), Some("logon"));
}

/// Test that a failed logoff keeps the session so stop can be retried.
#[tokio::test]
async fn test_zvm_stop_retried_after_failed_logoff() {
    let terminal = MockTerminal::new("LINUX01").fail_logoffs(1);
    let driver = zvm_driver(terminal.clone());
    driver.login().await.unwrap();

    let err = driver.stop("linux01", &json!({})).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connectivity);
    assert!(!terminal.events().contains(&"logoff".to_string()));
    assert_eq!(driver.entity_state("linux01").await.unwrap(), EntityState::StopRequested);

    driver.stop("linux01", &json!({})).await.unwrap();
    assert_eq!(terminal.events(), vec!["logon", "logoff"]);
    assert_eq!(driver.entity_state("linux01").await.unwrap(), EntityState::Inactive);
}

/// Test that the entity must be the login user and parameters are checked
/// before any terminal command.
#[tokio::test]
async fn test_zvm_rejects_before_side_effects() {
    let terminal = MockTerminal::new("LINUX01");
    let driver = zvm_driver(terminal.clone());
    driver.login().await.unwrap();
    let before = terminal.commands().len();

    let err = driver.start("linux01", 1, 1024, &json!({"boot_method": "tape"})).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameters);
    let err = driver.start("linux02", 1, 1024, &zvm_disk_boot()).await.unwrap_err();
    assert!(matches!(err, HypervisorError::InvalidState(_)));
    assert_eq!(terminal.commands().len(), before);
}

/// Test that a disconnect keeps the guest and ends the session.
#[tokio::test]
async fn test_zvm_disconnect() {
    let terminal = MockTerminal::new("LINUX01");
    let driver = zvm_driver(terminal.clone());
    assert!(driver.capabilities().await.unwrap().soft_disconnect);
    driver.login().await.unwrap();
    driver.logoff().await.unwrap();
    assert_eq!(terminal.events(), vec!["logon", "disconnect"]);

    let err = driver.start("linux01", 1, 1024, &zvm_disk_boot()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Session);
}

/// Test that a wrong password fails the logon.
#[tokio::test]
async fn test_zvm_wrong_password() {
    let connector = Arc::new(MockTerminalConnector::new(MockTerminal::new("LINUX01"), "other"));
    let driver = Hypervisor::build(
        HypervisorKind::Zvm,
        "",
        Credentials::new("zvm01.example.com", "linux01", "pw"),
        &json!({}),
        &Collaborators::default().with_terminals(connector),
        schemas(),
        config(),
    )
    .unwrap();
    let err = driver.login().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authentication);
}

/// Test a KVM disk boot through the validated adapter.
#[tokio::test]
async fn test_kvm_disk_boot() {
    let shells = Arc::new(MockShellConnector::with_session(MockShellSession::new()));
    let driver = Hypervisor::build(
        HypervisorKind::Kvm,
        "kvmhost01",
        Credentials::new("kvmhost01.example.com", "root", "secret"),
        &json!({"port": 22}),
        &Collaborators::default().with_shells(shells.clone()),
        schemas(),
        config(),
    )
    .unwrap();
    driver.login().await.unwrap();

    let err = driver
        .start("kvm054", 1, 1024, &json!({"boot_params": {"boot_method": "cdrom"}}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameters);
    assert!(!shells.commands().iter().any(|c| c.starts_with("virsh")));

    let params = json!({
        "boot_params": {"boot_method": "disk"},
        "storage_volumes": [{"type": "dasd", "devno": "3956", "boot_device": true}]
    });
    driver.start("kvm054", 2, 2048, &params).await.unwrap();
    assert!(shells.commands().contains(&"virsh start 'kvm054'".to_string()));
    assert_eq!(driver.entity_state("kvm054").await.unwrap(), EntityState::Active);

    driver.stop("kvm054", &json!({})).await.unwrap();
    assert_eq!(driver.entity_state("kvm054").await.unwrap(), EntityState::Inactive);
    driver.logoff().await.unwrap();
}
