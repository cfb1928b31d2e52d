//! KVM driver.
//!
//! Runs `virsh` on an s390x KVM host through a shell session. Disks are
//! brought online on the host first, then the domain is (re)defined from
//! generated XML and started.

mod storage;
mod virsh;
mod xml;

pub use storage::{fcp_device_path, HostStorage};
pub use virsh::Virsh;
pub use xml::{escape, DirectKernel, DomainDisk, DomainIface, DomainXmlBuilder, TargetDevices};

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::DriverConfig;
use crate::error::{HypervisorError, Result};
use crate::retry::Attempts;
use crate::schema::ConstraintKind;
use crate::session::{SessionHandle, SessionSlot};
use crate::state::StateTracker;
use crate::traits::{Capabilities, Lifecycle};
use crate::transport::{ShellConnector, ShellSession};
use crate::types::{from_parameters, Action, Credentials, EntityState, Family, Iface, NetBoot, StorageVolume};

/// Constructor parameters, see `kvm/actions/init.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct KvmInit {
    #[serde(default = "default_ssh_port")]
    pub port: u16,
}

impl Default for KvmInit {
    fn default() -> Self {
        Self {
            port: default_ssh_port(),
        }
    }
}

fn default_ssh_port() -> u16 {
    22
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KvmBootMethod {
    #[default]
    Disk,
    Network,
}

/// `boot_params` as accepted by `kvm/entities/boot_params.json`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KvmBootParams {
    #[serde(default)]
    pub boot_method: KvmBootMethod,
    #[serde(default)]
    pub netboot: Option<NetBoot>,
}

/// Parameters of `start`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KvmStartParams {
    #[serde(default)]
    pub boot_params: KvmBootParams,
    #[serde(default)]
    pub storage_volumes: Vec<StorageVolume>,
    #[serde(default)]
    pub ifaces: Vec<Iface>,
}

impl KvmStartParams {
    /// Kernel to boot first, if this is a network boot.
    pub fn netboot(&self) -> Result<Option<&NetBoot>> {
        match (self.boot_params.boot_method, &self.boot_params.netboot) {
            (KvmBootMethod::Disk, _) => Ok(None),
            (KvmBootMethod::Network, Some(netboot)) => Ok(Some(netboot)),
            (KvmBootMethod::Network, None) => Err(HypervisorError::invalid_parameters(
                Family::Kvm,
                Action::Start,
                "boot_params.netboot",
                ConstraintKind::Required,
                "boot method 'network' requires 'netboot'",
            )),
        }
    }
}

/// KVM hypervisor driver.
pub struct KvmDriver {
    /// Host name as registered, used for logging.
    system: String,
    credentials: Credentials,
    init: KvmInit,
    config: DriverConfig,
    shells: Arc<dyn ShellConnector>,
    session: Mutex<SessionSlot<Box<dyn ShellSession>>>,
    states: StateTracker,
}

impl KvmDriver {
    /// Create a driver for host `system`. `parameters` follow
    /// `kvm/actions/init.json`.
    pub fn new(
        system: &str,
        credentials: Credentials,
        parameters: &Value,
        shells: Arc<dyn ShellConnector>,
    ) -> Result<Self> {
        let init: KvmInit = if parameters.is_null() {
            KvmInit::default()
        } else {
            from_parameters(Family::Kvm, Action::Init, parameters)?
        };
        Ok(Self {
            system: system.to_string(),
            credentials,
            init,
            config: DriverConfig::default(),
            shells,
            session: Mutex::new(SessionSlot::new()),
            states: StateTracker::new(),
        })
    }

    pub fn with_config(mut self, config: DriverConfig) -> Self {
        self.config = config;
        self
    }

    pub fn system(&self) -> &str {
        &self.system
    }

    /// Bring the disks online and describe them for the domain XML.
    /// Pre-rendered elements reserve their targets before any is generated.
    async fn prepare_devices(
        &self,
        shell: &mut dyn ShellSession,
        params: &KvmStartParams,
    ) -> Result<(Vec<DomainDisk>, Vec<DomainIface>)> {
        let mut targets = TargetDevices::new();
        for volume in &params.storage_volumes {
            if let Some(xml) = volume.libvirt() {
                targets.reserve_dev(xml)?;
                targets.reserve_devno(xml)?;
            }
        }
        for iface in &params.ifaces {
            if let Iface::Macvtap { libvirt: Some(xml), .. } = iface {
                targets.reserve_devno(xml)?;
            }
        }

        let mut storage = HostStorage::new(shell, self.config.command_timeout());
        let mut disks = Vec::with_capacity(params.storage_volumes.len());
        for volume in &params.storage_volumes {
            let source = match volume {
                StorageVolume::Dasd { devno, .. } => storage.activate_dasd(devno).await?,
                StorageVolume::Fcp {
                    lun,
                    adapters,
                    multipath,
                    ..
                } => storage.activate_fcp(lun, adapters, *multipath).await?,
            };
            let disk = match volume.libvirt() {
                Some(xml) => DomainDisk::Rendered(xml.to_string()),
                None => DomainDisk::Generated {
                    source,
                    target_dev: targets.next_dev(),
                    devno: targets.next_devno()?,
                    boot: volume.is_boot_device(),
                },
            };
            disks.push(disk);
        }

        let mut ifaces = Vec::with_capacity(params.ifaces.len());
        for iface in &params.ifaces {
            let iface = match iface {
                Iface::Macvtap { libvirt: Some(xml), .. } => DomainIface::Rendered(xml.clone()),
                Iface::Macvtap {
                    host_iface,
                    mac_address,
                    libvirt: None,
                } => DomainIface::Generated {
                    host_iface: host_iface.clone(),
                    mac_address: mac_address.clone(),
                    devno: targets.next_devno()?,
                },
                other => {
                    return Err(HypervisorError::NotSupported(format!(
                        "interface {:?} is not available on KVM, use macvtap",
                        other
                    )))
                }
            };
            ifaces.push(iface);
        }
        Ok((disks, ifaces))
    }

    async fn wait_running(&self, virsh: &mut Virsh<'_>, name: &str) -> Result<()> {
        let mut attempts = Attempts::new(&self.config.activation, "domain start");
        while !virsh.is_running(name).await? {
            attempts.wait().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Lifecycle for KvmDriver {
    fn family(&self) -> Family {
        Family::Kvm
    }

    async fn capabilities(&self) -> Result<Capabilities> {
        Ok(Capabilities {
            family: Family::Kvm,
            backend: "kvm".to_string(),
            atomic_reboot: false,
            native_netboot: true,
            simulated_netboot: false,
            soft_disconnect: false,
        })
    }

    #[instrument(skip(self), fields(host = %self.credentials.host))]
    async fn login(&self) -> Result<SessionHandle> {
        info!("Connecting to KVM host");
        let shell = self
            .shells
            .connect(
                &self.credentials.host,
                self.init.port,
                &self.credentials.user,
                &self.credentials.password,
                self.config.login_timeout(),
            )
            .await?;

        let mut slot = self.session.lock().await;
        let (handle, previous) = slot.open(format!("{}@{}", self.credentials.user, self.credentials.host), shell);
        if let Some(mut previous) = previous {
            if let Err(e) = previous.close().await {
                warn!(error = %e, "Failed to close previous host session");
            }
        }
        self.states.reset()?;
        Ok(handle)
    }

    #[instrument(skip(self), fields(host = %self.credentials.host))]
    async fn logoff(&self) -> Result<()> {
        let mut slot = self.session.lock().await;
        let mut shell = slot.close()?;
        self.states.reset()?;
        shell.close().await?;
        info!("Disconnected from KVM host");
        Ok(())
    }

    #[instrument(skip(self, parameters), fields(host = %self.credentials.host, domain = %name, cpu = cpu, memory = memory))]
    async fn start(&self, name: &str, cpu: u32, memory: u64, parameters: &Value) -> Result<()> {
        let params: KvmStartParams = from_parameters(Family::Kvm, Action::Start, parameters)?;
        let netboot = params.netboot()?;

        let mut slot = self.session.lock().await;
        let shell = slot.get_mut()?;
        self.states.enter(name)?;
        self.states.transition(name, EntityState::StartRequested)?;

        {
            let mut virsh = Virsh::new(shell.as_mut(), self.config.command_timeout());
            if virsh.is_running(name).await? {
                info!("Domain is running, destroying it first");
                virsh.destroy(name).await?;
            }
        }

        let (disks, ifaces) = self.prepare_devices(shell.as_mut(), &params).await?;
        let builder = DomainXmlBuilder::new(name, cpu, memory, &disks, &ifaces);
        let domain_xml = builder.build();

        let mut virsh = Virsh::new(shell.as_mut(), self.config.command_timeout());
        if virsh.is_defined(name).await? {
            debug!("Undefining previous definition");
            virsh.undefine(name).await?;
        }

        self.states.transition(name, EntityState::Booting)?;
        match netboot {
            Some(netboot) => {
                info!(kernel = %netboot.kernel_url, "Network boot through a temporary definition");
                virsh
                    .define_netboot(&builder, netboot, self.config.fetch_timeout())
                    .await?;
                let started = virsh.start(name).await;
                if started.is_ok() {
                    // Replace the definition so later restarts boot from disk.
                    let redefined = virsh.define(&domain_xml).await;
                    virsh.clean_tmp_dir().await;
                    redefined?;
                } else {
                    virsh.clean_tmp_dir().await;
                }
                started?;
            }
            None => {
                virsh.define(&domain_xml).await?;
                virsh.start(name).await?;
            }
        }
        self.wait_running(&mut virsh, name).await?;
        self.states.transition(name, EntityState::Active)?;

        info!("Domain started");
        Ok(())
    }

    #[instrument(skip(self, _parameters), fields(host = %self.credentials.host, domain = %name))]
    async fn stop(&self, name: &str, _parameters: &Value) -> Result<()> {
        let mut slot = self.session.lock().await;
        let shell = slot.get_mut()?;
        let mut virsh = Virsh::new(shell.as_mut(), self.config.command_timeout());

        self.states.enter(name)?;
        virsh.ensure_running(name, "stop").await?;
        self.states.transition(name, EntityState::StopRequested)?;
        virsh.destroy(name).await?;
        self.states.transition(name, EntityState::Inactive)?;

        info!("Domain stopped");
        Ok(())
    }

    /// `virsh reset` would reboot into the temporary netboot kernel if the
    /// domain was redefined while running, so destroy and start instead.
    #[instrument(skip(self, _parameters), fields(host = %self.credentials.host, domain = %name))]
    async fn reboot(&self, name: &str, _parameters: &Value) -> Result<()> {
        let mut slot = self.session.lock().await;
        let shell = slot.get_mut()?;
        let mut virsh = Virsh::new(shell.as_mut(), self.config.command_timeout());

        self.states.enter(name)?;
        virsh.ensure_running(name, "reboot").await?;
        self.states.transition(name, EntityState::StopRequested)?;
        virsh.destroy(name).await?;
        self.states.transition(name, EntityState::Inactive)?;
        self.states.transition(name, EntityState::StartRequested)?;
        self.states.transition(name, EntityState::Booting)?;
        virsh.start(name).await?;
        self.wait_running(&mut virsh, name).await?;
        self.states.transition(name, EntityState::Active)?;

        info!("Domain rebooted");
        Ok(())
    }

    async fn entity_state(&self, name: &str) -> Result<EntityState> {
        self.states.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockShellConnector, MockShellSession};
    use crate::retry::RetryPolicy;
    use serde_json::json;
    use std::time::Duration;

    fn driver(session: MockShellSession) -> (KvmDriver, Arc<MockShellConnector>) {
        let connector = Arc::new(MockShellConnector::with_session(session));
        let config = DriverConfig {
            activation: RetryPolicy::fixed(3, Duration::from_millis(1)),
            ..Default::default()
        };
        let driver = KvmDriver::new(
            "kvmhost01",
            Credentials::new("kvmhost01.example.com", "root", "secret"),
            &Value::Null,
            connector.clone(),
        )
        .unwrap()
        .with_config(config);
        (driver, connector)
    }

    fn disk_params() -> Value {
        json!({
            "boot_params": {"boot_method": "disk"},
            "storage_volumes": [
                {"type": "dasd", "devno": "3956", "boot_device": true}
            ],
            "ifaces": [
                {"type": "macvtap", "host_iface": "enccw0.0.f500"}
            ]
        })
    }

    #[tokio::test]
    async fn test_start_from_disk() {
        let (driver, connector) = driver(MockShellSession::new());
        driver.login().await.unwrap();
        driver.start("kvm054", 2, 2048, &disk_params()).await.unwrap();

        let commands = connector.commands();
        let define = commands.iter().position(|c| c.starts_with("virsh define")).unwrap();
        let start = commands.iter().position(|c| c == "virsh start 'kvm054'").unwrap();
        assert!(define < start);
        let xml = connector.written_files().pop().unwrap();
        assert!(xml.contains("<source dev='/dev/disk/by-path/ccw-0.0.3956'/>"));
        assert!(xml.contains("<target dev='vda' bus='virtio'/>"));
        assert!(xml.contains("devno='0x0002'"));
        assert_eq!(driver.entity_state("kvm054").await.unwrap(), EntityState::Active);
    }

    #[tokio::test]
    async fn test_running_domain_is_destroyed_and_redefined() {
        let (driver, connector) = driver(MockShellSession::new().with_domain("kvm054", "running"));
        driver.login().await.unwrap();
        driver.start("kvm054", 1, 1024, &disk_params()).await.unwrap();

        let commands = connector.commands();
        let destroy = commands.iter().position(|c| c == "virsh destroy 'kvm054'").unwrap();
        let undefine = commands.iter().position(|c| c == "virsh undefine 'kvm054'").unwrap();
        let define = commands.iter().position(|c| c.starts_with("virsh define")).unwrap();
        assert!(destroy < undefine && undefine < define);
    }

    #[tokio::test]
    async fn test_network_boot_redefines_after_start() {
        let (driver, connector) = driver(MockShellSession::new());
        driver.login().await.unwrap();
        let params = json!({
            "boot_params": {
                "boot_method": "network",
                "netboot": {
                    "kernel_uri": "http://install.example.com/s390x/kernel.img",
                    "initrd_uri": "http://install.example.com/s390x/initrd.img",
                    "cmdline": "inst.repo=http://install.example.com/s390x"
                }
            },
            "storage_volumes": [{"type": "dasd", "devno": "3956", "boot_device": true}]
        });
        driver.start("kvm054", 1, 1024, &params).await.unwrap();

        let files = connector.written_files();
        assert_eq!(files.len(), 2);
        assert!(files[0].contains("<kernel>/tmp/tmp.mock/kernel</kernel>"));
        assert!(files[0].contains("<cmdline>inst.repo=http://install.example.com/s390x</cmdline>"));
        assert!(!files[1].contains("<kernel>"));

        let commands = connector.commands();
        let start = commands.iter().position(|c| c == "virsh start 'kvm054'").unwrap();
        let last_define = commands.iter().rposition(|c| c.starts_with("virsh define")).unwrap();
        assert!(start < last_define);
        assert!(commands.iter().any(|c| c == "rm -rf '/tmp/tmp.mock'"));
    }

    #[tokio::test]
    async fn test_network_boot_requires_netboot() {
        let (driver, _) = driver(MockShellSession::new());
        driver.login().await.unwrap();
        let err = driver
            .start("kvm054", 1, 1024, &json!({"boot_params": {"boot_method": "network"}}))
            .await
            .unwrap_err();
        assert!(err.report().unwrap().find("boot_params.netboot", ConstraintKind::Required).is_some());
    }

    #[tokio::test]
    async fn test_stop_requires_running_domain() {
        let (driver, _) = driver(MockShellSession::new().with_domain("kvm054", "shut off"));
        driver.login().await.unwrap();
        let err = driver.stop("kvm054", &json!({})).await.unwrap_err();
        assert!(err.to_string().contains("Domain kvm054 is not running"));

        let err = driver.stop("other", &json!({})).await.unwrap_err();
        assert!(err.to_string().contains("Domain other is not defined"));
    }

    #[tokio::test]
    async fn test_reboot_destroys_and_starts() {
        let (driver, connector) = driver(MockShellSession::new().with_domain("kvm054", "running"));
        driver.login().await.unwrap();
        driver.reboot("kvm054", &json!({})).await.unwrap();

        let commands = connector.commands();
        let destroy = commands.iter().position(|c| c == "virsh destroy 'kvm054'").unwrap();
        let start = commands.iter().position(|c| c == "virsh start 'kvm054'").unwrap();
        assert!(destroy < start);
        assert!(!commands.iter().any(|c| c.starts_with("virsh reset")));
    }

    #[tokio::test]
    async fn test_requires_login() {
        let (driver, _) = driver(MockShellSession::new());
        let err = driver.stop("kvm054", &json!({})).await.unwrap_err();
        assert!(matches!(err, HypervisorError::NotLoggedIn));
        driver.login().await.unwrap();
        driver.logoff().await.unwrap();
        let err = driver.stop("kvm054", &json!({})).await.unwrap_err();
        assert!(matches!(err, HypervisorError::SessionClosed(_)));
    }
}
