//! HMC driver.
//!
//! Manages LPARs of one CPC through the HMC Web Services. The CPC mode
//! decides how a start works:
//!
//! - classic: update the image activation profile, activate, then load
//!   from DASD or SCSI. LPAR names are upper-cased.
//! - DPM: update the partition, pick its boot device (storage volume,
//!   FCP path, NVMe, install file or none) and start it.
//!
//! With `netsetup` in the boot parameters the disk holds a rescue system
//! and the start continues as a simulated network boot
//! (see [`crate::netboot`]).

mod boot;
mod client;
mod volume;

pub use boot::{
    calculate_cpus, ftp_boot, BootDescriptor, BootParams, CpuAllocation, HmcBoot, HmcBootMethod, HmcStartParams,
};
pub use client::{CpcInfo, HmcConnector, HmcSession, PartitionBoot, ResourceUpdate, Resources};
pub use volume::{Attachment, FcpPath, VolumeDescriptor, VolumePath, VolumeProperties};

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::DriverConfig;
use crate::error::{HypervisorError, Result};
use crate::netboot::{NetbootOrchestrator, RescueConsole};
use crate::retry::poll_until;
use crate::session::{SessionHandle, SessionSlot};
use crate::state::StateTracker;
use crate::traits::{Capabilities, Lifecycle};
use crate::transport::{Reachability, ShellConnector, TcpProbe};
use crate::types::{from_parameters, short_devno, Action, Credentials, EntityState, Family};

const CLASSIC_OPERATING: &str = "operating";
const CLASSIC_NOT_ACTIVATED: &str = "not-activated";
const DPM_ACTIVE: &str = "active";
const DPM_STOPPED: &str = "stopped";

/// Constructor parameters, see `hmc/actions/init.json`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HmcInit {
    #[serde(default)]
    pub port: Option<u16>,
}

/// Console of an LPAR or partition, used by the simulated network boot.
struct PartitionConsole<'a> {
    session: &'a dyn HmcSession,
    cpc: &'a str,
    name: &'a str,
    target: IplTarget<'a>,
}

enum IplTarget<'a> {
    Classic { boot: &'a HmcBoot, force: bool },
    Dpm { boot: &'a PartitionBoot },
}

#[async_trait]
impl RescueConsole for PartitionConsole<'_> {
    async fn ipl(&self) -> Result<()> {
        match &self.target {
            IplTarget::Classic { boot, force } => {
                ipl_classic(self.session, self.cpc, self.name, boot, *force).await
            }
            IplTarget::Dpm { boot } => {
                self.session.set_boot_device(self.cpc, self.name, boot).await?;
                self.session.start_partition(self.cpc, self.name).await
            }
        }
    }

    async fn is_operational(&self) -> Result<bool> {
        let expected = match self.target {
            IplTarget::Classic { .. } => CLASSIC_OPERATING,
            IplTarget::Dpm { .. } => DPM_ACTIVE,
        };
        Ok(self.session.status(self.cpc, self.name).await? == expected)
    }

    async fn console_output(&self) -> Result<String> {
        Ok(self.session.os_messages(self.cpc, self.name).await?.join("\n"))
    }

    async fn send_command(&self, command: &str) -> Result<()> {
        self.session.send_os_command(self.cpc, self.name, command).await
    }
}

async fn ipl_classic(session: &dyn HmcSession, cpc: &str, lpar: &str, boot: &HmcBoot, force: bool) -> Result<()> {
    match boot {
        HmcBoot::Dasd { devno } => {
            info!(devno = %devno, force, "Loading LPAR from DASD");
            session.load(cpc, lpar, short_devno(devno), force).await
        }
        HmcBoot::ScsiDirect { devno, wwpn, lun } => {
            info!(devno = %devno, wwpn = %wwpn, lun = %lun, force, "Loading LPAR from SCSI disk");
            session.scsi_load(cpc, lpar, short_devno(devno), wwpn, lun, force).await
        }
        HmcBoot::None => Ok(()),
        other => Err(classic_unsupported(other)),
    }
}

fn classic_unsupported(boot: &HmcBoot) -> HypervisorError {
    HypervisorError::NotSupported(format!(
        "boot from {:?} requires a CPC in DPM mode",
        boot
    ))
}

/// HMC hypervisor driver.
pub struct HmcDriver {
    /// CPC name, upper-cased.
    system: String,
    credentials: Credentials,
    init: HmcInit,
    config: DriverConfig,
    connector: Arc<dyn HmcConnector>,
    shells: Option<Arc<dyn ShellConnector>>,
    reachability: Arc<dyn Reachability>,
    session: Mutex<SessionSlot<Arc<dyn HmcSession>>>,
    states: StateTracker,
}

impl HmcDriver {
    /// Create a driver for CPC `system`. `parameters` follow
    /// `hmc/actions/init.json`.
    pub fn new(
        system: &str,
        credentials: Credentials,
        parameters: &Value,
        connector: Arc<dyn HmcConnector>,
    ) -> Result<Self> {
        let init: HmcInit = if parameters.is_null() {
            HmcInit::default()
        } else {
            from_parameters(Family::Hmc, Action::Init, parameters)?
        };
        let system = system.to_uppercase();
        debug!(system = %system, host = %credentials.host, user = %credentials.user, "Creating HMC driver");
        Ok(Self {
            system,
            credentials,
            init,
            config: DriverConfig::default(),
            connector,
            shells: None,
            reachability: Arc::new(TcpProbe),
            session: Mutex::new(SessionSlot::new()),
            states: StateTracker::new(),
        })
    }

    pub fn with_config(mut self, config: DriverConfig) -> Self {
        self.config = config;
        self
    }

    /// Collaborators of the simulated network boot.
    pub fn with_netboot(mut self, shells: Arc<dyn ShellConnector>, reachability: Arc<dyn Reachability>) -> Self {
        self.shells = Some(shells);
        self.reachability = reachability;
        self
    }

    pub fn system(&self) -> &str {
        &self.system
    }

    async fn session(&self) -> Result<Arc<dyn HmcSession>> {
        let slot = self.session.lock().await;
        slot.get().map(Arc::clone)
    }

    /// Name as known by the HMC. Classic mode names are upper-case.
    fn lpar_name(name: &str, cpc: &CpcInfo) -> String {
        if cpc.dpm_enabled {
            name.to_string()
        } else {
            name.to_uppercase()
        }
    }

    fn check_boot_supported(&self, cpc: &CpcInfo, desc: &BootDescriptor) -> Result<()> {
        if !cpc.dpm_enabled
            && !matches!(desc.boot, HmcBoot::Dasd { .. } | HmcBoot::ScsiDirect { .. } | HmcBoot::None)
        {
            return Err(classic_unsupported(&desc.boot));
        }
        if desc.is_simulated_netboot() && self.shells.is_none() {
            return Err(HypervisorError::InvalidConfig(
                "simulated network boot needs a shell connector".to_string(),
            ));
        }
        Ok(())
    }

    async fn wait_status(&self, session: &dyn HmcSession, name: &str, expected: &str) -> Result<()> {
        poll_until(&self.config.activation, "activation", |_| async move {
            let status = session.status(&self.system, name).await?;
            debug!(status = %status, expected = %expected, "Polled status");
            Ok(status == expected)
        })
        .await?;
        Ok(())
    }

    async fn simulated_netboot(&self, key: &str, console: &dyn RescueConsole, desc: &BootDescriptor) -> Result<()> {
        let shells = self.shells.as_deref().ok_or_else(|| {
            HypervisorError::InvalidConfig("simulated network boot needs a shell connector".to_string())
        })?;
        let setup = desc
            .netsetup
            .as_ref()
            .ok_or_else(|| HypervisorError::Internal("netsetup missing".to_string()))?;
        let mut orchestrator = NetbootOrchestrator::new(&self.config, shells, self.reachability.as_ref());
        let result = orchestrator.run(key, console, setup, desc.netboot.as_ref()).await;
        if let Err(e) = &result {
            warn!(stage = ?orchestrator.reached(), error = %e, "Simulated network boot failed");
        }
        result
    }

    // =========================================================================
    // Classic mode
    // =========================================================================

    /// Update the image profile when needed and activate the LPAR.
    async fn prepare_classic(&self, session: &dyn HmcSession, lpar: &str, wanted: &Resources) -> Result<()> {
        // Image profiles are named after their LPAR.
        let current = session.image_profile(&self.system, lpar).await?;
        let update = ResourceUpdate::diff(&current, wanted);
        let updated = !update.is_empty();
        if updated {
            info!(update = ?update, "Updating image profile");
            session.update_image_profile(&self.system, lpar, &update).await?;
        }

        let status = session.status(&self.system, lpar).await?;
        if updated || status == CLASSIC_NOT_ACTIVATED {
            info!(status = %status, "Activating LPAR");
            session.activate(&self.system, lpar).await?;
        }
        Ok(())
    }

    async fn boot_classic(&self, session: &dyn HmcSession, lpar: &str, desc: &BootDescriptor, force: bool) -> Result<()> {
        if desc.is_simulated_netboot() {
            let console = PartitionConsole {
                session,
                cpc: &self.system,
                name: lpar,
                target: IplTarget::Classic { boot: &desc.boot, force },
            };
            return self.simulated_netboot(lpar, &console, desc).await;
        }
        if desc.boot == HmcBoot::None {
            return Ok(());
        }
        ipl_classic(session, &self.system, lpar, &desc.boot, force).await?;
        self.wait_status(session, lpar, CLASSIC_OPERATING).await
    }

    // =========================================================================
    // DPM mode
    // =========================================================================

    async fn describe_volumes(&self, session: &dyn HmcSession, partition: &str) -> Result<Vec<VolumeDescriptor>> {
        let uri = session.partition_uri(&self.system, partition).await?;
        let volumes = session.storage_volumes(&self.system, partition).await?;
        Ok(volumes.iter().map(|v| VolumeDescriptor::describe(v, &uri)).collect())
    }

    /// Translate the boot variant into partition boot settings.
    async fn partition_boot(&self, session: &dyn HmcSession, partition: &str, boot: &HmcBoot) -> Result<PartitionBoot> {
        let not_found = |what: String, volumes: &[VolumeDescriptor]| {
            HypervisorError::operation_with(
                "resolve boot device",
                format!("{} is not attached to partition {}", what, partition),
                json!({ "volumes": volumes.iter().map(|v| v.to_string()).collect::<Vec<_>>() }),
            )
        };

        match boot {
            HmcBoot::Dasd { devno } => {
                let volumes = self.describe_volumes(session, partition).await?;
                let devno = short_devno(devno);
                let volume = volumes
                    .iter()
                    .find(|v| v.is_ficon(devno))
                    .ok_or_else(|| not_found(format!("FICON volume {}", devno), &volumes))?;
                ensure_fulfilled(volume)?;
                Ok(PartitionBoot::StorageVolume { uri: volume.uri.clone() })
            }
            HmcBoot::ScsiVolume { uuid } => {
                let volumes = self.describe_volumes(session, partition).await?;
                let volume = volumes
                    .iter()
                    .find(|v| v.is_fcp(uuid))
                    .ok_or_else(|| not_found(format!("FCP volume {}", uuid), &volumes))?;
                ensure_fulfilled(volume)?;
                match &volume.attachment {
                    Attachment::Fcp { paths, .. } if !paths.is_empty() => {
                        debug!(devno = %paths[0].devno, wwpn = %paths[0].wwpn, lun = %paths[0].lun, "Booting through first path");
                        Ok(PartitionBoot::StorageVolume { uri: volume.uri.clone() })
                    }
                    _ => Err(not_found(format!("a path to FCP volume {}", uuid), &volumes)),
                }
            }
            HmcBoot::ScsiDirect { devno, wwpn, lun } => Ok(PartitionBoot::StorageAdapter {
                devno: short_devno(devno).to_string(),
                wwpn: wwpn.clone(),
                lun: lun.clone(),
            }),
            HmcBoot::Nvme { devno } => Ok(PartitionBoot::Nvme {
                devno: short_devno(devno).to_string(),
            }),
            HmcBoot::InstallFile { protocol, url } => ftp_boot(protocol, url),
            HmcBoot::None => Ok(PartitionBoot::None),
        }
    }

    async fn prepare_dpm(&self, session: &dyn HmcSession, partition: &str, wanted: &Resources) -> Result<()> {
        let current = session.partition_resources(&self.system, partition).await?;
        let update = ResourceUpdate::diff(&current, wanted);
        if !update.is_empty() {
            info!(update = ?update, "Updating partition");
            session.update_partition(&self.system, partition, &update).await?;
        }
        let status = session.status(&self.system, partition).await?;
        if status != DPM_STOPPED {
            info!(status = %status, "Stopping partition before boot");
            session.stop_partition(&self.system, partition).await?;
        }
        Ok(())
    }

    async fn boot_dpm(
        &self,
        session: &dyn HmcSession,
        partition: &str,
        target: &PartitionBoot,
        desc: &BootDescriptor,
    ) -> Result<()> {
        if desc.is_simulated_netboot() {
            let console = PartitionConsole {
                session,
                cpc: &self.system,
                name: partition,
                target: IplTarget::Dpm { boot: target },
            };
            return self.simulated_netboot(partition, &console, desc).await;
        }
        session.set_boot_device(&self.system, partition, target).await?;
        session.start_partition(&self.system, partition).await?;
        self.wait_status(session, partition, DPM_ACTIVE).await
    }
}

fn ensure_fulfilled(volume: &VolumeDescriptor) -> Result<()> {
    if !volume.is_fulfilled {
        return Err(HypervisorError::operation_with(
            "resolve boot device",
            format!("{} is not fulfilled", volume),
            json!({ "uri": volume.uri }),
        ));
    }
    Ok(())
}

#[async_trait]
impl Lifecycle for HmcDriver {
    fn family(&self) -> Family {
        Family::Hmc
    }

    async fn capabilities(&self) -> Result<Capabilities> {
        let dpm = match self.session().await {
            Ok(session) => Some(session.cpc(&self.system).await?.dpm_enabled),
            Err(_) => None,
        };
        Ok(Capabilities {
            family: Family::Hmc,
            backend: match dpm {
                Some(true) => "hmc-dpm",
                Some(false) => "hmc-classic",
                None => "hmc",
            }
            .to_string(),
            atomic_reboot: dpm != Some(true),
            native_netboot: dpm != Some(false),
            simulated_netboot: true,
            soft_disconnect: false,
        })
    }

    #[instrument(skip(self), fields(host = %self.credentials.host, system = %self.system))]
    async fn login(&self) -> Result<SessionHandle> {
        info!("Logging in to HMC");
        let session = self
            .connector
            .connect(
                &self.credentials.host,
                self.init.port,
                &self.credentials.user,
                &self.credentials.password,
                self.config.login_timeout(),
            )
            .await?;

        let mut slot = self.session.lock().await;
        let (handle, previous) = slot.open(format!("{}/{}", self.credentials.host, self.system), session);
        if let Some(previous) = previous {
            if let Err(e) = previous.close().await {
                warn!(error = %e, "Failed to close previous HMC session");
            }
        }
        self.states.reset()?;
        Ok(handle)
    }

    #[instrument(skip(self), fields(system = %self.system))]
    async fn logoff(&self) -> Result<()> {
        let mut slot = self.session.lock().await;
        let session = slot.close()?;
        self.states.reset()?;
        session.close().await?;
        info!("Logged off from HMC");
        Ok(())
    }

    #[instrument(skip(self, parameters), fields(system = %self.system, lpar = %name, cpu = cpu, memory = memory))]
    async fn start(&self, name: &str, cpu: u32, memory: u64, parameters: &Value) -> Result<()> {
        let params: HmcStartParams = from_parameters(Family::Hmc, Action::Start, parameters)?;
        let desc = params.boot_params.descriptor(Action::Start)?;
        let session = self.session().await?;
        let cpc = session.cpc(&self.system).await?;
        self.check_boot_supported(&cpc, &desc)?;

        let cpus = calculate_cpus(cpu, params.cpus_cp, params.cpus_ifl, &cpc)?;
        let wanted = Resources {
            memory_mb: memory,
            cp: cpus.cp,
            ifl: cpus.ifl,
        };
        let lpar = Self::lpar_name(name, &cpc);
        let key = name.to_uppercase();
        info!(cp = cpus.cp, ifl = cpus.ifl, dpm = cpc.dpm_enabled, "Starting LPAR");

        self.states.enter(&key)?;
        self.states.transition(&key, EntityState::StartRequested)?;
        if cpc.dpm_enabled {
            let target = self.partition_boot(session.as_ref(), &lpar, &desc.boot).await?;
            self.prepare_dpm(session.as_ref(), &lpar, &wanted).await?;
            self.states.transition(&key, EntityState::Booting)?;
            self.boot_dpm(session.as_ref(), &lpar, &target, &desc).await?;
        } else {
            self.prepare_classic(session.as_ref(), &lpar, &wanted).await?;
            self.states.transition(&key, EntityState::Booting)?;
            self.boot_classic(session.as_ref(), &lpar, &desc, false).await?;
        }
        self.states.transition(&key, EntityState::Active)?;

        info!("LPAR started");
        Ok(())
    }

    #[instrument(skip(self, _parameters), fields(system = %self.system, lpar = %name))]
    async fn stop(&self, name: &str, _parameters: &Value) -> Result<()> {
        let session = self.session().await?;
        let cpc = session.cpc(&self.system).await?;
        let lpar = Self::lpar_name(name, &cpc);
        let key = name.to_uppercase();

        self.states.enter(&key)?;
        self.states.transition(&key, EntityState::StopRequested)?;
        if cpc.dpm_enabled {
            session.stop_partition(&self.system, &lpar).await?;
        } else {
            session.stop(&self.system, &lpar).await?;
            session.reset_clear(&self.system, &lpar).await?;
        }
        self.states.transition(&key, EntityState::Inactive)?;

        info!("LPAR stopped");
        Ok(())
    }

    /// Classic mode reboots with a forced load. DPM has no such primitive,
    /// the partition is stopped and started again.
    #[instrument(skip(self, parameters), fields(system = %self.system, lpar = %name))]
    async fn reboot(&self, name: &str, parameters: &Value) -> Result<()> {
        let params: HmcStartParams = from_parameters(Family::Hmc, Action::Reboot, parameters)?;
        let desc = params.boot_params.descriptor(Action::Reboot)?;
        let session = self.session().await?;
        let cpc = session.cpc(&self.system).await?;
        self.check_boot_supported(&cpc, &desc)?;
        let lpar = Self::lpar_name(name, &cpc);
        let key = name.to_uppercase();

        self.states.enter(&key)?;
        if cpc.dpm_enabled {
            let target = self.partition_boot(session.as_ref(), &lpar, &desc.boot).await?;
            self.states.transition(&key, EntityState::StopRequested)?;
            session.stop_partition(&self.system, &lpar).await?;
            self.states.transition(&key, EntityState::Inactive)?;
            self.states.transition(&key, EntityState::StartRequested)?;
            self.states.transition(&key, EntityState::Booting)?;
            self.boot_dpm(session.as_ref(), &lpar, &target, &desc).await?;
        } else {
            if self.states.get(&key)? != EntityState::Active {
                self.states.transition(&key, EntityState::StartRequested)?;
            }
            self.states.transition(&key, EntityState::Booting)?;
            self.boot_classic(session.as_ref(), &lpar, &desc, true).await?;
        }
        self.states.transition(&key, EntityState::Active)?;

        info!("LPAR rebooted");
        Ok(())
    }

    async fn entity_state(&self, name: &str) -> Result<EntityState> {
        self.states.get(&name.to_uppercase())
    }
}
