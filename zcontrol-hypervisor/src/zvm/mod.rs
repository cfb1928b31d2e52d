//! z/VM driver.
//!
//! Drives a single z/VM user over a 3270 terminal. On z/VM the managed
//! guest is the login user itself, so every entity name passed to the
//! lifecycle methods must equal the user.
//!
//! `logoff` only disconnects the terminal and leaves the guest running.
//! `stop` clears the guest and logs the user off.

mod cms;
mod terminal;

pub use cms::split_chars;
pub use terminal::{
    first_match, CpTerminal, LogonOptions, Matched, TerminalConnector, TerminalReply, CP_ERROR_PATTERN,
};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::DriverConfig;
use crate::error::{HypervisorError, Result};
use crate::schema::ConstraintKind;
use crate::session::{SessionHandle, SessionSlot};
use crate::state::StateTracker;
use crate::traits::{Capabilities, Lifecycle};
use crate::types::{
    from_parameters, short_devno, Action, Credentials, EntityState, Family, Iface, NetBoot, StorageVolume,
};
use cms::Cms;

/// How a z/VM guest is booted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZvmBootMethod {
    /// IPL CMS.
    Cms,
    /// IPL the storage volume flagged as boot device.
    Disk,
    /// IPL a kernel punched to the virtual reader.
    Network,
}

/// Parameters of `start` and `reboot`.
#[derive(Debug, Clone, Deserialize)]
pub struct ZvmStartParams {
    pub boot_method: ZvmBootMethod,
    #[serde(default)]
    pub storage_volumes: Vec<StorageVolume>,
    #[serde(default)]
    pub ifaces: Vec<Iface>,
    #[serde(default)]
    pub netboot: Option<NetBoot>,
}

/// Resolved boot target.
#[derive(Debug, Clone, PartialEq)]
pub enum ZvmBoot {
    Cms,
    Dasd { devno: String },
    Fcp { devno: String, wwpn: String, lun: String },
    Network(NetBoot),
}

impl ZvmStartParams {
    /// Pick the boot target. `action` only labels the error.
    pub fn boot(&self, action: Action) -> Result<ZvmBoot> {
        match self.boot_method {
            ZvmBootMethod::Cms => Ok(ZvmBoot::Cms),
            ZvmBootMethod::Network => self.netboot.clone().map(ZvmBoot::Network).ok_or_else(|| {
                HypervisorError::invalid_parameters(
                    Family::Zvm,
                    action,
                    "netboot",
                    ConstraintKind::Required,
                    "boot method 'network' requires netboot parameters",
                )
            }),
            ZvmBootMethod::Disk => {
                let missing = |message: &str| {
                    HypervisorError::invalid_parameters(
                        Family::Zvm,
                        action,
                        "storage_volumes",
                        ConstraintKind::Required,
                        message,
                    )
                };
                let volume = self
                    .storage_volumes
                    .iter()
                    .find(|v| v.is_boot_device())
                    .ok_or_else(|| missing("boot method 'disk' requires a boot device"))?;
                match volume {
                    StorageVolume::Dasd { devno, .. } => Ok(ZvmBoot::Dasd {
                        devno: short_devno(devno).to_string(),
                    }),
                    StorageVolume::Fcp { lun, adapters, .. } => {
                        let adapter = adapters
                            .first()
                            .filter(|a| !a.wwpns.is_empty())
                            .ok_or_else(|| missing("FCP boot device requires an adapter with a WWPN"))?;
                        Ok(ZvmBoot::Fcp {
                            devno: short_devno(&adapter.devno).to_string(),
                            wwpn: adapter.wwpns[0].clone(),
                            lun: lun.clone(),
                        })
                    }
                }
            }
        }
    }
}

/// z/VM hypervisor driver.
pub struct ZvmDriver {
    host: String,
    /// Login user, upper-cased. Also the only guest this driver manages.
    user: String,
    password: String,
    config: DriverConfig,
    connector: Arc<dyn TerminalConnector>,
    session: Mutex<SessionSlot<Box<dyn CpTerminal>>>,
    states: StateTracker,
    /// cpu and memory of the last `start`, reused by `reboot`.
    last_start: RwLock<Option<(u32, u64)>>,
    /// Set by `disconnect`. `stop` also closes the terminal, but a later
    /// `start` may log on again.
    disconnected: AtomicBool,
}

impl ZvmDriver {
    pub fn new(credentials: Credentials, connector: Arc<dyn TerminalConnector>) -> Self {
        let user = credentials.user.to_uppercase();
        debug!(host = %credentials.host, user = %user, "Creating z/VM driver");
        Self {
            host: credentials.host,
            user,
            password: credentials.password,
            config: DriverConfig::default(),
            connector,
            session: Mutex::new(SessionSlot::new()),
            states: StateTracker::new(),
            last_start: RwLock::new(None),
            disconnected: AtomicBool::new(false),
        }
    }

    pub fn with_config(mut self, config: DriverConfig) -> Self {
        self.config = config;
        self
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    fn target(&self) -> String {
        format!("{}/{}", self.host, self.user)
    }

    fn check_guest(&self, name: &str) -> Result<()> {
        if name.to_uppercase() != self.user {
            return Err(HypervisorError::InvalidState(format!(
                "On z/VM the guest name '{}' must be the same as the login user '{}'",
                name, self.user
            )));
        }
        Ok(())
    }

    /// Log on and IPL CMS.
    async fn open_terminal(&self) -> Result<Box<dyn CpTerminal>> {
        let mut terminal = self
            .connector
            .logon(
                &self.host,
                &self.user,
                &self.password,
                LogonOptions::default(),
                self.config.login_timeout(),
            )
            .await?;
        Cms::new(terminal.as_mut(), &self.user, self.config.fetch_timeout())
            .ipl_cms()
            .await?;
        Ok(terminal)
    }

    /// End the terminal session, leaving the guest running.
    #[instrument(skip(self), fields(user = %self.user))]
    pub async fn disconnect(&self) -> Result<()> {
        let mut slot = self.session.lock().await;
        let mut terminal = slot.close()?;
        self.disconnected.store(true, Ordering::SeqCst);
        terminal.disconnect().await?;
        self.states.reset()?;
        info!("Disconnected from z/VM, guest keeps running");
        Ok(())
    }

    /// Clear and log off the guest if the session is still open.
    async fn reset_guest(&self, slot: &mut SessionSlot<Box<dyn CpTerminal>>) -> Result<()> {
        match slot.close() {
            Ok(mut terminal) => {
                let result = Cms::new(terminal.as_mut(), &self.user, self.config.fetch_timeout())
                    .stop()
                    .await;
                if let Err(e) = result {
                    slot.open(self.target(), terminal);
                    return Err(e);
                }
                Ok(())
            }
            Err(HypervisorError::SessionClosed(_)) => {
                debug!("Guest already logged off");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn remember_start(&self, cpu: u32, memory: u64) -> Result<()> {
        let mut last = self.last_start.write().map_err(|_| {
            HypervisorError::Internal("Lock poisoned".to_string())
        })?;
        *last = Some((cpu, memory));
        Ok(())
    }
}

#[async_trait]
impl Lifecycle for ZvmDriver {
    fn family(&self) -> Family {
        Family::Zvm
    }

    async fn capabilities(&self) -> Result<Capabilities> {
        Ok(Capabilities {
            family: Family::Zvm,
            backend: "zvm".to_string(),
            atomic_reboot: false,
            native_netboot: true,
            simulated_netboot: false,
            soft_disconnect: true,
        })
    }

    #[instrument(skip(self), fields(host = %self.host, user = %self.user))]
    async fn login(&self) -> Result<SessionHandle> {
        info!("Logging on to z/VM");
        let terminal = self.open_terminal().await?;

        let mut slot = self.session.lock().await;
        let (handle, previous) = slot.open(self.target(), terminal);
        if let Some(mut previous) = previous {
            if let Err(e) = previous.disconnect().await {
                warn!(error = %e, "Failed to disconnect previous terminal");
            }
        }
        self.disconnected.store(false, Ordering::SeqCst);
        self.states.reset()?;
        self.states.enter(&self.user)?;
        Ok(handle)
    }

    async fn logoff(&self) -> Result<()> {
        self.disconnect().await
    }

    #[instrument(skip(self, parameters), fields(guest = %name, cpu = cpu, memory = memory))]
    async fn start(&self, name: &str, cpu: u32, memory: u64, parameters: &Value) -> Result<()> {
        self.check_guest(name)?;
        let params: ZvmStartParams = from_parameters(Family::Zvm, Action::Start, parameters)?;
        let boot = params.boot(Action::Start)?;

        let mut slot = self.session.lock().await;
        if matches!(*slot, SessionSlot::NeverOpened) {
            return Err(HypervisorError::NotLoggedIn);
        }
        if self.disconnected.load(Ordering::SeqCst) {
            slot.get()?;
        }
        info!("Starting z/VM guest");
        self.states.enter(&self.user)?;
        self.states.transition(&self.user, EntityState::StartRequested)?;

        self.reset_guest(&mut slot).await?;
        let terminal = self.open_terminal().await?;
        slot.open(self.target(), terminal);
        let terminal = slot.get_mut()?;
        let mut cms = Cms::new(terminal.as_mut(), &self.user, self.config.fetch_timeout());

        if cpu != 0 {
            cms.detach_cpus().await?;
        }
        if memory != 0 {
            cms.define_storage(memory).await?;
        }
        cms.hotplug(cpu.saturating_sub(1), &params.storage_volumes, &params.ifaces)
            .await?;

        self.states.transition(&self.user, EntityState::Booting)?;
        match &boot {
            ZvmBoot::Cms => cms.ipl_cms().await?,
            ZvmBoot::Dasd { devno } => cms.ipl_disk(devno).await?,
            ZvmBoot::Fcp { devno, wwpn, lun } => {
                cms.set_loaddev(wwpn, lun).await?;
                cms.ipl_disk(devno).await?;
            }
            ZvmBoot::Network(netboot) => cms.netboot(netboot).await?,
        }
        self.states.transition(&self.user, EntityState::Active)?;
        self.remember_start(cpu, memory)?;

        info!("z/VM guest started");
        Ok(())
    }

    #[instrument(skip(self, _parameters), fields(guest = %name))]
    async fn stop(&self, name: &str, _parameters: &Value) -> Result<()> {
        self.check_guest(name)?;
        let mut slot = self.session.lock().await;
        let terminal = slot.get_mut()?;

        self.states.enter(&self.user)?;
        self.states.transition(&self.user, EntityState::StopRequested)?;
        // The session stays open until the guest is really logged off.
        Cms::new(terminal.as_mut(), &self.user, self.config.fetch_timeout())
            .stop()
            .await?;
        slot.close()?;
        self.states.transition(&self.user, EntityState::Inactive)?;
        info!("z/VM guest stopped");
        Ok(())
    }

    #[instrument(skip(self, parameters), fields(guest = %name))]
    async fn reboot(&self, name: &str, parameters: &Value) -> Result<()> {
        self.check_guest(name)?;
        let (cpu, memory) = self
            .last_start
            .read()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))?
            .ok_or_else(|| {
                HypervisorError::InvalidState(format!(
                    "{}: reboot needs a previous start in this session",
                    self.user
                ))
            })?;
        self.stop(name, parameters).await?;
        self.start(name, cpu, memory, parameters).await
    }

    async fn entity_state(&self, name: &str) -> Result<EntityState> {
        self.states.get(&name.to_uppercase())
    }
}
