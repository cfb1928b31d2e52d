//! Linux guests reached over SSH.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::DriverConfig;
use crate::dispatch::validate_parameters;
use crate::error::{HypervisorError, Result};
use crate::kvm::HostStorage;
use crate::netboot::fetch;
use crate::schema::SchemaRepository;
use crate::session::{SessionHandle, SessionSlot};
use crate::transport::{run_checked, shell_quote, ShellConnector, ShellSession};
use crate::types::{from_parameters, Action, Credentials, Family, StorageVolume};

/// Constructor parameters, see `linux/actions/init.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct LinuxInit {
    #[serde(default = "default_ssh_port")]
    pub port: u16,
}

impl Default for LinuxInit {
    fn default() -> Self {
        Self {
            port: default_ssh_port(),
        }
    }
}

fn default_ssh_port() -> u16 {
    22
}

/// Parameters of `hotplug`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HotplugParams {
    #[serde(default)]
    pub storage_volumes: Vec<StorageVolume>,
}

/// A Linux system managed through its shell.
pub struct LinuxGuest {
    name: String,
    credentials: Credentials,
    init: LinuxInit,
    config: DriverConfig,
    shells: Arc<dyn ShellConnector>,
    schemas: Arc<SchemaRepository>,
    session: Mutex<SessionSlot<Box<dyn ShellSession>>>,
}

impl LinuxGuest {
    /// `parameters` are validated against `linux/actions/init.json`.
    pub fn new(
        name: &str,
        credentials: Credentials,
        parameters: &Value,
        shells: Arc<dyn ShellConnector>,
        schemas: Arc<SchemaRepository>,
    ) -> Result<Self> {
        let init = if parameters.is_null() {
            LinuxInit::default()
        } else {
            validate_parameters(&schemas, Family::Linux, Action::Init, parameters)?;
            from_parameters(Family::Linux, Action::Init, parameters)?
        };
        Ok(Self {
            name: name.to_string(),
            credentials,
            init,
            config: DriverConfig::default(),
            shells,
            schemas,
            session: Mutex::new(SessionSlot::new()),
        })
    }

    pub fn with_config(mut self, config: DriverConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<Box<dyn ShellSession>> {
        self.shells
            .connect(
                &self.credentials.host,
                self.init.port,
                &self.credentials.user,
                &self.credentials.password,
                self.config.login_timeout(),
            )
            .await
    }

    /// Connect and make sure the target runs Linux.
    #[instrument(skip(self), fields(guest = %self.name, host = %self.credentials.host))]
    pub async fn login(&self) -> Result<SessionHandle> {
        let mut shell = self.connect().await?;
        let kernel = shell.run("uname -s", self.config.command_timeout()).await?;
        if !kernel.success() || kernel.output.trim() != "Linux" {
            if let Err(e) = shell.close().await {
                warn!(error = %e, "Failed to close shell");
            }
            return Err(HypervisorError::ConnectionFailed(format!(
                "Target system {} is not Linux",
                self.credentials.host
            )));
        }

        let mut slot = self.session.lock().await;
        let (handle, previous) = slot.open(format!("{}@{}", self.credentials.user, self.credentials.host), shell);
        if let Some(mut previous) = previous {
            if let Err(e) = previous.close().await {
                warn!(error = %e, "Failed to close previous shell");
            }
        }
        info!("Logged in to Linux guest");
        Ok(handle)
    }

    pub async fn logoff(&self) -> Result<()> {
        let mut shell = self.session.lock().await.close()?;
        shell.close().await?;
        debug!(guest = %self.name, "Logged off");
        Ok(())
    }

    /// An additional shell, independent of the login session. The caller
    /// closes it.
    pub async fn open_session(&self) -> Result<Box<dyn ShellSession>> {
        self.session.lock().await.get()?;
        self.connect().await
    }

    /// Copy `source_url` to `target` on the guest. `http`, `https` and
    /// `ftp` urls are downloaded by the guest itself; `file` urls name a
    /// local text file.
    #[instrument(skip(self), fields(guest = %self.name))]
    pub async fn push_file(&self, source_url: &str, target: &str) -> Result<()> {
        let url = Url::parse(source_url)
            .map_err(|e| HypervisorError::InvalidConfig(format!("Invalid url '{}': {}", source_url, e)))?;
        let mut slot = self.session.lock().await;
        let shell = slot.get_mut()?;
        match url.scheme() {
            "http" | "https" | "ftp" => {
                fetch(shell.as_mut(), source_url, target, self.config.fetch_timeout()).await
            }
            "file" => {
                let content = tokio::fs::read_to_string(url.path())
                    .await
                    .map_err(|e| HypervisorError::operation("push file", format!("{}: {}", url.path(), e)))?;
                let command = format!("printf '%s' {} > {}", shell_quote(&content), shell_quote(target));
                run_checked(shell.as_mut(), "push file", &command, self.config.command_timeout()).await?;
                Ok(())
            }
            other => Err(HypervisorError::InvalidConfig(format!(
                "Unsupported url scheme '{}'",
                other
            ))),
        }
    }

    /// Bring disks online. Returns their block device paths in order.
    #[instrument(skip(self, parameters), fields(guest = %self.name))]
    pub async fn hotplug(&self, parameters: &Value) -> Result<Vec<String>> {
        validate_parameters(&self.schemas, Family::Linux, Action::Hotplug, parameters)?;
        let params: HotplugParams = from_parameters(Family::Linux, Action::Hotplug, parameters)?;

        let mut slot = self.session.lock().await;
        let shell = slot.get_mut()?;
        let mut storage = HostStorage::new(shell.as_mut(), self.config.command_timeout());
        let mut devices = Vec::with_capacity(params.storage_volumes.len());
        for volume in &params.storage_volumes {
            let device = match volume {
                StorageVolume::Dasd { devno, .. } => storage.activate_dasd(devno).await?,
                StorageVolume::Fcp {
                    lun,
                    adapters,
                    multipath,
                    ..
                } => storage.activate_fcp(lun, adapters, *multipath).await?,
            };
            info!(volume = %volume.id(), device = %device, "Volume hotplugged");
            devices.push(device);
        }
        Ok(devices)
    }

    /// Ask the guest to halt. Does not wait for it.
    pub async fn stop(&self) -> Result<()> {
        let mut slot = self.session.lock().await;
        slot.get_mut()?.send("nohup halt &").await
    }
}
