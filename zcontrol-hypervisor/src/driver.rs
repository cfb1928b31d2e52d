//! Driver selection.
//!
//! [`Hypervisor`] closes the set of drivers into one type so callers can
//! pick a backend at runtime and still get a concrete, `Send + Sync` value.
//! [`Hypervisor::build`] validates the constructor parameters and wraps the
//! driver in [`Validated`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::config::DriverConfig;
use crate::dispatch::Validated;
use crate::error::{HypervisorError, Result};
use crate::hmc::{HmcConnector, HmcDriver};
use crate::kvm::KvmDriver;
use crate::schema::SchemaRepository;
use crate::session::SessionHandle;
use crate::traits::{Capabilities, Lifecycle};
use crate::transport::{Reachability, ShellConnector, TcpProbe};
use crate::types::{Credentials, EntityState, Family};
use crate::zvm::{TerminalConnector, ZvmDriver};

/// Hypervisor backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HypervisorKind {
    Hmc,
    Zvm,
    Kvm,
}

impl HypervisorKind {
    pub fn family(&self) -> Family {
        match self {
            HypervisorKind::Hmc => Family::Hmc,
            HypervisorKind::Zvm => Family::Zvm,
            HypervisorKind::Kvm => Family::Kvm,
        }
    }
}

impl fmt::Display for HypervisorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.family().as_str())
    }
}

impl FromStr for HypervisorKind {
    type Err = HypervisorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hmc" => Ok(HypervisorKind::Hmc),
            "zvm" => Ok(HypervisorKind::Zvm),
            "kvm" => Ok(HypervisorKind::Kvm),
            other => Err(HypervisorError::InvalidConfig(format!(
                "Unknown hypervisor type '{}'",
                other
            ))),
        }
    }
}

/// External clients the drivers talk through. Only the ones the selected
/// backend needs have to be set.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub hmc: Option<Arc<dyn HmcConnector>>,
    pub terminals: Option<Arc<dyn TerminalConnector>>,
    /// Host shells for KVM, rescue shells for the simulated network boot.
    pub shells: Option<Arc<dyn ShellConnector>>,
    /// Defaults to a TCP probe.
    pub reachability: Option<Arc<dyn Reachability>>,
}

impl Collaborators {
    pub fn with_hmc(mut self, connector: Arc<dyn HmcConnector>) -> Self {
        self.hmc = Some(connector);
        self
    }

    pub fn with_terminals(mut self, connector: Arc<dyn TerminalConnector>) -> Self {
        self.terminals = Some(connector);
        self
    }

    pub fn with_shells(mut self, connector: Arc<dyn ShellConnector>) -> Self {
        self.shells = Some(connector);
        self
    }

    pub fn with_reachability(mut self, reachability: Arc<dyn Reachability>) -> Self {
        self.reachability = Some(reachability);
        self
    }
}

fn missing(kind: HypervisorKind, what: &str) -> HypervisorError {
    HypervisorError::InvalidConfig(format!("{} driver needs a {} connector", kind, what))
}

/// Any of the hypervisor drivers.
pub enum Hypervisor {
    Hmc(HmcDriver),
    Zvm(ZvmDriver),
    Kvm(KvmDriver),
}

impl Hypervisor {
    /// Validate `parameters` against `{kind}/actions/init.json` and create
    /// the driver for `system`.
    pub fn build(
        kind: HypervisorKind,
        system: &str,
        credentials: Credentials,
        parameters: &Value,
        collaborators: &Collaborators,
        schemas: Arc<SchemaRepository>,
        config: DriverConfig,
    ) -> Result<Validated<Hypervisor>> {
        config.validate()?;
        Validated::init(schemas, kind.family(), parameters, |parameters| {
            let driver = match kind {
                HypervisorKind::Hmc => {
                    let connector = collaborators.hmc.clone().ok_or_else(|| missing(kind, "HMC"))?;
                    let mut driver = HmcDriver::new(system, credentials, parameters, connector)?.with_config(config);
                    if let Some(shells) = &collaborators.shells {
                        let reachability = collaborators
                            .reachability
                            .clone()
                            .unwrap_or_else(|| Arc::new(TcpProbe));
                        driver = driver.with_netboot(Arc::clone(shells), reachability);
                    }
                    Hypervisor::Hmc(driver)
                }
                HypervisorKind::Zvm => {
                    let connector = collaborators
                        .terminals
                        .clone()
                        .ok_or_else(|| missing(kind, "terminal"))?;
                    Hypervisor::Zvm(ZvmDriver::new(credentials, connector).with_config(config))
                }
                HypervisorKind::Kvm => {
                    let shells = collaborators.shells.clone().ok_or_else(|| missing(kind, "shell"))?;
                    Hypervisor::Kvm(KvmDriver::new(system, credentials, parameters, shells)?.with_config(config))
                }
            };
            info!(kind = %kind, system = %system, "Hypervisor driver created");
            Ok(driver)
        })
    }

    pub fn kind(&self) -> HypervisorKind {
        match self {
            Hypervisor::Hmc(_) => HypervisorKind::Hmc,
            Hypervisor::Zvm(_) => HypervisorKind::Zvm,
            Hypervisor::Kvm(_) => HypervisorKind::Kvm,
        }
    }

    fn driver(&self) -> &dyn Lifecycle {
        match self {
            Hypervisor::Hmc(driver) => driver,
            Hypervisor::Zvm(driver) => driver,
            Hypervisor::Kvm(driver) => driver,
        }
    }
}

#[async_trait]
impl Lifecycle for Hypervisor {
    fn family(&self) -> Family {
        self.kind().family()
    }

    async fn capabilities(&self) -> Result<Capabilities> {
        self.driver().capabilities().await
    }

    async fn login(&self) -> Result<SessionHandle> {
        self.driver().login().await
    }

    async fn logoff(&self) -> Result<()> {
        self.driver().logoff().await
    }

    async fn start(&self, name: &str, cpu: u32, memory: u64, parameters: &Value) -> Result<()> {
        self.driver().start(name, cpu, memory, parameters).await
    }

    async fn stop(&self, name: &str, parameters: &Value) -> Result<()> {
        self.driver().stop(name, parameters).await
    }

    async fn reboot(&self, name: &str, parameters: &Value) -> Result<()> {
        self.driver().reboot(name, parameters).await
    }

    async fn entity_state(&self, name: &str) -> Result<EntityState> {
        self.driver().entity_state(name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::mock::{MockHmc, MockShellConnector, MockTerminal, MockTerminalConnector};
    use serde_json::json;

    fn schemas() -> Arc<SchemaRepository> {
        Arc::new(SchemaRepository::builtin().unwrap())
    }

    fn collaborators() -> Collaborators {
        Collaborators::default()
            .with_hmc(Arc::new(MockHmc::classic("CPC1")))
            .with_terminals(Arc::new(MockTerminalConnector::new(MockTerminal::new("LINUX01"), "pw")))
            .with_shells(Arc::new(MockShellConnector::new()))
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!("HMC".parse::<HypervisorKind>().unwrap(), HypervisorKind::Hmc);
        assert_eq!(" zvm ".parse::<HypervisorKind>().unwrap(), HypervisorKind::Zvm);
        assert_eq!("kvm".parse::<HypervisorKind>().unwrap().family(), Family::Kvm);
        let err = "xen".parse::<HypervisorKind>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_build_each_kind() {
        let creds = || Credentials::new("host.example.com", "linux01", "pw");
        for kind in [HypervisorKind::Hmc, HypervisorKind::Zvm, HypervisorKind::Kvm] {
            let driver = Hypervisor::build(
                kind,
                "cpc1",
                creds(),
                &json!({}),
                &collaborators(),
                schemas(),
                DriverConfig::default(),
            )
            .unwrap();
            assert_eq!(driver.inner().kind(), kind);
            assert_eq!(driver.family(), kind.family());
        }
    }

    #[test]
    fn test_build_rejects_bad_init_parameters() {
        let result = Hypervisor::build(
            HypervisorKind::Kvm,
            "kvmhost01",
            Credentials::new("kvmhost01", "root", "pw"),
            &json!({"port": "twenty-two"}),
            &collaborators(),
            schemas(),
            DriverConfig::default(),
        );
        assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::InvalidParameters));
    }

    #[test]
    fn test_build_needs_collaborator() {
        let result = Hypervisor::build(
            HypervisorKind::Zvm,
            "",
            Credentials::new("zvm01", "linux01", "pw"),
            &json!({}),
            &Collaborators::default(),
            schemas(),
            DriverConfig::default(),
        );
        assert!(matches!(result, Err(HypervisorError::InvalidConfig(_))));
    }

    #[test]
    fn test_build_validates_config() {
        let mut config = DriverConfig::default();
        config.netboot.fetch_timeout_secs = 1;
        config.command_timeout_secs = 300;
        for kind in [HypervisorKind::Hmc, HypervisorKind::Zvm, HypervisorKind::Kvm] {
            let result = Hypervisor::build(
                kind,
                "cpc1",
                Credentials::new("host.example.com", "linux01", "pw"),
                &json!({}),
                &collaborators(),
                schemas(),
                config.clone(),
            );
            match result {
                Err(HypervisorError::InvalidConfig(msg)) => assert!(msg.contains("fetch_timeout_secs")),
                Err(other) => panic!("unexpected error {other}"),
                Ok(_) => panic!("{kind} driver built with an invalid config"),
            }
        }
    }

    #[tokio::test]
    async fn test_delegates_to_driver() {
        let driver = Hypervisor::build(
            HypervisorKind::Kvm,
            "kvmhost01",
            Credentials::new("kvmhost01", "root", "pw"),
            &json!({"port": 22}),
            &collaborators(),
            schemas(),
            DriverConfig::default(),
        )
        .unwrap();
        driver.login().await.unwrap();
        assert_eq!(driver.capabilities().await.unwrap().backend, "kvm");
        assert_eq!(driver.entity_state("kvm054").await.unwrap(), EntityState::Unknown);
    }
}
