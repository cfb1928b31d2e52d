//! Driver configuration.
//!
//! Timeouts and retry budgets for every stage that waits on a backend.
//! Loaded from YAML, every field optional:
//!
//! ```yaml
//! schema_dir: /etc/zcontrol/schemas
//! command_timeout_secs: 120
//! activation:
//!   max_attempts: 120
//!   delay_ms: 5000
//! netboot:
//!   readiness_marker: "rescue-ready"
//!   rescue_ipl:
//!     max_attempts: 30
//!     delay_ms: 2000
//!     backoff: { kind: exponential, factor: 2, max_delay_ms: 60000 }
//!   fetch_timeout_secs: 1800
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{HypervisorError, Result};
use crate::retry::RetryPolicy;
use crate::schema::SchemaRepository;

/// Overrides `schema_dir`.
pub const SCHEMA_DIR_ENV: &str = "ZCONTROL_SCHEMA_DIR";

/// Main configuration structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Load schemas from this directory instead of the built-in set.
    pub schema_dir: Option<PathBuf>,
    /// Bound for establishing a console, terminal or shell session.
    pub login_timeout_secs: u64,
    /// Bound for a single shell or terminal command.
    pub command_timeout_secs: u64,
    /// Polling budget while waiting for an entity to become active.
    pub activation: RetryPolicy,
    /// Simulated network boot stages.
    pub netboot: NetbootConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            schema_dir: None,
            login_timeout_secs: 60,
            command_timeout_secs: 120,
            activation: RetryPolicy::fixed(360, Duration::from_secs(5)),
            netboot: NetbootConfig::default(),
        }
    }
}

/// Simulated network boot configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetbootConfig {
    /// Wait for the rescue system to come up after its IPL.
    pub rescue_ipl: RetryPolicy,
    /// Text the rescue system prints on the console once it accepts input.
    /// `None` means "operating" status alone is enough.
    pub readiness_marker: Option<String>,
    /// Wait for the configured address to become reachable.
    pub network: RetryPolicy,
    /// Bound for downloading one artifact. Must exceed `command_timeout_secs`.
    pub fetch_timeout_secs: u64,
    /// Shell account on the rescue system.
    pub shell_user: String,
    pub shell_port: u16,
    /// Where the artifacts are stored on the rescue system.
    pub kernel_path: String,
    pub initrd_path: String,
    /// Longest console input accepted per command.
    pub console_chunk: usize,
}

impl Default for NetbootConfig {
    fn default() -> Self {
        Self {
            rescue_ipl: RetryPolicy::fixed(360, Duration::from_secs(5)),
            readiness_marker: None,
            network: RetryPolicy::fixed(360, Duration::from_secs(5)),
            fetch_timeout_secs: 1800,
            shell_user: "root".to_string(),
            shell_port: 22,
            kernel_path: "/tmp/kernel".to_string(),
            initrd_path: "/tmp/initrd".to_string(),
            console_chunk: 100,
        }
    }
}

impl DriverConfig {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: DriverConfig = serde_yaml::from_str(&content)
            .with_context(|| "Failed to parse config file")?;

        config.validate().with_context(|| format!("Invalid config file: {}", path.display()))?;

        Ok(config)
    }

    /// Apply environment overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(dir) = std::env::var(SCHEMA_DIR_ENV) {
            if !dir.trim().is_empty() {
                self.schema_dir = Some(PathBuf::from(dir));
            }
        }
        self
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.netboot.fetch_timeout_secs)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.command_timeout_secs == 0 || self.login_timeout_secs == 0 {
            return Err(HypervisorError::InvalidConfig(
                "login and command timeouts must be positive".to_string(),
            ));
        }
        if self.netboot.fetch_timeout_secs <= self.command_timeout_secs {
            return Err(HypervisorError::InvalidConfig(format!(
                "netboot.fetch_timeout_secs ({}) must be larger than command_timeout_secs ({})",
                self.netboot.fetch_timeout_secs, self.command_timeout_secs
            )));
        }
        if self.netboot.console_chunk == 0 {
            return Err(HypervisorError::InvalidConfig(
                "netboot.console_chunk must be positive".to_string(),
            ));
        }
        self.activation.validate("activation")?;
        self.netboot.rescue_ipl.validate("netboot.rescue_ipl")?;
        self.netboot.network.validate("netboot.network")?;
        Ok(())
    }

    /// Build the schema repository this configuration points at.
    pub fn schema_repository(&self) -> Result<SchemaRepository> {
        let repo = match &self.schema_dir {
            Some(dir) => SchemaRepository::load_dir(dir)?,
            None => {
                info!("Using built-in parameter schemas");
                SchemaRepository::builtin()?
            }
        };
        Ok(repo)
    }
}
