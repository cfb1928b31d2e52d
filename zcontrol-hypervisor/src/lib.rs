//! # zcontrol Hypervisor
//!
//! Lifecycle automation for IBM Z hypervisors and their guests.
//!
//! This crate provides one interface over three hypervisor backends:
//! - **HMC** - LPARs of a CPC in classic or DPM mode
//! - **z/VM** - a guest driven over its 3270 terminal
//! - **KVM** - domains on a KVM host driven through `virsh`
//!
//! Every lifecycle action takes a free-form `parameters` document. Before a
//! driver sees it, the document is checked against the JSON schema of that
//! family and action. A rejected document never reaches the backend.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Validated<Hypervisor>           │
//! │  schema check per (family, action)      │
//! └─────────────────────┬───────────────────┘
//!                       │ Lifecycle
//!       ┌───────────────┼───────────────┐
//!       ▼               ▼               ▼
//! ┌───────────┐   ┌───────────┐   ┌───────────┐
//! │ HmcDriver │   │ ZvmDriver │   │ KvmDriver │
//! │ (WS API)  │   │  (3270)   │   │  (virsh)  │
//! └─────┬─────┘   └───────────┘   └───────────┘
//!       │ netsetup
//!       ▼
//! ┌─────────────────────┐
//! │ NetbootOrchestrator │  rescue IPL, network, shell, fetch, kexec
//! └─────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use serde_json::json;
//! use zcontrol_hypervisor::{
//!     Collaborators, Credentials, DriverConfig, Hypervisor, HypervisorKind, Lifecycle,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = DriverConfig::load("/etc/zcontrol/driver.yaml")?;
//!     let schemas = Arc::new(config.schema_repository()?);
//!     let collaborators = Collaborators::default().with_shells(Arc::new(my_ssh_connector()));
//!
//!     let kvm = Hypervisor::build(
//!         HypervisorKind::Kvm,
//!         "kvmhost01",
//!         Credentials::new("kvmhost01.example.com", "root", "secret"),
//!         &json!({}),
//!         &collaborators,
//!         schemas,
//!         config,
//!     )?;
//!
//!     kvm.login().await?;
//!     kvm.start("kvm054", 2, 4096, &json!({
//!         "boot_params": {"boot_method": "disk"},
//!         "storage_volumes": [{"type": "dasd", "devno": "3956"}],
//!     })).await?;
//!     kvm.logoff().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod guests;
pub mod hmc;
pub mod kvm;
pub mod live_image;
pub mod mock;
pub mod netboot;
pub mod retry;
pub mod schema;
pub mod session;
pub mod state;
pub mod traits;
pub mod transport;
pub mod types;
pub mod zvm;

pub use config::{DriverConfig, NetbootConfig};
pub use dispatch::{validate_parameters, Validated};
pub use driver::{Collaborators, Hypervisor, HypervisorKind};
pub use error::{ErrorKind, HypervisorError, Result};
pub use guests::LinuxGuest;
pub use hmc::{HmcConnector, HmcDriver, HmcSession};
pub use kvm::KvmDriver;
pub use live_image::{needs_regeneration, LiveImage};
pub use netboot::{NetbootOrchestrator, RescueConsole, Stage};
pub use retry::RetryPolicy;
pub use schema::{SchemaError, SchemaRepository, Violation, ViolationReport};
pub use session::SessionHandle;
pub use traits::{Capabilities, Lifecycle};
pub use transport::{CommandOutput, Reachability, ShellConnector, ShellSession, TcpProbe};
pub use types::*;
pub use zvm::{TerminalConnector, ZvmDriver};
