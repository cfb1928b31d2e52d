//! Uniform lifecycle contract implemented by every driver.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::session::SessionHandle;
use crate::types::{EntityState, Family};

/// What a driver backend can do beyond the common contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub family: Family,
    /// Backend description, e.g. `hmc-classic` or `zvm`.
    pub backend: String,
    /// `reboot` maps onto a single backend primitive.
    pub atomic_reboot: bool,
    /// Network boot without an intermediate rescue system.
    pub native_netboot: bool,
    /// Network boot through a rescue disk and kexec.
    pub simulated_netboot: bool,
    /// Ending the session can leave the guest running.
    pub soft_disconnect: bool,
}

/// Lifecycle of the entities managed through one hypervisor session.
///
/// `parameters` is the free-form document of each action. Drivers trust it
/// to have the shape of their schema; wrap them in
/// [`crate::dispatch::Validated`] to enforce that.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Family whose schemas describe this driver's parameters.
    fn family(&self) -> Family;

    async fn capabilities(&self) -> Result<Capabilities>;

    // =========================================================================
    // Session
    // =========================================================================

    /// Open the session every other operation runs on.
    ///
    /// Bad credentials surface as [`crate::HypervisorError::AuthenticationFailed`],
    /// unreachable backends as [`crate::HypervisorError::ConnectionFailed`].
    async fn login(&self) -> Result<SessionHandle>;

    /// Close the session. The handle returned by `login` becomes invalid.
    async fn logoff(&self) -> Result<()>;

    // =========================================================================
    // Entity lifecycle
    // =========================================================================

    /// Boot `name` with `cpu` processors and `memory` MiB.
    ///
    /// A failure part way through leaves devices attached so far in place.
    /// Call `stop` to clean up.
    async fn start(&self, name: &str, cpu: u32, memory: u64, parameters: &Value) -> Result<()>;

    /// Terminate `name`.
    async fn stop(&self, name: &str, parameters: &Value) -> Result<()>;

    /// Restart `name`, atomically where the backend allows it.
    async fn reboot(&self, name: &str, parameters: &Value) -> Result<()>;

    /// Last lifecycle state observed for `name`.
    async fn entity_state(&self, name: &str) -> Result<EntityState>;
}
