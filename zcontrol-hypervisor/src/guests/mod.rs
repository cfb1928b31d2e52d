//! Operating systems running inside a managed entity.
//!
//! CMS guests are driven by the z/VM driver, see [`crate::zvm`].

mod linux;

pub use linux::{HotplugParams, LinuxGuest, LinuxInit};
