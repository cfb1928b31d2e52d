//! Types shared by the drivers and the parameter schemas.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{HypervisorError, Result};
use crate::schema::ConstraintKind;

// =============================================================================
// Validation keys
// =============================================================================

/// Component family. Selects the schema directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Hmc,
    Zvm,
    Kvm,
    Linux,
}

impl Family {
    pub fn as_str(&self) -> &'static str {
        match self {
            Family::Hmc => "hmc",
            Family::Zvm => "zvm",
            Family::Kvm => "kvm",
            Family::Linux => "linux",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Family {
    type Err = HypervisorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "hmc" => Ok(Family::Hmc),
            "zvm" => Ok(Family::Zvm),
            "kvm" => Ok(Family::Kvm),
            "linux" => Ok(Family::Linux),
            other => Err(HypervisorError::InvalidConfig(format!(
                "Unknown component family '{}'",
                other
            ))),
        }
    }
}

/// Action name. Selects the schema file inside the family directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Driver construction.
    Init,
    Start,
    Stop,
    Reboot,
    Hotplug,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Init => "init",
            Action::Start => "start",
            Action::Stop => "stop",
            Action::Reboot => "reboot",
            Action::Hotplug => "hotplug",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Connection
// =============================================================================

/// Login data for a hypervisor or guest.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub host: String,
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(host: impl Into<String>, user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("host", &self.host)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Lifecycle state of a managed entity (LPAR, partition, guest, domain).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityState {
    Unknown,
    LoggedIn,
    StartRequested,
    Booting,
    Active,
    StopRequested,
    Inactive,
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityState::Unknown => "unknown",
            EntityState::LoggedIn => "logged_in",
            EntityState::StartRequested => "start_requested",
            EntityState::Booting => "booting",
            EntityState::Active => "active",
            EntityState::StopRequested => "stop_requested",
            EntityState::Inactive => "inactive",
        };
        f.write_str(name)
    }
}

/// Deserialize an already validated parameters document into its typed form.
///
/// A document the schema let through but the typed form refuses is still a
/// parameter error of `family`/`action`.
pub fn from_parameters<T: DeserializeOwned>(family: Family, action: Action, parameters: &Value) -> Result<T> {
    T::deserialize(parameters).map_err(|e| {
        HypervisorError::invalid_parameters(
            family,
            action,
            "<root>",
            ConstraintKind::Type,
            format!("Malformed parameters: {}", e),
        )
    })
}

// =============================================================================
// Network setup
// =============================================================================

/// Kind of network device configured by a net-setup descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetDeviceType {
    #[default]
    Osa,
    Pci,
}

/// Network mask as CIDR prefix length or dotted address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Netmask {
    Prefix(u8),
    Address(String),
}

impl Netmask {
    /// Prefix length, if the mask can be expressed as one.
    pub fn prefix_len(&self) -> Option<u8> {
        match self {
            Netmask::Prefix(len) => Some(*len),
            Netmask::Address(text) => {
                if let Ok(len) = text.parse::<u8>() {
                    return Some(len);
                }
                let bits = u32::from(text.parse::<Ipv4Addr>().ok()?);
                let len = bits.leading_ones();
                // Reject non-contiguous masks.
                (bits.checked_shl(len).unwrap_or(0) == 0).then_some(len as u8)
            }
        }
    }

    /// Dotted IPv4 form, as used by `ifconfig ... netmask`.
    pub fn dotted(&self) -> Option<String> {
        match self {
            Netmask::Address(text) if text.parse::<Ipv4Addr>().is_ok() => Some(text.clone()),
            _ => {
                let len = self.prefix_len()?;
                if len > 32 {
                    return None;
                }
                let bits = if len == 0 { 0 } else { u32::MAX << (32 - u32::from(len)) };
                Some(Ipv4Addr::from(bits).to_string())
            }
        }
    }
}

/// Console network setup for a booted rescue system.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct NetSetup {
    #[serde(default)]
    pub mac: Option<String>,
    pub ip: String,
    pub mask: Netmask,
    pub gateway: String,
    /// OSA channel(s) (`f500` or `f500,f501,f502`) or PCI function id.
    pub device: String,
    /// Root password of the rescue system.
    #[serde(skip_serializing)]
    pub password: String,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default)]
    pub vlan: Option<u16>,
    #[serde(default, rename = "type")]
    pub device_type: NetDeviceType,
    /// Extra `znetconf` options. `layer2` is consumed separately.
    #[serde(default)]
    pub options: BTreeMap<String, Value>,
}

impl NetSetup {
    pub fn is_ipv6(&self) -> bool {
        self.ip.parse::<Ipv6Addr>().is_ok()
    }
}

impl fmt::Debug for NetSetup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetSetup")
            .field("mac", &self.mac)
            .field("ip", &self.ip)
            .field("mask", &self.mask)
            .field("gateway", &self.gateway)
            .field("device", &self.device)
            .field("password", &"<redacted>")
            .field("dns", &self.dns)
            .field("vlan", &self.vlan)
            .field("device_type", &self.device_type)
            .field("options", &self.options)
            .finish()
    }
}

/// Target kernel for a network boot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetBoot {
    #[serde(alias = "kernel_uri")]
    pub kernel_url: String,
    #[serde(default, alias = "initrd_uri")]
    pub initrd_url: Option<String>,
    #[serde(default)]
    pub cmdline: Option<String>,
}

// =============================================================================
// Devices
// =============================================================================

/// One FCP adapter with the target ports a LUN is reachable through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FcpAdapter {
    pub devno: String,
    pub wwpns: Vec<String>,
}

/// A disk to attach to a guest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageVolume {
    Dasd {
        devno: String,
        #[serde(default)]
        boot_device: bool,
        /// Pre-rendered libvirt `<disk>` element.
        #[serde(default)]
        libvirt: Option<String>,
    },
    Fcp {
        lun: String,
        adapters: Vec<FcpAdapter>,
        #[serde(default)]
        multipath: bool,
        #[serde(default)]
        boot_device: bool,
        #[serde(default)]
        libvirt: Option<String>,
    },
}

impl StorageVolume {
    pub fn is_boot_device(&self) -> bool {
        match self {
            StorageVolume::Dasd { boot_device, .. } | StorageVolume::Fcp { boot_device, .. } => *boot_device,
        }
    }

    pub fn libvirt(&self) -> Option<&str> {
        match self {
            StorageVolume::Dasd { libvirt, .. } | StorageVolume::Fcp { libvirt, .. } => libvirt.as_deref(),
        }
    }

    /// Short identifier for logs: device number or LUN.
    pub fn id(&self) -> &str {
        match self {
            StorageVolume::Dasd { devno, .. } => devno,
            StorageVolume::Fcp { lun, .. } => lun,
        }
    }
}

/// A network interface to attach to a guest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Iface {
    /// OSA card, `id` is a comma separated channel list.
    Osa { id: String },
    /// HiperSockets, `id` is a comma separated channel list.
    Hsi { id: String },
    /// PCI network function.
    Pci { id: String },
    /// Virtual QDIO NIC coupled to a VSWITCH.
    Qdio {
        id: String,
        #[serde(default = "default_nic_devices")]
        count: u32,
        system: String,
    },
    /// Virtual HiperSockets NIC coupled to a guest LAN.
    Hipers {
        id: String,
        #[serde(default = "default_nic_devices")]
        count: u32,
        system: String,
    },
    /// KVM macvtap interface on a host device.
    Macvtap {
        host_iface: String,
        #[serde(default)]
        mac_address: Option<String>,
        #[serde(default)]
        libvirt: Option<String>,
    },
}

fn default_nic_devices() -> u32 {
    3
}

/// Split a device number like `0.0.f500` into its 4 digit form.
pub fn short_devno(devno: &str) -> &str {
    devno.rsplit('.').next().unwrap_or(devno)
}

/// Expand a device number into the full `0.0.xxxx` bus id.
pub fn full_devno(devno: &str) -> String {
    if devno.contains('.') {
        devno.to_lowercase()
    } else {
        format!("0.0.{}", devno.to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_family_round_trip_names() {
        assert_eq!("ZVM".parse::<Family>().unwrap(), Family::Zvm);
        assert_eq!(Family::Kvm.to_string(), "kvm");
        assert!("lpar".parse::<Family>().is_err());
    }

    #[test]
    fn test_netmask_forms() {
        assert_eq!(Netmask::Prefix(24).dotted().as_deref(), Some("255.255.255.0"));
        assert_eq!(Netmask::Address("255.255.252.0".into()).prefix_len(), Some(22));
        assert_eq!(Netmask::Address("64".into()).prefix_len(), Some(64));
        assert_eq!(Netmask::Address("255.0.255.0".into()).prefix_len(), None);
        assert_eq!(Netmask::Prefix(0).dotted().as_deref(), Some("0.0.0.0"));
        assert_eq!(Netmask::Prefix(64).dotted(), None);
    }

    #[test]
    fn test_netsetup_debug_hides_password() {
        let setup: NetSetup = from_parameters(Family::Hmc, Action::Start, &json!({
            "ip": "10.0.0.5", "mask": 24, "gateway": "10.0.0.1",
            "device": "f500", "password": "s3cret"
        }))
        .unwrap();
        assert_eq!(setup.device_type, NetDeviceType::Osa);
        assert!(!format!("{:?}", setup).contains("s3cret"));
        assert!(!serde_json::to_string(&setup).unwrap().contains("s3cret"));
    }

    #[test]
    fn test_netboot_uri_aliases() {
        let boot: NetBoot = from_parameters(Family::Hmc, Action::Start, &json!({
            "kernel_uri": "http://repo/kernel", "initrd_uri": "http://repo/initrd"
        }))
        .unwrap();
        assert_eq!(boot.kernel_url, "http://repo/kernel");
        assert_eq!(boot.initrd_url.as_deref(), Some("http://repo/initrd"));
        assert!(boot.cmdline.is_none());
    }

    #[test]
    fn test_malformed_parameters_are_parameter_errors() {
        let err = from_parameters::<NetBoot>(Family::Hmc, Action::Reboot, &json!({
            "kernel_url": "http://repo/kernel",
            "initrd_url": "http://repo/initrd",
            "initrd_uri": "http://repo/initrd"
        }))
        .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidParameters);
        assert!(matches!(
            err,
            HypervisorError::InvalidParameters { family: Family::Hmc, action: Action::Reboot, .. }
        ));
        assert!(err.report().unwrap().find("<root>", ConstraintKind::Type).is_some());
    }

    #[test]
    fn test_storage_volume_variants() {
        let vols: Vec<StorageVolume> = from_parameters(Family::Hmc, Action::Start, &json!([
            {"type": "dasd", "devno": "0.0.3961", "boot_device": true},
            {"type": "fcp", "lun": "4001400000000000", "adapters": [{"devno": "fc00", "wwpns": ["5005076300c213e5"]}]}
        ]))
        .unwrap();
        assert!(vols[0].is_boot_device());
        assert_eq!(vols[1].id(), "4001400000000000");
        assert!(matches!(&vols[1], StorageVolume::Fcp { multipath: false, .. }));
    }

    #[test]
    fn test_devno_helpers() {
        assert_eq!(short_devno("0.0.f500"), "f500");
        assert_eq!(short_devno("F500"), "F500");
        assert_eq!(full_devno("F500"), "0.0.f500");
    }
}
