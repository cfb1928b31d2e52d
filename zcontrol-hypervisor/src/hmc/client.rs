//! HMC Web Services collaborator.
//!
//! The REST client is external. These traits carry only the calls the
//! driver needs. Classic-mode calls address LPARs and their image
//! activation profiles, DPM calls address partitions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::volume::VolumeProperties;
use crate::error::Result;

/// Properties of a CPC relevant for activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpcInfo {
    pub name: String,
    /// CPC runs in Dynamic Partition Manager mode.
    #[serde(rename = "dpm-enabled")]
    pub dpm_enabled: bool,
    /// General purpose processors available.
    #[serde(rename = "processor-count-general-purpose")]
    pub cpus_cp: u32,
    #[serde(rename = "processor-count-ifl")]
    pub cpus_ifl: u32,
}

/// Memory and shared processors of an image profile or partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(rename = "central-storage")]
    pub memory_mb: u64,
    #[serde(rename = "number-shared-general-purpose-processors")]
    pub cp: u32,
    #[serde(rename = "number-shared-ifl-processors")]
    pub ifl: u32,
}

/// Fields of [`Resources`] that need to change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceUpdate {
    #[serde(rename = "central-storage", skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(
        rename = "number-shared-general-purpose-processors",
        skip_serializing_if = "Option::is_none"
    )]
    pub cp: Option<u32>,
    #[serde(rename = "number-shared-ifl-processors", skip_serializing_if = "Option::is_none")]
    pub ifl: Option<u32>,
}

impl ResourceUpdate {
    /// Changes needed to go from `current` to `wanted`.
    pub fn diff(current: &Resources, wanted: &Resources) -> Self {
        Self {
            memory_mb: (current.memory_mb != wanted.memory_mb).then_some(wanted.memory_mb),
            cp: (current.cp != wanted.cp).then_some(wanted.cp),
            ifl: (current.ifl != wanted.ifl).then_some(wanted.ifl),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.memory_mb.is_none() && self.cp.is_none() && self.ifl.is_none()
    }
}

/// Boot device of a DPM partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "boot-device", rename_all = "kebab-case")]
pub enum PartitionBoot {
    /// DASD or SCSI storage volume from an attached storage group.
    StorageVolume {
        #[serde(rename = "boot-storage-volume")]
        uri: String,
    },
    /// SCSI disk addressed directly through an FCP device.
    StorageAdapter {
        #[serde(rename = "boot-device-number")]
        devno: String,
        #[serde(rename = "boot-world-wide-port-name")]
        wwpn: String,
        #[serde(rename = "boot-logical-unit-number")]
        lun: String,
    },
    /// NVMe adapter.
    Nvme {
        #[serde(rename = "boot-device-number")]
        devno: String,
    },
    /// `.ins` file on an FTP, FTPS or SFTP server.
    Ftp {
        #[serde(rename = "boot-ftp-protocol")]
        protocol: String,
        #[serde(rename = "boot-ftp-host")]
        host: String,
        #[serde(rename = "boot-ftp-username")]
        user: String,
        #[serde(rename = "boot-ftp-password")]
        password: String,
        #[serde(rename = "boot-ftp-insfile")]
        insfile: String,
    },
    None,
}

/// Opens HMC sessions.
#[async_trait]
pub trait HmcConnector: Send + Sync {
    /// A rejected logon must surface as
    /// [`crate::HypervisorError::AuthenticationFailed`].
    async fn connect(
        &self,
        host: &str,
        port: Option<u16>,
        user: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<Arc<dyn HmcSession>>;
}

/// An authenticated HMC Web Services session.
///
/// Backend rejections must surface as
/// [`crate::HypervisorError::OperationFailed`] carrying the HMC error body
/// as diagnostic.
#[async_trait]
pub trait HmcSession: Send + Sync {
    async fn cpc(&self, cpc: &str) -> Result<CpcInfo>;

    /// `status` property of an LPAR or partition, e.g. `operating`,
    /// `not-activated`, `active` or `stopped`.
    async fn status(&self, cpc: &str, name: &str) -> Result<String>;

    // =========================================================================
    // Classic mode
    // =========================================================================

    async fn image_profile(&self, cpc: &str, profile: &str) -> Result<Resources>;

    async fn update_image_profile(&self, cpc: &str, profile: &str, update: &ResourceUpdate) -> Result<()>;

    async fn activate(&self, cpc: &str, lpar: &str) -> Result<()>;

    /// CCW load. `force` resets a running LPAR first.
    async fn load(&self, cpc: &str, lpar: &str, devno: &str, force: bool) -> Result<()>;

    async fn scsi_load(&self, cpc: &str, lpar: &str, devno: &str, wwpn: &str, lun: &str, force: bool) -> Result<()>;

    async fn stop(&self, cpc: &str, lpar: &str) -> Result<()>;

    async fn reset_clear(&self, cpc: &str, lpar: &str) -> Result<()>;

    // =========================================================================
    // DPM mode
    // =========================================================================

    async fn partition_uri(&self, cpc: &str, partition: &str) -> Result<String>;

    async fn partition_resources(&self, cpc: &str, partition: &str) -> Result<Resources>;

    async fn update_partition(&self, cpc: &str, partition: &str, update: &ResourceUpdate) -> Result<()>;

    /// Storage volumes of every storage group attached to the partition.
    async fn storage_volumes(&self, cpc: &str, partition: &str) -> Result<Vec<VolumeProperties>>;

    async fn set_boot_device(&self, cpc: &str, partition: &str, boot: &PartitionBoot) -> Result<()>;

    async fn start_partition(&self, cpc: &str, partition: &str) -> Result<()>;

    async fn stop_partition(&self, cpc: &str, partition: &str) -> Result<()>;

    // =========================================================================
    // Operating system console
    // =========================================================================

    async fn send_os_command(&self, cpc: &str, name: &str, command: &str) -> Result<()>;

    /// Operating system messages received since the last call.
    async fn os_messages(&self, cpc: &str, name: &str) -> Result<Vec<String>>;

    async fn close(&self) -> Result<()>;
}
