//! Storage volume descriptors for DPM partitions.
//!
//! The HMC reports storage volumes with every path of every partition the
//! storage group is attached to. Descriptors keep only what booting one
//! partition needs.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A path of an FCP storage volume as reported by the HMC.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct VolumePath {
    pub partition_uri: String,
    pub device_number: String,
    pub target_world_wide_port_name: String,
    pub logical_unit_number: String,
}

/// Storage volume properties as reported by the HMC.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct VolumeProperties {
    pub uri: String,
    /// `null` for HyperPAV aliases.
    pub fulfillment_state: Option<String>,
    pub active_size: f64,
    /// `type` of the owning storage group (`fc` or `fcp`).
    pub storage_group_type: String,
    pub device_number: Option<String>,
    pub eckd_type: Option<String>,
    pub uuid: Option<String>,
    pub paths: Vec<VolumePath>,
}

/// FCP path usable by one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FcpPath {
    pub devno: String,
    pub wwpn: String,
    pub lun: String,
}

/// How a volume is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attachment {
    /// ECKD volume on a FICON storage group.
    Ficon { device_nr: String, is_alias: bool },
    /// SCSI volume on an FCP storage group.
    Fcp { uuid: String, paths: Vec<FcpPath> },
    /// Anything else, by storage group type.
    Other(String),
}

/// Filtered view of a storage volume.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeDescriptor {
    pub uri: String,
    /// The volume can be used (`complete` or `overprovisioned`).
    pub is_fulfilled: bool,
    pub size: f64,
    pub attachment: Attachment,
}

impl VolumeDescriptor {
    /// Describe `volume` as seen from the partition at `partition_uri`.
    pub fn describe(volume: &VolumeProperties, partition_uri: &str) -> Self {
        let is_fulfilled = matches!(
            volume.fulfillment_state.as_deref(),
            Some("complete") | Some("overprovisioned")
        );
        let attachment = match volume.storage_group_type.as_str() {
            "fc" => Attachment::Ficon {
                device_nr: volume.device_number.clone().unwrap_or_default(),
                is_alias: volume.eckd_type.as_deref() == Some("alias"),
            },
            "fcp" => Attachment::Fcp {
                uuid: volume.uuid.clone().unwrap_or_default(),
                paths: volume
                    .paths
                    .iter()
                    .filter(|p| p.partition_uri == partition_uri)
                    .map(|p| FcpPath {
                        devno: p.device_number.clone(),
                        wwpn: p.target_world_wide_port_name.clone(),
                        lun: p.logical_unit_number.clone(),
                    })
                    .collect(),
            },
            other => Attachment::Other(other.to_string()),
        };
        Self {
            uri: volume.uri.clone(),
            is_fulfilled,
            size: volume.active_size,
            attachment,
        }
    }

    /// Usable FICON volume with device number `devno`.
    pub fn is_ficon(&self, devno: &str) -> bool {
        matches!(&self.attachment, Attachment::Ficon { device_nr, is_alias: false }
            if device_nr.eq_ignore_ascii_case(devno))
    }

    /// FCP volume with the given `uuid`.
    pub fn is_fcp(&self, uuid: &str) -> bool {
        matches!(&self.attachment, Attachment::Fcp { uuid: u, .. } if u.eq_ignore_ascii_case(uuid))
    }
}

impl fmt::Display for VolumeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.attachment {
            Attachment::Ficon { device_nr, .. } => write!(f, "FiconVolume<{}, devno={}>", self.uri, device_nr),
            Attachment::Fcp { uuid, .. } => write!(f, "FcpVolume<{}, uuid={}>", self.uri, uuid),
            Attachment::Other(_) => write!(f, "Volume<{}>", self.uri),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fcp_paths_are_filtered_by_partition() {
        let props: VolumeProperties = serde_json::from_value(json!({
            "uri": "/api/storage-groups/sg1/storage-volumes/v1",
            "fulfillment-state": "complete",
            "active-size": 20.0,
            "storage-group-type": "fcp",
            "uuid": "600507680C80063D1000000000000A2B",
            "paths": [
                {
                    "partition-uri": "/api/partitions/p1",
                    "device-number": "1800",
                    "target-world-wide-port-name": "500507680b2124a1",
                    "logical-unit-number": "0000000000000000"
                },
                {
                    "partition-uri": "/api/partitions/p2",
                    "device-number": "1900",
                    "target-world-wide-port-name": "500507680b2124a2",
                    "logical-unit-number": "0000000000000000"
                }
            ]
        }))
        .unwrap();

        let desc = VolumeDescriptor::describe(&props, "/api/partitions/p1");
        assert!(desc.is_fulfilled);
        assert!(desc.is_fcp("600507680c80063d1000000000000a2b"));
        match desc.attachment {
            Attachment::Fcp { paths, .. } => {
                assert_eq!(paths.len(), 1);
                assert_eq!(paths[0].devno, "1800");
            }
            other => panic!("unexpected attachment {other:?}"),
        }
    }

    #[test]
    fn test_ficon_alias_is_not_bootable() {
        let props = VolumeProperties {
            uri: "/api/storage-groups/sg2/storage-volumes/v9".into(),
            fulfillment_state: None,
            storage_group_type: "fc".into(),
            device_number: Some("9A00".into()),
            eckd_type: Some("alias".into()),
            ..Default::default()
        };
        let desc = VolumeDescriptor::describe(&props, "/api/partitions/p1");
        assert!(!desc.is_fulfilled);
        assert!(!desc.is_ficon("9a00"));
        assert_eq!(desc.to_string(), "FiconVolume</api/storage-groups/sg2/storage-volumes/v9, devno=9A00>");
    }
}
