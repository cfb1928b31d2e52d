//! Boot descriptors and processor allocation for LPARs and partitions.

use serde::Deserialize;
use serde_json::json;
use url::Url;

use super::client::{CpcInfo, PartitionBoot};
use crate::error::{HypervisorError, Result};
use crate::schema::ConstraintKind;
use crate::types::{Action, Family, NetBoot, NetSetup};

/// `boot_method` values accepted by the HMC driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HmcBootMethod {
    Dasd,
    Scsi,
    Nvme,
    Ftp,
    Ftps,
    Sftp,
    None,
}

impl HmcBootMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HmcBootMethod::Dasd => "dasd",
            HmcBootMethod::Scsi => "scsi",
            HmcBootMethod::Nvme => "nvme",
            HmcBootMethod::Ftp => "ftp",
            HmcBootMethod::Ftps => "ftps",
            HmcBootMethod::Sftp => "sftp",
            HmcBootMethod::None => "none",
        }
    }
}

/// `boot_params` as accepted by `hmc/entities/boot_params.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct BootParams {
    pub boot_method: HmcBootMethod,
    #[serde(default)]
    pub devicenr: Option<String>,
    #[serde(default)]
    pub wwpn: Option<String>,
    #[serde(default)]
    pub lun: Option<String>,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub insfile: Option<String>,
    #[serde(default)]
    pub netsetup: Option<NetSetup>,
    #[serde(default)]
    pub netboot: Option<NetBoot>,
}

/// Parameters of `start` and `reboot`.
#[derive(Debug, Clone, Deserialize)]
pub struct HmcStartParams {
    pub boot_params: BootParams,
    #[serde(default)]
    pub cpus_cp: u32,
    #[serde(default)]
    pub cpus_ifl: u32,
}

/// Device an LPAR or partition is loaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HmcBoot {
    Dasd { devno: String },
    /// SCSI disk given by FCP device, target port and LUN.
    ScsiDirect { devno: String, wwpn: String, lun: String },
    /// SCSI disk given by DPM storage volume UUID.
    ScsiVolume { uuid: String },
    Nvme { devno: String },
    /// Network install from an `.ins` file. `protocol` is the boot method.
    InstallFile { protocol: &'static str, url: Url },
    None,
}

impl HmcBoot {
    /// Whether the rescue system of a simulated network boot can live there.
    pub fn is_disk(&self) -> bool {
        !matches!(self, HmcBoot::InstallFile { .. } | HmcBoot::None)
    }
}

/// Exactly one boot variant, optionally turned into a simulated network
/// boot by `netsetup`.
#[derive(Debug, Clone)]
pub struct BootDescriptor {
    pub boot: HmcBoot,
    pub netsetup: Option<NetSetup>,
    pub netboot: Option<NetBoot>,
}

impl BootDescriptor {
    pub fn is_simulated_netboot(&self) -> bool {
        self.netsetup.is_some()
    }
}

fn required(action: Action, field: &str, method: HmcBootMethod) -> HypervisorError {
    HypervisorError::invalid_parameters(
        Family::Hmc,
        action,
        &format!("boot_params.{}", field),
        ConstraintKind::Required,
        format!("boot method '{}' requires '{}'", method.as_str(), field),
    )
}

impl BootParams {
    /// Resolve the boot variant. `action` only labels errors.
    pub fn descriptor(&self, action: Action) -> Result<BootDescriptor> {
        let method = self.boot_method;
        let field = |value: &Option<String>, name: &str| {
            value.clone().ok_or_else(|| required(action, name, method))
        };

        let boot = match method {
            HmcBootMethod::Dasd => HmcBoot::Dasd {
                devno: field(&self.devicenr, "devicenr")?,
            },
            HmcBootMethod::Scsi => match &self.uuid {
                Some(uuid) => HmcBoot::ScsiVolume { uuid: uuid.clone() },
                None => HmcBoot::ScsiDirect {
                    devno: field(&self.devicenr, "devicenr")?,
                    wwpn: field(&self.wwpn, "wwpn")?,
                    lun: field(&self.lun, "lun")?,
                },
            },
            HmcBootMethod::Nvme => HmcBoot::Nvme {
                devno: field(&self.devicenr, "devicenr")?,
            },
            HmcBootMethod::Ftp | HmcBootMethod::Ftps | HmcBootMethod::Sftp => {
                let insfile = field(&self.insfile, "insfile")?;
                let url = Url::parse(&insfile).map_err(|e| {
                    HypervisorError::invalid_parameters(
                        Family::Hmc,
                        action,
                        "boot_params.insfile",
                        ConstraintKind::Format,
                        format!("'{}' is not a valid url: {}", insfile, e),
                    )
                })?;
                if url.scheme() != method.as_str() {
                    return Err(HypervisorError::invalid_parameters(
                        Family::Hmc,
                        action,
                        "boot_params.insfile",
                        ConstraintKind::Pattern,
                        format!(
                            "boot method '{}' cannot load '{}' over {}",
                            method.as_str(),
                            insfile,
                            url.scheme()
                        ),
                    ));
                }
                HmcBoot::InstallFile {
                    protocol: method.as_str(),
                    url,
                }
            }
            HmcBootMethod::None => HmcBoot::None,
        };

        if self.netsetup.is_some() && !boot.is_disk() {
            return Err(HypervisorError::invalid_parameters(
                Family::Hmc,
                action,
                "boot_params.netsetup",
                ConstraintKind::Never,
                format!("boot method '{}' cannot be combined with netsetup", method.as_str()),
            ));
        }
        if self.netboot.is_some() && self.netsetup.is_none() {
            return Err(HypervisorError::invalid_parameters(
                Family::Hmc,
                action,
                "boot_params.netsetup",
                ConstraintKind::Required,
                "netboot requires netsetup",
            ));
        }

        Ok(BootDescriptor {
            boot,
            netsetup: self.netsetup.clone(),
            netboot: self.netboot.clone(),
        })
    }
}

/// Turn an install file url into the DPM boot settings.
pub fn ftp_boot(protocol: &str, url: &Url) -> Result<PartitionBoot> {
    let host = url
        .host_str()
        .ok_or_else(|| HypervisorError::InvalidConfig(format!("Install file url '{}' has no host", url)))?;
    Ok(PartitionBoot::Ftp {
        protocol: protocol.to_string(),
        host: match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        },
        user: if url.username().is_empty() {
            "anonymous".to_string()
        } else {
            url.username().to_string()
        },
        password: url.password().unwrap_or_default().to_string(),
        insfile: url.path().to_string(),
    })
}

/// Shared processors to activate with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuAllocation {
    pub cp: u32,
    pub ifl: u32,
}

/// Split the requested processors between CPs and IFLs.
///
/// Without `cpus_cp`/`cpus_ifl` the `cpus` total is filled with IFLs first
/// and CPs after. With them, each type is checked against what the CPC has.
pub fn calculate_cpus(cpus: u32, cpus_cp: u32, cpus_ifl: u32, cpc: &CpcInfo) -> Result<CpuAllocation> {
    let diagnostic = json!({
        "requested": { "cpus": cpus, "cp": cpus_cp, "ifl": cpus_ifl },
        "available": { "cp": cpc.cpus_cp, "ifl": cpc.cpus_ifl },
    });

    if cpus_cp == 0 && cpus_ifl == 0 {
        if cpus > cpc.cpus_ifl + cpc.cpus_cp {
            return Err(HypervisorError::operation_with(
                "allocate cpus",
                format!(
                    "Not enough CPUs available in CPC. Requested: {} CPUs. Available: {} CPs, {} IFLs.",
                    cpus, cpc.cpus_cp, cpc.cpus_ifl
                ),
                diagnostic,
            ));
        }
        let ifl = cpus.min(cpc.cpus_ifl);
        return Ok(CpuAllocation { cp: cpus - ifl, ifl });
    }

    if cpus_cp > cpc.cpus_cp || cpus_ifl > cpc.cpus_ifl {
        return Err(HypervisorError::operation_with(
            "allocate cpus",
            format!(
                "Not enough CPUs available in CPC. Requested: {} CPs, {} IFLs. Available: {} CPs, {} IFLs.",
                cpus_cp, cpus_ifl, cpc.cpus_cp, cpc.cpus_ifl
            ),
            diagnostic,
        ));
    }
    Ok(CpuAllocation {
        cp: cpus_cp,
        ifl: cpus_ifl,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpc(cp: u32, ifl: u32) -> CpcInfo {
        CpcInfo {
            name: "CPC3".into(),
            dpm_enabled: false,
            cpus_cp: cp,
            cpus_ifl: ifl,
        }
    }

    #[test]
    fn test_dynamic_allocation_prefers_ifls() {
        assert_eq!(calculate_cpus(2, 0, 0, &cpc(4, 8)).unwrap(), CpuAllocation { cp: 0, ifl: 2 });
        assert_eq!(calculate_cpus(10, 0, 0, &cpc(4, 8)).unwrap(), CpuAllocation { cp: 2, ifl: 8 });
        let err = calculate_cpus(13, 0, 0, &cpc(4, 8)).unwrap_err();
        assert!(err.to_string().contains("Requested: 13 CPUs. Available: 4 CPs, 8 IFLs."));
    }

    #[test]
    fn test_static_allocation_is_checked_per_type() {
        assert_eq!(calculate_cpus(0, 1, 2, &cpc(4, 8)).unwrap(), CpuAllocation { cp: 1, ifl: 2 });
        let err = calculate_cpus(2, 5, 0, &cpc(4, 8)).unwrap_err();
        assert_eq!(err.diagnostic().unwrap()["available"]["cp"], 4);
    }

    #[test]
    fn test_scsi_prefers_storage_volume() {
        let params: BootParams = serde_json::from_value(serde_json::json!({
            "boot_method": "scsi",
            "uuid": "600507680C80063D1000000000000A2B"
        }))
        .unwrap();
        let desc = params.descriptor(Action::Start).unwrap();
        assert!(matches!(desc.boot, HmcBoot::ScsiVolume { .. }));
        assert!(!desc.is_simulated_netboot());
    }

    #[test]
    fn test_netsetup_needs_a_disk() {
        let params: BootParams = serde_json::from_value(serde_json::json!({
            "boot_method": "none",
            "netsetup": {
                "ip": "10.0.0.5", "mask": 24, "gateway": "10.0.0.1",
                "device": "f500", "password": "secret"
            }
        }))
        .unwrap();
        let err = params.descriptor(Action::Start).unwrap_err();
        assert!(err.report().unwrap().mentions("boot_params.netsetup"));
    }

    #[test]
    fn test_ftp_boot_from_url() {
        let url = Url::parse("sftp://install:pw@repo.example.com:2222/distro/generic.ins").unwrap();
        match ftp_boot("sftp", &url).unwrap() {
            PartitionBoot::Ftp { host, user, password, insfile, .. } => {
                assert_eq!(host, "repo.example.com:2222");
                assert_eq!(user, "install");
                assert_eq!(password, "pw");
                assert_eq!(insfile, "/distro/generic.ins");
            }
            other => panic!("unexpected boot {other:?}"),
        }
    }

    #[test]
    fn test_install_file_protocol_follows_boot_method() {
        let params: BootParams = serde_json::from_value(serde_json::json!({
            "boot_method": "ftps",
            "insfile": "ftps://repo.example.com/distro/generic.ins"
        }))
        .unwrap();
        match params.descriptor(Action::Start).unwrap().boot {
            HmcBoot::InstallFile { protocol, .. } => assert_eq!(protocol, "ftps"),
            other => panic!("unexpected boot {other:?}"),
        }

        let params: BootParams = serde_json::from_value(serde_json::json!({
            "boot_method": "sftp",
            "insfile": "http://repo.example.com/x.ins"
        }))
        .unwrap();
        let err = params.descriptor(Action::Start).unwrap_err();
        assert!(err
            .report()
            .unwrap()
            .find("boot_params.insfile", ConstraintKind::Pattern)
            .is_some());
    }
}
