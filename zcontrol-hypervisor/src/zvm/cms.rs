//! CP and CMS command sequences run on a z/VM terminal.

use std::io::Write;
use std::time::Duration;

use regex::Regex;
use serde_json::json;
use tracing::{debug, info};
use url::Url;

use super::terminal::{CpTerminal, Matched, CP_ERROR_PATTERN};
use crate::error::{HypervisorError, Result};
use crate::types::{short_devno, Iface, NetBoot, StorageVolume};

const NETBOOT_KERNEL_FILE: &str = "KERNEL IMG T";
const NETBOOT_INITRD_FILE: &str = "INITRD IMG T";
const NETBOOT_CMDLINE_FILE: &str = "PARMFILE PARM T";
const NETBOOT_VDISK: &str = "ffff";

const READY: &str = r"Ready;";
const READY_WITH_RC: &str = r"Ready\(\d+\);";

const QUERY_TIMEOUT: Duration = Duration::from_secs(10);
const ATTACH_TIMEOUT: Duration = Duration::from_secs(30);
const PUNCH_TIMEOUT: Duration = Duration::from_secs(300);
const DISK_IPL_TIMEOUT: Duration = Duration::from_secs(180);
const READER_IPL_TIMEOUT: Duration = Duration::from_secs(600);

fn patterns(list: &[&str]) -> Result<Vec<Regex>> {
    list.iter()
        .map(|p| {
            Regex::new(p).map_err(|e| HypervisorError::Internal(format!("Bad terminal pattern '{}': {}", p, e)))
        })
        .collect()
}

/// Split `value` in groups of `size` characters separated by spaces, the
/// form CP expects for port names and LUNs.
pub fn split_chars(value: &str, size: usize) -> String {
    let chars: Vec<char> = value.chars().collect();
    chars
        .chunks(size.max(1))
        .map(|chunk| chunk.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join(" ")
}

fn unexpected(operation: &str, command: &str, output: &str) -> HypervisorError {
    HypervisorError::operation_with(
        operation,
        format!("'{}' returned unexpected output", command),
        json!({ "command": command, "output": output }),
    )
}

fn cp_error(operation: &str, command: &str, matched: &Matched) -> HypervisorError {
    HypervisorError::operation_with(
        operation,
        format!("'{}' failed with: {}", command, matched.text),
        json!({ "command": command, "message": matched.text }),
    )
}

/// Command runner bound to the terminal of one z/VM guest.
pub(crate) struct Cms<'a> {
    terminal: &'a mut dyn CpTerminal,
    guest: &'a str,
    transfer_timeout: Duration,
}

impl<'a> Cms<'a> {
    pub(crate) fn new(terminal: &'a mut dyn CpTerminal, guest: &'a str, transfer_timeout: Duration) -> Self {
        Self {
            terminal,
            guest,
            transfer_timeout,
        }
    }

    /// Send `command` and return the output plus the pattern that matched.
    async fn expect(
        &mut self,
        operation: &str,
        command: &str,
        use_cp: bool,
        wait_for: &[&str],
        timeout: Duration,
    ) -> Result<(String, Matched)> {
        debug!(command = %command, "Sending terminal command");
        let reply = self
            .terminal
            .send_cmd(command, use_cp, &patterns(wait_for)?, timeout)
            .await?;
        match reply.matched {
            Some(matched) => Ok((reply.output, matched)),
            None => Err(unexpected(operation, command, &reply.output)),
        }
    }

    /// Like [`Self::expect`], but running out of time is a timeout.
    async fn wait_boot(&mut self, stage: &str, command: &str, marker: &str, timeout: Duration) -> Result<()> {
        let reply = self
            .terminal
            .send_cmd(command, false, &patterns(&[marker])?, timeout)
            .await?;
        if reply.matched.is_none() {
            return Err(HypervisorError::timeout(stage, timeout));
        }
        Ok(())
    }

    // =========================================================================
    // CMS
    // =========================================================================

    /// IPL CMS without running the profile.
    pub(crate) async fn ipl_cms(&mut self) -> Result<()> {
        self.expect("ipl cms", r"i cms\naccess (noprof", true, &[READY], QUERY_TIMEOUT)
            .await?;
        self.terminal
            .send_cmd("term more 50 10", true, &[], Duration::from_secs(5))
            .await?;
        Ok(())
    }

    /// `system clear` and log the guest off.
    pub(crate) async fn stop(&mut self) -> Result<()> {
        info!(guest = %self.guest, "Stopping guest");
        self.terminal
            .send_cmd("system clear", true, &[], Duration::from_secs(5))
            .await?;
        self.terminal.logoff().await
    }

    // =========================================================================
    // Resources
    // =========================================================================

    /// Remove every CPU except the base one.
    pub(crate) async fn detach_cpus(&mut self) -> Result<()> {
        let command = "detach cpu all";
        let (_, matched) = self
            .expect(
                "detach cpus",
                command,
                true,
                &[r"(?i)storage cleared - system reset", CP_ERROR_PATTERN],
                QUERY_TIMEOUT,
            )
            .await?;
        // HCPCPU1456E: there was no CPU to detach.
        if matched.index != 0 && !matched.text.starts_with("HCPCPU1456E") {
            return Err(cp_error("detach cpus", command, &matched));
        }
        Ok(())
    }

    pub(crate) async fn define_storage(&mut self, memory_mb: u64) -> Result<()> {
        let command = format!("define storage {}M", memory_mb);
        let (_, matched) = self
            .expect("define storage", &command, true, &[r"STORAGE = \d+", CP_ERROR_PATTERN], QUERY_TIMEOUT)
            .await?;
        if matched.index != 0 {
            return Err(cp_error("define storage", &command, &matched));
        }
        Ok(())
    }

    /// Define `cpus` CPUs after the last one the guest has.
    pub(crate) async fn attach_cpus(&mut self, cpus: u32) -> Result<()> {
        let cpu_msg = r"(?i) CPU ([0-9A-Fa-f]+)";
        let (output, matched) = self
            .expect("query cpus", "q v cpus", false, &[CP_ERROR_PATTERN, cpu_msg], QUERY_TIMEOUT)
            .await?;
        if matched.index == 0 {
            return Err(cp_error("query cpus", "q v cpus", &matched));
        }

        let cpu_re = Regex::new(cpu_msg).map_err(|e| HypervisorError::Internal(e.to_string()))?;
        let last_cpu = output
            .lines()
            .filter_map(|line| cpu_re.captures(line))
            .filter_map(|caps| u32::from_str_radix(&caps[1], 16).ok())
            .last()
            .ok_or_else(|| unexpected("query cpus", "q v cpus", &output))?;
        debug!(last_cpu, "Detected guest CPUs");

        let mut command = format!("define cpu {:x}", last_cpu + 1);
        if cpus > 1 {
            command.push_str(&format!("-{:x}", last_cpu + cpus));
        }
        let (_, matched) = self
            .expect(
                "define cpus",
                &command,
                false,
                &[r"(?i)cpu [0-9A-Fa-f]+ defined", CP_ERROR_PATTERN],
                QUERY_TIMEOUT,
            )
            .await?;
        if matched.index != 0 {
            return Err(cp_error("define cpus", &command, &matched));
        }
        Ok(())
    }

    /// Attach a CCW device or PCI function unless the guest already has it.
    pub(crate) async fn attach_device(&mut self, id: &str, pci: bool) -> Result<()> {
        let (query, present) = if pci {
            (format!("q v pcif {}", id), format!("(?i) PCIF 0*{} ON ", id))
        } else {
            (format!("q v {}", id), format!("(?i) {} ON ", id))
        };
        let mut wait_for = vec![CP_ERROR_PATTERN];
        if pci {
            wait_for.push("(?i) A PCI function was not found");
        }
        wait_for.push(present.as_str());

        let (_, matched) = self
            .expect("query device", &query, false, &wait_for, QUERY_TIMEOUT)
            .await?;
        if matched.index == wait_for.len() - 1 {
            info!(device = %id, "Device already defined, skipping attach");
            return Ok(());
        }

        let command = if pci {
            format!("att pcif {} *", id)
        } else {
            format!("att {} *", id)
        };
        let attached = format!("(?i){} attached to {}", id, self.guest);
        let already = format!("(?i){} already attached to {}", id, self.guest);
        let (_, matched) = self
            .expect(
                "attach device",
                &command,
                false,
                &[attached.as_str(), already.as_str(), CP_ERROR_PATTERN],
                ATTACH_TIMEOUT,
            )
            .await?;
        if matched.index == 2 {
            return Err(cp_error("attach device", &command, &matched));
        }
        Ok(())
    }

    /// Define a virtual NIC and couple it to `system`.
    pub(crate) async fn define_nic(&mut self, address: &str, kind: &str, count: u32, system: &str) -> Result<()> {
        let command = format!("define nic {} {} devices {}", address, kind, count);
        let defined = format!(r"(?i)NIC {0} is created; devices {0}-.+ defined", address);
        let (_, matched) = self
            .expect("define nic", &command, false, &[defined.as_str(), CP_ERROR_PATTERN], QUERY_TIMEOUT)
            .await?;
        if matched.index != 0 {
            return Err(cp_error("define nic", &command, &matched));
        }

        let command = format!("couple {} to SYSTEM {}", address, system);
        let coupled = format!(r"(?i)NIC {} is connected to SYSTEM", address);
        let (_, matched) = self
            .expect("couple nic", &command, false, &[coupled.as_str(), CP_ERROR_PATTERN], QUERY_TIMEOUT)
            .await?;
        if matched.index != 0 {
            return Err(cp_error("couple nic", &command, &matched));
        }
        Ok(())
    }

    pub(crate) async fn attach_iface(&mut self, iface: &Iface) -> Result<()> {
        match iface {
            Iface::Osa { id } | Iface::Hsi { id } => {
                for channel in id.split(',') {
                    self.attach_device(short_devno(channel.trim()), false).await?;
                }
                Ok(())
            }
            Iface::Pci { id } => self.attach_device(id, true).await,
            Iface::Qdio { id, count, system } => self.define_nic(id, "qdio", *count, system).await,
            Iface::Hipers { id, count, system } => self.define_nic(id, "hipers", *count, system).await,
            Iface::Macvtap { .. } => Err(HypervisorError::NotSupported(
                "macvtap interfaces are only available on KVM".to_string(),
            )),
        }
    }

    /// Attach additional CPUs, disks and network interfaces.
    pub(crate) async fn hotplug(&mut self, cpus: u32, volumes: &[StorageVolume], ifaces: &[Iface]) -> Result<()> {
        if cpus > 0 {
            self.attach_cpus(cpus).await?;
        }
        for volume in volumes {
            match volume {
                StorageVolume::Dasd { devno, .. } => self.attach_device(short_devno(devno), false).await?,
                StorageVolume::Fcp { adapters, .. } => {
                    for adapter in adapters {
                        self.attach_device(short_devno(&adapter.devno), false).await?;
                    }
                }
            }
        }
        for iface in ifaces {
            self.attach_iface(iface).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Boot
    // =========================================================================

    /// Point the SCSI load device at `wwpn`/`lun` and check CP took it.
    pub(crate) async fn set_loaddev(&mut self, wwpn: &str, lun: &str) -> Result<()> {
        let port = split_chars(wwpn, 8);
        let lun = split_chars(lun, 8);
        let command = format!("set loaddev portname {} lun {}", port, lun);
        self.terminal
            .send_cmd(&command, false, &[], Duration::from_secs(5))
            .await?;

        let loaddev = format!(r"(?i)portname  *{}  * lun  *{}", port, lun);
        let (_, matched) = self
            .expect("query loaddev", "q loaddev", false, &[loaddev.as_str(), CP_ERROR_PATTERN], QUERY_TIMEOUT)
            .await?;
        if matched.index != 0 {
            return Err(cp_error("query loaddev", "q loaddev", &matched));
        }
        Ok(())
    }

    /// IPL from `devno` and wait for the login prompt of the booted system.
    pub(crate) async fn ipl_disk(&mut self, devno: &str) -> Result<()> {
        info!(devno = %devno, "IPLing disk");
        self.wait_boot("disk IPL", &format!("i {}", devno), "login: ", DISK_IPL_TIMEOUT)
            .await
    }

    /// Copy a file onto the guest's minidisks.
    pub(crate) async fn push_file(&mut self, source: &str, target: &str) -> Result<()> {
        let url = Url::parse(source)
            .map_err(|e| HypervisorError::InvalidConfig(format!("Invalid source url '{}': {}", source, e)))?;
        match url.scheme() {
            "file" => {
                let exists = url.to_file_path().map(|p| p.exists()).unwrap_or(false);
                if !exists {
                    return Err(HypervisorError::InvalidConfig(format!(
                        "Local file '{}' does not exist",
                        url.path()
                    )));
                }
            }
            "http" | "https" | "ftp" => {}
            other => {
                return Err(HypervisorError::InvalidConfig(format!(
                    "Invalid url scheme '{}' for push operation",
                    other
                )))
            }
        }
        info!(source = %source, target = %target, "Transferring file to guest");
        self.terminal.transfer(&url, target, self.transfer_timeout).await
    }

    /// Prepare a scratch v-disk for the netboot files.
    async fn prepare_vdisk(&mut self) -> Result<()> {
        let query = format!("q v {}", NETBOOT_VDISK);
        let exists = format!("(?i) {} ON ", NETBOOT_VDISK);
        let (_, matched) = self
            .expect("query vdisk", &query, false, &[CP_ERROR_PATTERN, exists.as_str()], QUERY_TIMEOUT)
            .await?;
        if matched.index == 1 {
            let command = format!("detach {}", NETBOOT_VDISK);
            let detached = format!("(?i){} detached", NETBOOT_VDISK);
            let (_, matched) = self
                .expect("detach vdisk", &command, false, &[CP_ERROR_PATTERN, detached.as_str()], QUERY_TIMEOUT)
                .await?;
            if matched.index == 0 {
                return Err(cp_error("detach vdisk", &command, &matched));
            }
        }

        let command = format!("define vfb-512 as {} blk 200000", NETBOOT_VDISK);
        let defined = format!("(?i){} defined", NETBOOT_VDISK);
        let (_, matched) = self
            .expect("define vdisk", &command, false, &[CP_ERROR_PATTERN, defined.as_str()], QUERY_TIMEOUT)
            .await?;
        if matched.index == 0 {
            return Err(cp_error("define vdisk", &command, &matched));
        }

        self.expect(
            "format vdisk",
            &format!(r"format {} t\n1\ntmpdsk", NETBOOT_VDISK),
            false,
            &[r"(?i)Ready;"],
            QUERY_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    /// Boot `netboot` through the virtual reader.
    pub(crate) async fn netboot(&mut self, netboot: &NetBoot) -> Result<()> {
        self.ipl_cms().await?;
        self.prepare_vdisk().await?;

        self.push_file(&netboot.kernel_url, NETBOOT_KERNEL_FILE).await?;
        if let Some(initrd) = &netboot.initrd_url {
            self.push_file(initrd, NETBOOT_INITRD_FILE).await?;
        }

        let mut parmfile = tempfile::NamedTempFile::new()
            .map_err(|e| HypervisorError::Internal(format!("Failed to create parmfile: {}", e)))?;
        parmfile
            .write_all(netboot.cmdline.as_deref().unwrap_or_default().as_bytes())
            .and_then(|_| parmfile.flush())
            .map_err(|e| HypervisorError::Internal(format!("Failed to write parmfile: {}", e)))?;
        let parm_url = Url::from_file_path(parmfile.path())
            .map_err(|_| HypervisorError::Internal("Parmfile path is not absolute".to_string()))?;
        self.push_file(parm_url.as_str(), NETBOOT_CMDLINE_FILE).await?;

        let mut commands = vec![
            "spool punch * rdr".to_string(),
            "close reader".to_string(),
            "purge reader all".to_string(),
            format!("punch {} (noh", NETBOOT_KERNEL_FILE),
            format!("punch {} (noh", NETBOOT_CMDLINE_FILE),
        ];
        if netboot.initrd_url.is_some() {
            commands.push(format!("punch {} (noh", NETBOOT_INITRD_FILE));
        }
        commands.push("change reader all keep".to_string());
        commands.push("spool pun off".to_string());

        for command in &commands {
            let (_, matched) = self
                .expect("punch reader", command, false, &[READY, READY_WITH_RC], PUNCH_TIMEOUT)
                .await?;
            if matched.index == 1 {
                return Err(cp_error("punch reader", command, &matched));
            }
        }

        info!("IPLing kernel from reader");
        self.wait_boot("reader IPL", "ipl 00c clear", "Kernel command line: ", READER_IPL_TIMEOUT)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTerminal;
    use crate::types::FcpAdapter;

    #[test]
    fn test_split_chars() {
        assert_eq!(split_chars("500507630b1b4a12", 8), "50050763 0b1b4a12");
        assert_eq!(split_chars("abc", 8), "abc");
        assert_eq!(split_chars("", 8), "");
    }

    #[tokio::test]
    async fn test_hotplug_defines_cpus_after_last_one() {
        let mut terminal = MockTerminal::new("LINUX01").with_cpus(&[0, 1]);
        let mut cms = Cms::new(&mut terminal, "LINUX01", Duration::from_secs(1));
        cms.hotplug(3, &[], &[]).await.unwrap();
        assert!(terminal.commands().contains(&"define cpu 2-4".to_string()));
    }

    #[tokio::test]
    async fn test_hotplug_attaches_volumes_and_nics() {
        let mut terminal = MockTerminal::new("LINUX01").with_attached("f500");
        let volumes = vec![
            StorageVolume::Dasd { devno: "0.0.3a2c".into(), boot_device: true, libvirt: None },
            StorageVolume::Fcp {
                lun: "4010400200000000".into(),
                adapters: vec![FcpAdapter { devno: "0.0.1800".into(), wwpns: vec!["500507630b1b4a12".into()] }],
                multipath: false,
                boot_device: false,
                libvirt: None,
            },
        ];
        let ifaces = vec![
            Iface::Osa { id: "f500,f501,f502".into() },
            Iface::Qdio { id: "f5a0".into(), count: 3, system: "VSW1".into() },
        ];
        let mut cms = Cms::new(&mut terminal, "LINUX01", Duration::from_secs(1));
        cms.hotplug(0, &volumes, &ifaces).await.unwrap();

        let commands = terminal.commands();
        assert!(commands.contains(&"att 3a2c *".to_string()));
        assert!(commands.contains(&"att 1800 *".to_string()));
        // f500 is already there
        assert!(!commands.contains(&"att f500 *".to_string()));
        assert!(commands.contains(&"att f502 *".to_string()));
        assert!(commands.contains(&"couple f5a0 to SYSTEM VSW1".to_string()));
        assert!(!commands.iter().any(|c| c.starts_with("define cpu")));
    }

    #[tokio::test]
    async fn test_attach_failure_carries_cp_message() {
        let mut terminal = MockTerminal::new("LINUX01")
            .respond("att 3a2c *", "HCPATR040E Device 3A2C does not exist");
        let mut cms = Cms::new(&mut terminal, "LINUX01", Duration::from_secs(1));
        let err = cms.attach_device("3a2c", false).await.unwrap_err();
        assert_eq!(
            err.diagnostic().unwrap()["message"],
            "HCPATR040E Device 3A2C does not exist"
        );
    }

    #[tokio::test]
    async fn test_missing_login_prompt_is_a_timeout() {
        let mut terminal = MockTerminal::new("LINUX01").respond("i 3a2c", "HCPGIR450W CP entered; disabled wait PSW");
        let mut cms = Cms::new(&mut terminal, "LINUX01", Duration::from_secs(1));
        let err = cms.ipl_disk("3a2c").await.unwrap_err();
        assert!(matches!(err, HypervisorError::Timeout { ref stage, .. } if stage == "disk IPL"));
    }

    #[tokio::test]
    async fn test_reader_netboot_sequence() {
        let mut terminal = MockTerminal::new("LINUX01");
        let netboot = NetBoot {
            kernel_url: "http://images.example.com/kernel.img".into(),
            initrd_url: None,
            cmdline: Some("root=/dev/ram0".into()),
        };
        let mut cms = Cms::new(&mut terminal, "LINUX01", Duration::from_secs(1));
        cms.netboot(&netboot).await.unwrap();

        let commands = terminal.commands();
        let kernel = commands.iter().position(|c| c == "punch KERNEL IMG T (noh").unwrap();
        let parm = commands.iter().position(|c| c == "punch PARMFILE PARM T (noh").unwrap();
        assert!(kernel < parm);
        assert!(!commands.iter().any(|c| c.contains("INITRD")));
        assert_eq!(commands.last().map(String::as_str), Some("ipl 00c clear"));
        assert_eq!(terminal.transfers().len(), 2);
        assert_eq!(terminal.transfers()[0].1, "KERNEL IMG T");
    }

    #[tokio::test]
    async fn test_push_file_rejects_unknown_scheme() {
        let mut terminal = MockTerminal::new("LINUX01");
        let mut cms = Cms::new(&mut terminal, "LINUX01", Duration::from_secs(1));
        let err = cms.push_file("scp://host/kernel", "KERNEL IMG T").await.unwrap_err();
        assert!(matches!(err, HypervisorError::InvalidConfig(_)));
    }
}
