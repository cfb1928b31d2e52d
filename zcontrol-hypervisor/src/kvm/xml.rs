//! Domain XML generation for s390x guests.
//!
//! Disks and interfaces either come with a pre-rendered libvirt element in
//! the parameters or get one generated here. Generated elements receive the
//! next free virtio target name (`vda`, `vdb`, ...) and CCW device number
//! (`0x0001`, ...), skipping whatever the pre-rendered ones already use.

use std::collections::BTreeSet;

use regex::Regex;
use uuid::Uuid;

use crate::error::{HypervisorError, Result};

/// Highest CCW device number libvirt accepts for a virtio device.
const LAST_DEVNO: u32 = 0xfffe;

fn target_dev_re() -> Result<Regex> {
    Regex::new(r#"<target\s[^>]*dev=['"]([^'"]+)['"]"#)
        .map_err(|e| HypervisorError::Internal(e.to_string()))
}

fn devno_re() -> Result<Regex> {
    Regex::new(r#"<address\s[^>]*devno=['"]([^'"]+)['"]"#)
        .map_err(|e| HypervisorError::Internal(e.to_string()))
}

/// Escape text for use inside an element or a quoted attribute.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            other => out.push(other),
        }
    }
    out
}

/// Virtio target name for index `n`: `vda`..`vdz`, `vdaa`, ...
fn dev_name(mut n: usize) -> String {
    let mut letters = Vec::new();
    loop {
        letters.push((b'a' + (n % 26) as u8) as char);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    letters.reverse();
    format!("vd{}", letters.into_iter().collect::<String>())
}

/// Hands out guest-side target names and device numbers.
#[derive(Debug, Default)]
pub struct TargetDevices {
    used_devs: BTreeSet<String>,
    used_devnos: BTreeSet<String>,
    next_dev: usize,
    next_devno: u32,
}

impl TargetDevices {
    pub fn new() -> Self {
        Self {
            next_devno: 1,
            ..Default::default()
        }
    }

    /// Reserve the target name of a pre-rendered `<disk>` element.
    pub fn reserve_dev(&mut self, xml: &str) -> Result<String> {
        let re = target_dev_re()?;
        let dev = re
            .captures(xml)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| HypervisorError::InvalidConfig(format!("No target device in libvirt xml: {}", xml)))?;
        let valid = dev.len() >= 3
            && dev.len() <= 5
            && dev.starts_with("vd")
            && dev[2..].chars().all(|c| c.is_ascii_lowercase());
        if !valid {
            return Err(HypervisorError::InvalidConfig(format!(
                "Invalid target device name '{}' in libvirt xml",
                dev
            )));
        }
        if !self.used_devs.insert(dev.clone()) {
            return Err(HypervisorError::InvalidConfig(format!("Target device {} defined twice", dev)));
        }
        Ok(dev)
    }

    /// Reserve the CCW device number of a pre-rendered element.
    pub fn reserve_devno(&mut self, xml: &str) -> Result<String> {
        let re = devno_re()?;
        let devno = re
            .captures(xml)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| HypervisorError::InvalidConfig(format!("No device address in libvirt xml: {}", xml)))?;
        let valid = devno.len() == 6
            && devno.starts_with("0x")
            && devno[2..].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase());
        if !valid {
            return Err(HypervisorError::InvalidConfig(format!(
                "Invalid device number '{}' in libvirt xml",
                devno
            )));
        }
        if !self.used_devnos.insert(devno.clone()) {
            return Err(HypervisorError::InvalidConfig(format!("Device number {} defined twice", devno)));
        }
        Ok(devno)
    }

    pub fn next_dev(&mut self) -> String {
        loop {
            let dev = dev_name(self.next_dev);
            self.next_dev += 1;
            if self.used_devs.insert(dev.clone()) {
                return dev;
            }
        }
    }

    pub fn next_devno(&mut self) -> Result<String> {
        while self.next_devno <= LAST_DEVNO {
            let devno = format!("0x{:04x}", self.next_devno);
            self.next_devno += 1;
            if self.used_devnos.insert(devno.clone()) {
                return Ok(devno);
            }
        }
        Err(HypervisorError::InvalidConfig("No more device numbers available".to_string()))
    }
}

/// A block device on the host handed to the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainDisk {
    /// Element given in the parameters, used verbatim.
    Rendered(String),
    Generated {
        source: String,
        target_dev: String,
        devno: String,
        boot: bool,
    },
}

impl DomainDisk {
    pub fn to_xml(&self) -> String {
        match self {
            DomainDisk::Rendered(xml) => format!("    {}\n", xml.trim()),
            DomainDisk::Generated {
                source,
                target_dev,
                devno,
                boot,
            } => format!(
                r#"    <disk type='block' device='disk'>
      <driver name='qemu' type='raw' cache='none' io='native'/>
      <source dev='{}'/>
      <target dev='{}' bus='virtio'/>
      <address type='ccw' cssid='0xfe' ssid='0x0' devno='{}'/>
{}    </disk>
"#,
                escape(source),
                target_dev,
                devno,
                if *boot { "      <boot order='1'/>\n" } else { "" }
            ),
        }
    }
}

/// A macvtap network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainIface {
    Rendered(String),
    Generated {
        host_iface: String,
        mac_address: Option<String>,
        devno: String,
    },
}

impl DomainIface {
    pub fn to_xml(&self) -> String {
        match self {
            DomainIface::Rendered(xml) => format!("    {}\n", xml.trim()),
            DomainIface::Generated {
                host_iface,
                mac_address,
                devno,
            } => {
                let mac = mac_address
                    .as_ref()
                    .map(|m| format!("      <mac address='{}'/>\n", escape(m)))
                    .unwrap_or_default();
                format!(
                    r#"    <interface type='direct'>
      <source dev='{}' mode='bridge'/>
{}      <model type='virtio'/>
      <address type='ccw' cssid='0xfe' ssid='0x0' devno='{}'/>
    </interface>
"#,
                    escape(host_iface),
                    mac,
                    devno
                )
            }
        }
    }
}

/// Kernel, initrd and command line loaded directly by QEMU.
#[derive(Debug, Clone, Copy)]
pub struct DirectKernel<'a> {
    pub kernel: &'a str,
    pub initrd: Option<&'a str>,
    pub cmdline: Option<&'a str>,
}

/// Builder for libvirt domain XML.
pub struct DomainXmlBuilder<'a> {
    name: &'a str,
    uuid: Uuid,
    cpu: u32,
    memory_mib: u64,
    disks: &'a [DomainDisk],
    ifaces: &'a [DomainIface],
}

impl<'a> DomainXmlBuilder<'a> {
    /// A fresh UUID is generated; the temporary netboot definition and the
    /// final one must share it, so build both from the same builder.
    pub fn new(name: &'a str, cpu: u32, memory_mib: u64, disks: &'a [DomainDisk], ifaces: &'a [DomainIface]) -> Self {
        Self {
            name,
            uuid: Uuid::new_v4(),
            cpu,
            memory_mib,
            disks,
            ifaces,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Final definition, booting from the disk marked as boot device.
    pub fn build(&self) -> String {
        self.render(None)
    }

    /// Temporary definition for a network boot.
    pub fn build_with_kernel(&self, kernel: DirectKernel<'_>) -> String {
        self.render(Some(kernel))
    }

    fn render(&self, kernel: Option<DirectKernel<'_>>) -> String {
        let mut xml = String::new();

        xml.push_str(&format!(
            r#"<domain type='kvm'>
  <name>{}</name>
  <uuid>{}</uuid>
  <memory unit='MiB'>{}</memory>
  <currentMemory unit='MiB'>{}</currentMemory>
  <vcpu placement='static'>{}</vcpu>
"#,
            escape(self.name),
            self.uuid,
            self.memory_mib,
            self.memory_mib,
            self.cpu
        ));

        xml.push_str(&self.build_os_section(kernel));
        xml.push_str("  <cpu mode='host-model'/>\n");
        xml.push_str(
            r#"  <on_poweroff>destroy</on_poweroff>
  <on_reboot>restart</on_reboot>
  <on_crash>preserve</on_crash>
"#,
        );

        xml.push_str("  <devices>\n");
        xml.push_str("    <emulator>/usr/bin/qemu-system-s390x</emulator>\n");
        for disk in self.disks {
            xml.push_str(&disk.to_xml());
        }
        for iface in self.ifaces {
            xml.push_str(&iface.to_xml());
        }
        xml.push_str(
            r#"    <console type='pty'>
      <target type='sclp' port='0'/>
    </console>
    <memballoon model='none'/>
"#,
        );
        xml.push_str("  </devices>\n");

        xml.push_str("</domain>\n");
        xml
    }

    fn build_os_section(&self, kernel: Option<DirectKernel<'_>>) -> String {
        let mut xml = String::from("  <os>\n    <type arch='s390x' machine='s390-ccw-virtio'>hvm</type>\n");
        if let Some(kernel) = kernel {
            xml.push_str(&format!("    <kernel>{}</kernel>\n", escape(kernel.kernel)));
            if let Some(initrd) = kernel.initrd {
                xml.push_str(&format!("    <initrd>{}</initrd>\n", escape(initrd)));
            }
            if let Some(cmdline) = kernel.cmdline {
                xml.push_str(&format!("    <cmdline>{}</cmdline>\n", escape(cmdline)));
            }
        }
        xml.push_str("  </os>\n");
        xml
    }
}
