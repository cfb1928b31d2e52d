//! Shell command generation for the rescue system.

use serde_json::Value;

use crate::error::{HypervisorError, Result};
use crate::transport::shell_quote;
use crate::types::{short_devno, NetDeviceType, NetSetup};

/// Commands that configure networking on a freshly IPLed rescue system.
///
/// The interface name is discovered at runtime and exported as
/// `$IFACE_NAME`; every later command refers to it.
pub fn network_commands(setup: &NetSetup) -> Result<Vec<String>> {
    let mut cmds = Vec::new();

    match setup.device_type {
        NetDeviceType::Pci => {
            cmds.push(format!(
                "DEV_PATH=$(dirname $(grep -m1 -r '0x0*{}' --include function_id /sys/bus/pci/devices/*))",
                setup.device.to_lowercase()
            ));
            cmds.push("export IFACE_NAME=$(ls -1 ${DEV_PATH}/net | head -1)".to_string());
        }
        NetDeviceType::Osa => {
            let channels = osa_channels(&setup.device)?;
            let layer2 = layer2_enabled(setup.options.get("layer2"));

            // layer2 always goes first
            let mut options = format!("-o layer2={}", u8::from(layer2));
            for (key, value) in setup.options.iter().filter(|(k, _)| k.as_str() != "layer2") {
                options.push_str(&format!(" -o {}={}", key, option_value(value)));
            }

            cmds.push(format!("cio_ignore -r {}", channels.join(",")));
            cmds.push(format!("znetconf -a {} {}", channels[0], options));
            cmds.push(format!(
                "export IFACE_NAME=$(ls -1 /sys/devices/qeth/0.0.{}/net | head -1)",
                channels[0]
            ));
            if layer2 {
                if let Some(mac) = &setup.mac {
                    cmds.push(format!("ifconfig $IFACE_NAME hw ether {}", mac));
                }
            }
        }
    }

    if let Some(vlan) = setup.vlan {
        cmds.push("ip link set $IFACE_NAME up".to_string());
        cmds.push(format!(
            "ip link add link $IFACE_NAME name $IFACE_NAME.{vlan} type vlan id {vlan}",
            vlan = vlan
        ));
        cmds.push(format!("export IFACE_NAME=$IFACE_NAME.{}", vlan));
    }

    if setup.is_ipv6() {
        let prefix = setup.mask.prefix_len().ok_or_else(|| {
            HypervisorError::InvalidConfig(format!("Invalid IPv6 prefix length {:?}", setup.mask))
        })?;
        cmds.push(format!("ifconfig $IFACE_NAME inet6 add {}/{}", setup.ip, prefix));
        cmds.push("ifconfig $IFACE_NAME up".to_string());
        cmds.push(format!("route -A inet6 add default gw {}", setup.gateway));
    } else {
        let mask = setup.mask.dotted().ok_or_else(|| {
            HypervisorError::InvalidConfig(format!("Invalid IPv4 network mask {:?}", setup.mask))
        })?;
        cmds.push(format!("ifconfig $IFACE_NAME {} netmask {}", setup.ip, mask));
        cmds.push(format!("route add default gw {}", setup.gateway));
    }

    if !setup.dns.is_empty() {
        cmds.push("echo > /etc/resolv.conf".to_string());
        for server in &setup.dns {
            cmds.push(format!("echo 'nameserver {}' >> /etc/resolv.conf", server));
        }
    }

    Ok(cmds)
}

/// Expand an OSA device into its read/write/data channel triplet.
///
/// A single channel `f500` becomes `f500,f501,f502`; an explicit list is
/// kept as given.
pub fn osa_channels(device: &str) -> Result<Vec<String>> {
    let listed: Vec<String> = device
        .split(',')
        .map(|ch| short_devno(ch.trim()).to_lowercase())
        .filter(|ch| !ch.is_empty())
        .collect();

    match listed.as_slice() {
        [] => Err(HypervisorError::InvalidConfig("Empty OSA device".to_string())),
        [single] => {
            let base = u16::from_str_radix(single, 16).map_err(|_| {
                HypervisorError::InvalidConfig(format!("Invalid OSA channel '{}'", device))
            })?;
            (0..3u16)
                .map(|offset| {
                    base.checked_add(offset).map(|ch| format!("{:04x}", ch)).ok_or_else(|| {
                        HypervisorError::InvalidConfig(format!(
                            "OSA channel triplet starting at '{}' runs past ffff",
                            device
                        ))
                    })
                })
                .collect()
        }
        _ => Ok(listed),
    }
}

fn layer2_enabled(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(n)) => n.as_u64() == Some(1),
        Some(Value::String(s)) => matches!(s.to_lowercase().as_str(), "true" | "1"),
        _ => false,
    }
}

fn option_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Split commands into console sized pieces.
///
/// The console accepts a limited number of characters per submission, so
/// long commands are cut every `chunk` characters and each piece but the
/// last gets a `\` line continuation appended. Commands are chained with `&&` and the sequence ends with
/// a gateway ping, which also primes the ARP caches along the path.
pub fn console_chunks(cmds: &[String], gateway: &str, chunk: usize) -> Vec<String> {
    let width = chunk.max(1);
    let mut out = Vec::new();
    for cmd in cmds {
        let chars: Vec<char> = cmd.chars().collect();
        let mut pieces = chars.chunks(width).peekable();
        while let Some(piece) = pieces.next() {
            let text: String = piece.iter().collect();
            if pieces.peek().is_some() {
                out.push(format!("{}\\", text));
            } else {
                out.push(format!("{} && ", text));
            }
        }
    }
    out.push(format!("true; ping -c 1 {}", gateway));
    out
}

/// Download `url` to `path` on the target.
pub fn fetch_command(url: &str, path: &str) -> String {
    format!(
        "curl --silent --show-error --fail --location --output {} {}",
        path,
        shell_quote(url)
    )
}

/// Replace the running kernel. The shell dies with it, so the command is
/// detached and sshd is killed first to drop the connection cleanly.
pub fn kexec_command(kernel: &str, initrd: Option<&str>, cmdline: Option<&str>) -> String {
    let mut kexec = format!("nohup kexec {}", kernel);
    if let Some(initrd) = initrd {
        kexec.push_str(&format!(" --initrd={}", initrd));
    }
    if let Some(cmdline) = cmdline {
        kexec.push_str(&format!(" --command-line={}", shell_quote(cmdline)));
    }
    kexec.push_str(" &>/tmp/kexec.log");
    format!("killall -9 sshd; {}", kexec)
}
