//! Bringing DASD and FCP disks online on the KVM host.

use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::{HypervisorError, Result};
use crate::retry::{Attempts, RetryPolicy};
use crate::transport::{shell_quote, ShellSession};
use crate::types::{full_devno, short_devno, FcpAdapter};

pub const DASD_DEVPATH: &str = "/dev/disk/by-path/ccw-";
pub const FCP_SYSPATH: &str = "/sys/bus/ccw/drivers/zfcp";

/// udev path of one FCP path to a LUN.
pub fn fcp_device_path(devno: &str, wwpn: &str, lun: &str) -> String {
    format!("/dev/disk/by-path/ccw-{}-zfcp-{}:{}", full_devno(devno), hex_id(wwpn), hex_id(lun))
}

fn hex_id(value: &str) -> String {
    let value = value.to_lowercase();
    if value.starts_with("0x") {
        value
    } else {
        format!("0x{}", value)
    }
}

/// Host-side device activation.
pub struct HostStorage<'a> {
    shell: &'a mut dyn ShellSession,
    timeout: Duration,
    wait: RetryPolicy,
}

impl<'a> HostStorage<'a> {
    pub fn new(shell: &'a mut dyn ShellSession, timeout: Duration) -> Self {
        Self {
            shell,
            timeout,
            wait: RetryPolicy::exponential(6, Duration::from_secs(1), 3, Duration::from_secs(30)),
        }
    }

    pub fn with_wait(mut self, wait: RetryPolicy) -> Self {
        self.wait = wait;
        self
    }

    async fn succeeds(&mut self, command: &str) -> Result<bool> {
        Ok(self.shell.run(command, self.timeout).await?.success())
    }

    async fn wait_for(&mut self, command: &str, stage: &str) -> Result<()> {
        let wait = self.wait.clone();
        let mut attempts = Attempts::new(&wait, stage);
        while !self.succeeds(command).await? {
            attempts.wait().await?;
        }
        Ok(())
    }

    async fn output(&mut self, operation: &str, command: &str) -> Result<String> {
        let output = self.shell.run(command, self.timeout).await?;
        if !output.success() {
            return Err(HypervisorError::operation_with(
                operation,
                format!("command exited with status {}", output.exit_code),
                json!({ "command": command, "output": output.output }),
            ));
        }
        Ok(output.output.trim().to_string())
    }

    /// Take a channel device out of the ignore list and set it online.
    async fn enable_device(&mut self, devno: &str) -> Result<()> {
        let devno = full_devno(devno);
        // Not being on the ignore list is fine.
        self.shell
            .run(&format!("echo free {} > /proc/cio_ignore", devno), self.timeout)
            .await?;
        self.output("enable device", &format!("chccwdev -e {}", devno)).await?;
        Ok(())
    }

    /// Returns the host block device of the DASD.
    pub async fn activate_dasd(&mut self, devno: &str) -> Result<String> {
        let path = format!("{}{}", DASD_DEVPATH, full_devno(devno));
        let check = format!("readlink -e {}", shell_quote(&path));
        if !self.succeeds(&check).await? {
            debug!(devno = %devno, "DASD not online yet");
            self.enable_device(devno).await?;
            self.wait_for(&check, &format!("DASD {} online", short_devno(devno)))
                .await?;
        }
        info!(devno = %devno, path = %path, "DASD active");
        Ok(path)
    }

    /// Bring every path of a LUN online. Returns the multipath device when
    /// `multipath` is set, the first path otherwise.
    pub async fn activate_fcp(&mut self, lun: &str, adapters: &[FcpAdapter], multipath: bool) -> Result<String> {
        self.output("load zfcp", "modprobe zfcp").await?;

        let mut paths = Vec::new();
        for adapter in adapters {
            let devno = full_devno(&adapter.devno);
            let adapter_path = format!("{}/{}", FCP_SYSPATH, devno);
            self.enable_device(&devno).await?;
            self.wait_for(&format!("[ -e {} ]", shell_quote(&adapter_path)), &format!("adapter {} online", devno))
                .await?;

            for wwpn in &adapter.wwpns {
                let wwpn = hex_id(wwpn);
                self.activate_port(&adapter_path, &wwpn).await?;
                let path = fcp_device_path(&devno, &wwpn, lun);
                self.activate_lun(&adapter_path, &wwpn, &hex_id(lun), &path).await?;
                paths.push(path);
            }
        }

        let first = paths
            .first()
            .cloned()
            .ok_or_else(|| HypervisorError::InvalidConfig(format!("LUN {} has no path", lun)))?;
        if multipath {
            self.multipath_device(&paths).await
        } else {
            self.remove_from_multipath(&paths).await;
            Ok(first)
        }
    }

    async fn activate_port(&mut self, adapter_path: &str, wwpn: &str) -> Result<()> {
        let port = format!("[ -e {}/{} ]", adapter_path, wwpn);
        if self.succeeds(&port).await? {
            return Ok(());
        }
        debug!(adapter = %adapter_path, wwpn = %wwpn, "Activating port");
        if self.succeeds(&format!("[ -e {}/port_add ]", adapter_path)).await? {
            self.shell
                .run(&format!("echo {} > {}/port_add", wwpn, adapter_path), self.timeout)
                .await?;
        } else {
            self.shell
                .run(&format!("echo 1 > {}/port_rescan", adapter_path), self.timeout)
                .await?;
        }
        self.wait_for(&port, &format!("port {}", wwpn)).await
    }

    async fn activate_lun(&mut self, adapter_path: &str, wwpn: &str, lun: &str, path: &str) -> Result<()> {
        let check = format!("readlink -e {}", shell_quote(path));
        if self.succeeds(&check).await? {
            return Ok(());
        }
        debug!(wwpn = %wwpn, lun = %lun, "Adding LUN");
        self.output("add LUN", &format!("echo {} > {}/{}/unit_add", lun, adapter_path, wwpn))
            .await?;

        match self.wait_for(&check, &format!("LUN {} under {}", lun, wwpn)).await {
            Err(HypervisorError::Timeout { .. }) => {
                let failed = self
                    .shell
                    .run(&format!("cat {}/{}/{}/failed", adapter_path, wwpn, lun), self.timeout)
                    .await?;
                let reason = if failed.success() && failed.output.trim() == "1" {
                    format!("Failed to add LUN {} under {}, check the storage configuration", lun, wwpn)
                } else {
                    format!("Device {} did not come up after adding the LUN", path)
                };
                Err(HypervisorError::operation("add LUN", reason))
            }
            other => other,
        }
    }

    async fn kernel_device(&mut self, path: &str) -> Result<String> {
        self.output("resolve device", &format!("readlink -e {}", shell_quote(path)))
            .await
    }

    /// All paths must belong to the same multipath map.
    async fn multipath_device(&mut self, paths: &[String]) -> Result<String> {
        let mut map: Option<String> = None;
        for path in paths {
            let device = self.kernel_device(path).await?;
            let name = self
                .output("multipath", &format!("multipath -v 1 -l {}", device))
                .await?;
            if name.is_empty() {
                return Err(HypervisorError::operation(
                    "multipath",
                    format!("{} is not part of a multipath map", path),
                ));
            }
            match &map {
                None => map = Some(name),
                Some(existing) if *existing != name => {
                    return Err(HypervisorError::operation(
                        "multipath",
                        format!("{} belongs to map {} instead of {}", path, name, existing),
                    ));
                }
                Some(_) => {}
            }
        }
        let map = map.ok_or_else(|| HypervisorError::Internal("no multipath path".to_string()))?;
        Ok(format!("/dev/mapper/{}", map))
    }

    async fn remove_from_multipath(&mut self, paths: &[String]) {
        for path in paths {
            let result = match self.kernel_device(path).await {
                Ok(device) => self.shell.run(&format!("multipathd del path {}", device), self.timeout).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(output) if output.success() => {}
                Ok(output) => debug!(path = %path, output = %output.output, "Path not handled by multipathd"),
                Err(e) => warn!(path = %path, error = %e, "Failed to remove path from multipath"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockShellSession;

    fn quick() -> RetryPolicy {
        RetryPolicy::fixed(3, Duration::from_millis(1))
    }

    #[test]
    fn test_fcp_device_path() {
        assert_eq!(
            fcp_device_path("1800", "500507630B1B4A12", "4001400000000000"),
            "/dev/disk/by-path/ccw-0.0.1800-zfcp-0x500507630b1b4a12:0x4001400000000000"
        );
    }

    #[tokio::test]
    async fn test_dasd_already_online() {
        let mut shell = MockShellSession::new();
        let path = {
            let mut storage = HostStorage::new(&mut shell, Duration::from_secs(5)).with_wait(quick());
            storage.activate_dasd("3956").await.unwrap()
        };
        assert_eq!(path, "/dev/disk/by-path/ccw-0.0.3956");
        assert!(!shell.commands().iter().any(|c| c.starts_with("chccwdev")));
    }

    #[tokio::test]
    async fn test_dasd_enabled_when_offline() {
        let mut shell = MockShellSession::new()
            .fail_times("readlink -e '/dev/disk/by-path/ccw-0.0.3956'", 2);
        {
            let mut storage = HostStorage::new(&mut shell, Duration::from_secs(5)).with_wait(quick());
            storage.activate_dasd("0.0.3956").await.unwrap();
        }
        let commands = shell.commands();
        assert!(commands.contains(&"echo free 0.0.3956 > /proc/cio_ignore".to_string()));
        assert!(commands.contains(&"chccwdev -e 0.0.3956".to_string()));
    }

    #[tokio::test]
    async fn test_dasd_that_never_comes_up_times_out() {
        let mut shell = MockShellSession::new().fail_always("readlink -e '/dev/disk/by-path/ccw-0.0.3956'");
        let mut storage = HostStorage::new(&mut shell, Duration::from_secs(5)).with_wait(quick());
        let err = storage.activate_dasd("3956").await.unwrap_err();
        assert!(matches!(err, HypervisorError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_fcp_single_path_leaves_multipath() {
        let adapters = vec![FcpAdapter {
            devno: "1800".to_string(),
            wwpns: vec!["500507630b1b4a12".to_string()],
        }];
        let mut shell = MockShellSession::new();
        let source = {
            let mut storage = HostStorage::new(&mut shell, Duration::from_secs(5)).with_wait(quick());
            storage.activate_fcp("4001400000000000", &adapters, false).await.unwrap()
        };
        assert_eq!(source, "/dev/disk/by-path/ccw-0.0.1800-zfcp-0x500507630b1b4a12:0x4001400000000000");
        let commands = shell.commands();
        assert_eq!(commands[0], "modprobe zfcp");
        assert!(commands.iter().any(|c| c.starts_with("multipathd del path")));
    }

    #[tokio::test]
    async fn test_fcp_multipath_map() {
        let adapters = vec![
            FcpAdapter {
                devno: "1800".to_string(),
                wwpns: vec!["500507630b1b4a12".to_string()],
            },
            FcpAdapter {
                devno: "1900".to_string(),
                wwpns: vec!["500507630b1b4a13".to_string()],
            },
        ];
        let mut shell = MockShellSession::new().respond_prefix("multipath -v 1 -l", 0, "36005076309ffd435000000000000307a");
        let mut storage = HostStorage::new(&mut shell, Duration::from_secs(5)).with_wait(quick());
        let source = storage.activate_fcp("4001400000000000", &adapters, true).await.unwrap();
        assert_eq!(source, "/dev/mapper/36005076309ffd435000000000000307a");
    }
}
