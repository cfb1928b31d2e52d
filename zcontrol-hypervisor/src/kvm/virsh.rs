//! `virsh` over a host shell session.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, warn};

use super::xml::{DirectKernel, DomainXmlBuilder};
use crate::error::{HypervisorError, Result};
use crate::netboot::fetch;
use crate::transport::{run_checked, shell_quote, ShellSession};
use crate::types::NetBoot;

const KERNEL_FILENAME: &str = "kernel";
const INITRD_FILENAME: &str = "initrd";

/// Wraps the `virsh` commands the driver needs.
///
/// A network boot stores kernel and initrd in a temporary directory on the
/// host; [`Virsh::clean_tmp_dir`] removes it.
pub struct Virsh<'a> {
    shell: &'a mut dyn ShellSession,
    timeout: Duration,
    tmp_dir: Option<String>,
}

impl<'a> Virsh<'a> {
    pub fn new(shell: &'a mut dyn ShellSession, timeout: Duration) -> Self {
        Self {
            shell,
            timeout,
            tmp_dir: None,
        }
    }

    /// Borrow the underlying shell, e.g. for storage activation.
    pub fn shell(&mut self) -> &mut dyn ShellSession {
        &mut *self.shell
    }

    async fn virsh(&mut self, operation: &str, args: &str) -> Result<String> {
        run_checked(&mut *self.shell, operation, &format!("virsh {}", args), self.timeout).await
    }

    /// `virsh dominfo` as key/value pairs, `None` if the domain is unknown.
    pub async fn dominfo(&mut self, domain: &str) -> Result<Option<BTreeMap<String, String>>> {
        let output = self
            .shell
            .run(&format!("virsh dominfo {}", shell_quote(domain)), self.timeout)
            .await?;
        if !output.success() {
            return Ok(None);
        }
        let info = output
            .output
            .lines()
            .filter_map(|line| line.split_once(':'))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect();
        Ok(Some(info))
    }

    pub async fn is_defined(&mut self, domain: &str) -> Result<bool> {
        Ok(self.dominfo(domain).await?.is_some())
    }

    pub async fn is_running(&mut self, domain: &str) -> Result<bool> {
        Ok(self
            .dominfo(domain)
            .await?
            .and_then(|info| info.get("State").cloned())
            .is_some_and(|state| state == "running"))
    }

    /// Define a domain from its XML. The XML goes through a temporary file
    /// on the host.
    pub async fn define(&mut self, domain_xml: &str) -> Result<()> {
        debug!(xml = %domain_xml, "Defining domain");
        let path = run_checked(&mut *self.shell, "define domain", "mktemp --suffix=.xml", self.timeout)
            .await?
            .trim()
            .to_string();

        let write = format!("printf '%s' {} > {}", shell_quote(domain_xml), shell_quote(&path));
        let result = match run_checked(&mut *self.shell, "define domain", &write, self.timeout).await {
            Ok(_) => self.virsh("define domain", &format!("define {}", shell_quote(&path))).await,
            Err(e) => Err(e),
        };

        let removed = self.shell.run(&format!("rm -f {}", shell_quote(&path)), self.timeout).await;
        if !removed.map(|o| o.success()).unwrap_or(false) {
            warn!(path = %path, "Unable to remove temporary file on the host");
        }
        result.map(|_| ())
    }

    /// Define the temporary domain of a network boot: kernel and initrd are
    /// downloaded onto the host and loaded directly by QEMU.
    pub async fn define_netboot(
        &mut self,
        builder: &DomainXmlBuilder<'_>,
        netboot: &NetBoot,
        fetch_timeout: Duration,
    ) -> Result<()> {
        let result = self.stage_netboot(builder, netboot, fetch_timeout).await;
        if result.is_err() {
            self.clean_tmp_dir().await;
        }
        result
    }

    async fn stage_netboot(
        &mut self,
        builder: &DomainXmlBuilder<'_>,
        netboot: &NetBoot,
        fetch_timeout: Duration,
    ) -> Result<()> {
        let dir = self.tmp_dir().await?;
        let kernel = format!("{}/{}", dir, KERNEL_FILENAME);
        fetch(&mut *self.shell, &netboot.kernel_url, &kernel, fetch_timeout).await?;
        let initrd = match &netboot.initrd_url {
            Some(url) => {
                let path = format!("{}/{}", dir, INITRD_FILENAME);
                fetch(&mut *self.shell, url, &path, fetch_timeout).await?;
                Some(path)
            }
            None => None,
        };

        let xml = builder.build_with_kernel(DirectKernel {
            kernel: &kernel,
            initrd: initrd.as_deref(),
            cmdline: netboot.cmdline.as_deref(),
        });
        self.define(&xml).await
    }

    async fn tmp_dir(&mut self) -> Result<String> {
        if let Some(dir) = &self.tmp_dir {
            return Ok(dir.clone());
        }
        let dir = run_checked(&mut *self.shell, "create temporary directory", "mktemp -d", self.timeout)
            .await?
            .trim()
            .to_string();
        self.tmp_dir = Some(dir.clone());
        // qemu runs as its own user and must read the artifacts
        run_checked(
            &mut *self.shell,
            "create temporary directory",
            &format!("chmod 755 {}", shell_quote(&dir)),
            self.timeout,
        )
        .await?;
        Ok(dir)
    }

    /// Remove the netboot directory, if any. Failures are only logged.
    pub async fn clean_tmp_dir(&mut self) {
        let Some(dir) = self.tmp_dir.take() else {
            return;
        };
        match self.shell.run(&format!("rm -rf {}", shell_quote(&dir)), self.timeout).await {
            Ok(output) if output.success() => {}
            Ok(output) => warn!(dir = %dir, output = %output.output, "Failed to remove temporary directory"),
            Err(e) => warn!(dir = %dir, error = %e, "Failed to remove temporary directory"),
        }
    }

    pub async fn start(&mut self, domain: &str) -> Result<()> {
        debug!(domain = %domain, "Starting domain");
        self.virsh("start domain", &format!("start {}", shell_quote(domain))).await?;
        Ok(())
    }

    pub async fn destroy(&mut self, domain: &str) -> Result<()> {
        debug!(domain = %domain, "Destroying domain");
        self.virsh("destroy domain", &format!("destroy {}", shell_quote(domain))).await?;
        Ok(())
    }

    pub async fn undefine(&mut self, domain: &str) -> Result<()> {
        debug!(domain = %domain, "Undefining domain");
        self.virsh("undefine domain", &format!("undefine {}", shell_quote(domain))).await?;
        Ok(())
    }

    /// Fail with a backend error unless `domain` is defined and running.
    pub async fn ensure_running(&mut self, domain: &str, operation: &str) -> Result<()> {
        let Some(info) = self.dominfo(domain).await? else {
            return Err(HypervisorError::operation(operation, format!("Domain {} is not defined", domain)));
        };
        if info.get("State").map(String::as_str) != Some("running") {
            return Err(HypervisorError::operation(operation, format!("Domain {} is not running", domain)));
        }
        Ok(())
    }
}
