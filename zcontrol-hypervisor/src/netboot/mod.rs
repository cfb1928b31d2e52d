//! Simulated network boot.
//!
//! Partitions without a native network boot are booted from a small
//! pre-staged rescue disk instead. Once the rescue system is up, the
//! orchestrator configures its network from the console, opens a shell,
//! downloads the target kernel and initrd and switches to them with kexec:
//!
//! ```text
//!  RescueIpl ──▶ NetworkBringUp ──▶ ShellOpen ──▶ ArtifactFetch ──▶ KernelSwitch
//!  (console       (console cmds,     (ssh)         (curl, long        (kexec,
//!   polling)       reachability)                    timeout)           fire-and-forget)
//! ```
//!
//! Stages run strictly in order and each one has its own bound. A failing
//! stage aborts the sequence; nothing done by earlier stages is undone.
//! The rescue disk must not be used by two boots at the same time, which
//! is left to the caller.

mod commands;

pub use commands::{console_chunks, fetch_command, kexec_command, network_commands, osa_channels};

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use crate::config::DriverConfig;
use crate::error::{HypervisorError, Result};
use crate::retry::poll_until;
use crate::transport::{run_checked, Reachability, ShellConnector, ShellSession};
use crate::types::{NetBoot, NetSetup};

/// Console access to the partition being booted.
#[async_trait]
pub trait RescueConsole: Send + Sync {
    /// IPL the rescue disk.
    async fn ipl(&self) -> Result<()>;

    /// Whether the partition reports an operating status.
    async fn is_operational(&self) -> Result<bool>;

    /// Recent operating system messages shown on the console.
    async fn console_output(&self) -> Result<String>;

    /// Type a line into the operating system console.
    async fn send_command(&self, command: &str) -> Result<()>;
}

/// Stages of a simulated network boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    RescueIpl,
    NetworkBringUp,
    ShellOpen,
    ArtifactFetch,
    KernelSwitch,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::RescueIpl => "rescue IPL",
            Stage::NetworkBringUp => "network bring-up",
            Stage::ShellOpen => "shell open",
            Stage::ArtifactFetch => "artifact fetch",
            Stage::KernelSwitch => "kernel switch",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runs the simulated network boot sequence for one partition.
pub struct NetbootOrchestrator<'a> {
    config: &'a DriverConfig,
    shells: &'a dyn ShellConnector,
    reachability: &'a dyn Reachability,
    reached: Option<Stage>,
}

impl<'a> NetbootOrchestrator<'a> {
    pub fn new(
        config: &'a DriverConfig,
        shells: &'a dyn ShellConnector,
        reachability: &'a dyn Reachability,
    ) -> Self {
        Self {
            config,
            shells,
            reachability,
            reached: None,
        }
    }

    /// Last stage that was entered, successfully or not.
    pub fn reached(&self) -> Option<Stage> {
        self.reached
    }

    fn enter(&mut self, stage: Stage) {
        info!(stage = %stage, "Entering netboot stage");
        self.reached = Some(stage);
    }

    /// Run every stage. Without `netboot` the sequence ends once a shell on
    /// the rescue system could be opened.
    #[instrument(skip_all, fields(entity = %entity, ip = %setup.ip))]
    pub async fn run(
        &mut self,
        entity: &str,
        console: &dyn RescueConsole,
        setup: &NetSetup,
        netboot: Option<&NetBoot>,
    ) -> Result<()> {
        self.enter(Stage::RescueIpl);
        console.ipl().await?;
        self.wait_rescue_ready(console).await?;

        self.enter(Stage::NetworkBringUp);
        self.bring_up_network(console, setup).await?;

        self.enter(Stage::ShellOpen);
        let mut shell = self
            .shells
            .connect(
                &setup.ip,
                self.config.netboot.shell_port,
                &self.config.netboot.shell_user,
                &setup.password,
                self.config.login_timeout(),
            )
            .await?;

        let result = match netboot {
            Some(netboot) => self.switch_kernel(shell.as_mut(), netboot).await,
            None => Ok(()),
        };

        if result.is_err() || netboot.is_none() {
            if let Err(e) = shell.close().await {
                warn!(error = %e, "Failed to close rescue shell");
            }
        }
        result?;

        info!("Simulated network boot finished");
        Ok(())
    }

    async fn wait_rescue_ready(&self, console: &dyn RescueConsole) -> Result<()> {
        let marker = self.config.netboot.readiness_marker.as_deref();
        poll_until(&self.config.netboot.rescue_ipl, Stage::RescueIpl.as_str(), |_| async move {
            if !console.is_operational().await? {
                return Ok(false);
            }
            match marker {
                None => Ok(true),
                Some(marker) => Ok(console.console_output().await?.contains(marker)),
            }
        })
        .await?;
        Ok(())
    }

    async fn bring_up_network(&self, console: &dyn RescueConsole, setup: &NetSetup) -> Result<()> {
        let chunks = console_chunks(
            &network_commands(setup)?,
            &setup.gateway,
            self.config.netboot.console_chunk,
        );
        let port = self.config.netboot.shell_port;
        let probe_timeout = Duration::from_secs(5);
        let chunks = &chunks;

        poll_until(&self.config.netboot.network, Stage::NetworkBringUp.as_str(), |_| async move {
            console.send_command(&self.config.netboot.shell_user).await?;
            console.send_command(&setup.password).await?;
            for chunk in chunks {
                console.send_command(chunk).await?;
            }
            Ok(self.reachability.is_reachable(&setup.ip, port, probe_timeout).await)
        })
        .await?;
        Ok(())
    }

    async fn switch_kernel(&mut self, shell: &mut dyn ShellSession, netboot: &NetBoot) -> Result<()> {
        self.enter(Stage::ArtifactFetch);
        let kernel_path = self.config.netboot.kernel_path.clone();
        let initrd_path = self.config.netboot.initrd_path.clone();
        fetch(shell, &netboot.kernel_url, &kernel_path, self.config.fetch_timeout()).await?;
        if let Some(initrd) = &netboot.initrd_url {
            fetch(shell, initrd, &initrd_path, self.config.fetch_timeout()).await?;
        }

        self.enter(Stage::KernelSwitch);
        let command = kexec_command(
            &kernel_path,
            netboot.initrd_url.as_ref().map(|_| initrd_path.as_str()),
            netboot.cmdline.as_deref(),
        );
        shell.send(&command).await.map_err(|e| match e {
            HypervisorError::OperationFailed { .. } => e,
            other => HypervisorError::operation(Stage::KernelSwitch.as_str(), other.to_string()),
        })?;
        Ok(())
    }
}

/// Download one artifact onto the target through `shell`.
pub(crate) async fn fetch(
    shell: &mut dyn ShellSession,
    url: &str,
    path: &str,
    timeout: Duration,
) -> Result<()> {
    info!(url = %url, path = %path, "Fetching boot artifact");
    run_checked(shell, Stage::ArtifactFetch.as_str(), &fetch_command(url, path), timeout)
        .await
        .map_err(|e| match e {
            HypervisorError::Timeout { waited, .. } => {
                HypervisorError::timeout(Stage::ArtifactFetch.as_str(), waited)
            }
            other => other,
        })?;
    Ok(())
}
