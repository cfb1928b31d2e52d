//! Collaborator interfaces for interactive channels.
//!
//! SSH session management lives outside this crate. Drivers only see the
//! traits below; the embedding application supplies the implementations
//! (and tests supply scripted ones from [`crate::mock`]).

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, instrument};

use crate::error::{HypervisorError, Result};

/// Exit status and combined output of a shell command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub output: String,
}

impl CommandOutput {
    pub fn new(exit_code: i32, output: impl Into<String>) -> Self {
        Self {
            exit_code,
            output: output.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// An established interactive shell.
#[async_trait]
pub trait ShellSession: Send + Sync {
    /// Run `command` and wait up to `timeout` for its exit status.
    ///
    /// Exceeding `timeout` must be reported as [`HypervisorError::Timeout`].
    async fn run(&mut self, command: &str, timeout: Duration) -> Result<CommandOutput>;

    /// Submit `command` without waiting for it to finish.
    async fn send(&mut self, command: &str) -> Result<()>;

    /// Close the session.
    async fn close(&mut self) -> Result<()>;
}

/// Opens shell sessions.
#[async_trait]
pub trait ShellConnector: Send + Sync {
    /// Authentication problems must surface as
    /// [`HypervisorError::AuthenticationFailed`], transport problems as
    /// [`HypervisorError::ConnectionFailed`].
    async fn connect(
        &self,
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<Box<dyn ShellSession>>;
}

/// Answers whether a freshly configured address is up.
#[async_trait]
pub trait Reachability: Send + Sync {
    async fn is_reachable(&self, host: &str, port: u16, timeout: Duration) -> bool;
}

/// Reachability check by opening a TCP connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbe;

#[async_trait]
impl Reachability for TcpProbe {
    #[instrument(skip(self), fields(host = %host, port = port))]
    async fn is_reachable(&self, host: &str, port: u16, timeout: Duration) -> bool {
        let connect = tokio::net::TcpStream::connect((host, port));
        match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                debug!(error = %e, "Target not reachable yet");
                false
            }
            Err(_) => {
                debug!("Reachability probe timed out");
                false
            }
        }
    }
}

/// Run `command` and turn a non-zero exit status into a backend failure
/// carrying the command output.
pub async fn run_checked(
    session: &mut dyn ShellSession,
    operation: &str,
    command: &str,
    timeout: Duration,
) -> Result<String> {
    debug!(operation = %operation, command = %command, "Running shell command");
    let result = session.run(command, timeout).await?;
    if !result.success() {
        return Err(HypervisorError::operation_with(
            operation,
            format!("command exited with status {}", result.exit_code),
            json!({
                "command": command,
                "exit_code": result.exit_code,
                "output": result.output,
            }),
        ));
    }
    Ok(result.output)
}

/// Quote `value` for a POSIX shell using single quotes.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[tokio::test]
    async fn test_tcp_probe_against_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(TcpProbe.is_reachable("127.0.0.1", port, Duration::from_secs(2)).await);
        drop(listener);
        assert!(!TcpProbe.is_reachable("127.0.0.1", port, Duration::from_secs(2)).await);
    }
}
