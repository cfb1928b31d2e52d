//! 3270 terminal collaborator.
//!
//! The terminal emulation itself is external. Implementations log on to a
//! z/VM user, type commands and collect screen output until one of the
//! given patterns shows up.

use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use url::Url;

use crate::error::Result;

/// CP error messages, e.g. `HCPCPU1456E`.
pub const CP_ERROR_PATTERN: &str = r"HCP([a-zA-Z]{0,8})\d{1,4}([E]{1})( .*)?";

/// Logon flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogonOptions {
    /// Take over a disconnected session (`logon ... here`).
    pub here: bool,
    /// Do not IPL the directory entry (`logon ... noipl`).
    pub noipl: bool,
}

impl Default for LogonOptions {
    fn default() -> Self {
        Self { here: true, noipl: true }
    }
}

/// A pattern that matched the collected output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matched {
    /// Position of the pattern in the `wait_for` list.
    pub index: usize,
    /// Text matched by the pattern.
    pub text: String,
}

/// Output collected for one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminalReply {
    pub output: String,
    /// `None` when no pattern showed up before the timeout.
    pub matched: Option<Matched>,
}

/// Opens terminal sessions.
#[async_trait]
pub trait TerminalConnector: Send + Sync {
    /// Log on to `user`. A rejected password must surface as
    /// [`crate::HypervisorError::AuthenticationFailed`].
    async fn logon(
        &self,
        host: &str,
        user: &str,
        password: &str,
        options: LogonOptions,
        timeout: Duration,
    ) -> Result<Box<dyn CpTerminal>>;
}

/// A logged on 3270 session.
#[async_trait]
pub trait CpTerminal: Send + Sync {
    /// Type `command` (prefixed with `#cp` when `use_cp`) and collect output
    /// until one of `wait_for` matches or `timeout` elapses.
    async fn send_cmd(
        &mut self,
        command: &str,
        use_cp: bool,
        wait_for: &[Regex],
        timeout: Duration,
    ) -> Result<TerminalReply>;

    /// Copy `source` onto the CMS file `target` (`FILENAME TYPE MODE`).
    async fn transfer(&mut self, source: &Url, target: &str, timeout: Duration) -> Result<()>;

    /// End the session and leave the guest running.
    async fn disconnect(&mut self) -> Result<()>;

    /// End the session and the guest.
    async fn logoff(&mut self) -> Result<()>;
}

/// Earliest match of any pattern in `output`. Ties go to the pattern listed
/// first.
pub fn first_match(output: &str, patterns: &[Regex]) -> Option<Matched> {
    patterns
        .iter()
        .enumerate()
        .filter_map(|(index, re)| re.find(output).map(|m| (m.start(), index, m.as_str())))
        .min_by_key(|(start, index, _)| (*start, *index))
        .map(|(_, index, text)| Matched {
            index,
            text: text.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_match_prefers_earliest_position() {
        let patterns = vec![
            Regex::new(r"(?i)Ready;").unwrap(),
            Regex::new(CP_ERROR_PATTERN).unwrap(),
        ];
        let reply = first_match("HCPCPU1456E CPU 01 does not exist\nReady;", &patterns).unwrap();
        assert_eq!(reply.index, 1);
        assert!(reply.text.starts_with("HCPCPU1456E"));

        assert!(first_match("nothing here", &patterns).is_none());
    }

    #[test]
    fn test_error_pattern_ignores_informational_messages() {
        let re = Regex::new(CP_ERROR_PATTERN).unwrap();
        assert!(re.is_match("HCPDEF6004E Device FFFF does not exist"));
        assert!(!re.is_match("HCPLGA2390I Sequence of events"));
    }
}
