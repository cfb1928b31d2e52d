//! Scripted collaborators for testing and development.
//!
//! Every fake records what it was asked to do so tests can assert on
//! ordering, and on what never happened. Clones share their state: keep a
//! clone to inspect a session that was boxed and handed to a driver.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

use crate::error::{HypervisorError, Result};
use crate::hmc::{CpcInfo, HmcConnector, HmcSession, PartitionBoot, ResourceUpdate, Resources, VolumeProperties};
use crate::netboot::RescueConsole;
use crate::session::SessionHandle;
use crate::traits::{Capabilities, Lifecycle};
use crate::transport::{CommandOutput, Reachability, ShellConnector, ShellSession};
use crate::types::{EntityState, Family};
use crate::zvm::{first_match, CpTerminal, LogonOptions, TerminalConnector, TerminalReply};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Undo `shell_quote`.
fn unquote(value: &str) -> String {
    let value = value.trim();
    let inner = value
        .strip_prefix('\'')
        .and_then(|v| v.strip_suffix('\''))
        .unwrap_or(value);
    inner.replace(r"'\''", "'")
}

// =============================================================================
// Lifecycle
// =============================================================================

/// A driver that only counts calls.
pub struct CountingDriver {
    family: Family,
    calls: Mutex<HashMap<String, usize>>,
    failures: HashMap<String, String>,
}

impl CountingDriver {
    pub fn new(family: Family) -> Self {
        Self {
            family,
            calls: Mutex::new(HashMap::new()),
            failures: HashMap::new(),
        }
    }

    /// Make `operation` fail with a backend error carrying `reason`.
    pub fn failing_with(mut self, operation: &str, reason: &str) -> Self {
        self.failures.insert(operation.to_string(), reason.to_string());
        self
    }

    pub fn calls(&self, operation: &str) -> usize {
        lock(&self.calls).get(operation).copied().unwrap_or(0)
    }

    fn record(&self, operation: &str) -> Result<()> {
        *lock(&self.calls).entry(operation.to_string()).or_insert(0) += 1;
        match self.failures.get(operation) {
            Some(reason) => Err(HypervisorError::operation(operation, reason.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Lifecycle for CountingDriver {
    fn family(&self) -> Family {
        self.family
    }

    async fn capabilities(&self) -> Result<Capabilities> {
        Ok(Capabilities {
            family: self.family,
            backend: "mock".to_string(),
            atomic_reboot: true,
            native_netboot: false,
            simulated_netboot: false,
            soft_disconnect: false,
        })
    }

    async fn login(&self) -> Result<SessionHandle> {
        self.record("login")?;
        Ok(SessionHandle::new("mock"))
    }

    async fn logoff(&self) -> Result<()> {
        self.record("logoff")
    }

    async fn start(&self, _name: &str, _cpu: u32, _memory: u64, _parameters: &Value) -> Result<()> {
        self.record("start")
    }

    async fn stop(&self, _name: &str, _parameters: &Value) -> Result<()> {
        self.record("stop")
    }

    async fn reboot(&self, _name: &str, _parameters: &Value) -> Result<()> {
        self.record("reboot")
    }

    async fn entity_state(&self, _name: &str) -> Result<EntityState> {
        Ok(EntityState::Unknown)
    }
}

// =============================================================================
// Shell
// =============================================================================

#[derive(Default)]
struct ShellState {
    commands: Vec<String>,
    exact: HashMap<String, CommandOutput>,
    prefixed: Vec<(String, CommandOutput)>,
    /// Remaining forced failures per command, `None` for always.
    failures: HashMap<String, Option<u32>>,
    /// virsh domains and their state.
    domains: BTreeMap<String, String>,
    files: Vec<String>,
    closed: bool,
}

impl ShellState {
    fn forced_failure(&mut self, command: &str) -> bool {
        match self.failures.get_mut(command) {
            Some(None) => true,
            Some(Some(0)) | None => false,
            Some(Some(remaining)) => {
                *remaining -= 1;
                true
            }
        }
    }

    fn virsh(&mut self, args: &str) -> CommandOutput {
        let (verb, rest) = args.split_once(' ').unwrap_or((args, ""));
        let name = unquote(rest);
        match verb {
            "dominfo" => match self.domains.get(&name) {
                Some(state) => CommandOutput::new(
                    0,
                    format!("Id:             1\nName:           {}\nState:          {}\n", name, state),
                ),
                None => CommandOutput::new(1, format!("error: failed to get domain '{}'", name)),
            },
            "define" => {
                let defined = self.files.last().and_then(|xml| {
                    let start = xml.find("<name>")? + "<name>".len();
                    let end = xml[start..].find("</name>")? + start;
                    Some(xml[start..end].to_string())
                });
                match defined {
                    Some(domain) => {
                        self.domains
                            .entry(domain.clone())
                            .or_insert_with(|| "shut off".to_string());
                        CommandOutput::new(0, format!("Domain '{}' defined", domain))
                    }
                    None => CommandOutput::new(1, "error: malformed domain xml"),
                }
            }
            "start" => match self.domains.get_mut(&name) {
                Some(state) if state != "running" => {
                    *state = "running".to_string();
                    CommandOutput::new(0, format!("Domain '{}' started", name))
                }
                _ => CommandOutput::new(1, format!("error: failed to start domain '{}'", name)),
            },
            "destroy" => match self.domains.get_mut(&name) {
                Some(state) if state == "running" => {
                    *state = "shut off".to_string();
                    CommandOutput::new(0, format!("Domain '{}' destroyed", name))
                }
                _ => CommandOutput::new(1, format!("error: domain '{}' is not running", name)),
            },
            "undefine" => match self.domains.remove(&name) {
                Some(_) => CommandOutput::new(0, format!("Domain '{}' has been undefined", name)),
                None => CommandOutput::new(1, format!("error: failed to get domain '{}'", name)),
            },
            _ => CommandOutput::new(0, ""),
        }
    }

    fn run(&mut self, command: &str) -> CommandOutput {
        self.commands.push(command.to_string());
        if self.forced_failure(command) {
            return CommandOutput::new(1, "");
        }
        if let Some(output) = self.exact.get(command) {
            return output.clone();
        }
        if let Some((_, output)) = self.prefixed.iter().find(|(p, _)| command.starts_with(p.as_str())) {
            return output.clone();
        }
        match command {
            "uname -s" => CommandOutput::new(0, "Linux\n"),
            "mktemp --suffix=.xml" => CommandOutput::new(0, "/tmp/tmp.mock.xml\n"),
            "mktemp -d" => CommandOutput::new(0, "/tmp/tmp.mock\n"),
            _ => {
                if let Some(args) = command.strip_prefix("virsh ") {
                    return self.virsh(args);
                }
                if let Some(rest) = command.strip_prefix("printf '%s' ") {
                    let content = rest.rsplit_once(" > ").map(|(c, _)| c).unwrap_or(rest);
                    self.files.push(unquote(content));
                }
                CommandOutput::new(0, "")
            }
        }
    }
}

/// A host shell that succeeds unless told otherwise and simulates enough
/// of `virsh` for the KVM driver.
#[derive(Clone, Default)]
pub struct MockShellSession {
    state: Arc<Mutex<ShellState>>,
}

impl MockShellSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, command: &str, exit_code: i32, output: &str) -> Self {
        lock(&self.state)
            .exact
            .insert(command.to_string(), CommandOutput::new(exit_code, output));
        self
    }

    pub fn respond_prefix(self, prefix: &str, exit_code: i32, output: &str) -> Self {
        lock(&self.state)
            .prefixed
            .push((prefix.to_string(), CommandOutput::new(exit_code, output)));
        self
    }

    /// Fail the first `times` runs of `command` with exit status 1.
    pub fn fail_times(self, command: &str, times: u32) -> Self {
        lock(&self.state).failures.insert(command.to_string(), Some(times));
        self
    }

    pub fn fail_always(self, command: &str) -> Self {
        lock(&self.state).failures.insert(command.to_string(), None);
        self
    }

    pub fn with_domain(self, name: &str, state: &str) -> Self {
        lock(&self.state).domains.insert(name.to_string(), state.to_string());
        self
    }

    /// Every command run or sent, in order.
    pub fn commands(&self) -> Vec<String> {
        lock(&self.state).commands.clone()
    }

    /// Contents written with `printf '%s' ... > file`.
    pub fn written_files(&self) -> Vec<String> {
        lock(&self.state).files.clone()
    }

    pub fn domain_state(&self, name: &str) -> Option<String> {
        lock(&self.state).domains.get(name).cloned()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

#[async_trait]
impl ShellSession for MockShellSession {
    async fn run(&mut self, command: &str, _timeout: Duration) -> Result<CommandOutput> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(HypervisorError::ConnectionFailed("shell is closed".to_string()));
        }
        Ok(state.run(command))
    }

    async fn send(&mut self, command: &str) -> Result<()> {
        lock(&self.state).commands.push(command.to_string());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        lock(&self.state).closed = true;
        Ok(())
    }
}

/// Hands out clones of one [`MockShellSession`].
pub struct MockShellConnector {
    session: MockShellSession,
    connections: Mutex<Vec<(String, u16)>>,
    refuse_first: AtomicU32,
    reject_password: bool,
}

impl MockShellConnector {
    pub fn new() -> Self {
        Self::with_session(MockShellSession::new())
    }

    pub fn with_session(session: MockShellSession) -> Self {
        Self {
            session,
            connections: Mutex::new(Vec::new()),
            refuse_first: AtomicU32::new(0),
            reject_password: false,
        }
    }

    /// Refuse the first `times` connections as unreachable.
    pub fn refusing(self, times: u32) -> Self {
        self.refuse_first.store(times, Ordering::SeqCst);
        self
    }

    pub fn rejecting_password(mut self) -> Self {
        self.reject_password = true;
        self
    }

    pub fn session(&self) -> &MockShellSession {
        &self.session
    }

    pub fn connections(&self) -> Vec<(String, u16)> {
        lock(&self.connections).clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.session.commands()
    }

    pub fn written_files(&self) -> Vec<String> {
        self.session.written_files()
    }
}

impl Default for MockShellConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ShellConnector for MockShellConnector {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        user: &str,
        _password: &str,
        _timeout: Duration,
    ) -> Result<Box<dyn ShellSession>> {
        lock(&self.connections).push((host.to_string(), port));
        let refused = self
            .refuse_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(HypervisorError::ConnectionFailed(format!(
                "{}:{} refused the connection",
                host, port
            )));
        }
        if self.reject_password {
            return Err(HypervisorError::AuthenticationFailed(format!("{}@{}", user, host)));
        }
        debug!(host = %host, port, "Mock shell connected");
        lock(&self.session.state).closed = false;
        Ok(Box::new(self.session.clone()))
    }
}

/// Reachable from the `after`-th probe on.
pub struct MockReachability {
    after: Option<u32>,
    probes: AtomicU32,
}

impl MockReachability {
    pub fn always() -> Self {
        Self::after(1)
    }

    pub fn after(probes: u32) -> Self {
        Self {
            after: Some(probes),
            probes: AtomicU32::new(0),
        }
    }

    pub fn never() -> Self {
        Self {
            after: None,
            probes: AtomicU32::new(0),
        }
    }

    pub fn probes(&self) -> u32 {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Reachability for MockReachability {
    async fn is_reachable(&self, _host: &str, _port: u16, _timeout: Duration) -> bool {
        let probe = self.probes.fetch_add(1, Ordering::SeqCst) + 1;
        self.after.is_some_and(|after| probe >= after)
    }
}

/// Rescue system console.
pub struct MockConsole {
    operational_after: Option<u32>,
    polls: AtomicU32,
    output: String,
    ipls: AtomicU32,
    commands: Mutex<Vec<String>>,
}

impl MockConsole {
    pub fn new() -> Self {
        Self {
            operational_after: Some(1),
            polls: AtomicU32::new(0),
            output: "rescue login:".to_string(),
            ipls: AtomicU32::new(0),
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn operational_after(mut self, polls: u32) -> Self {
        self.operational_after = Some(polls);
        self
    }

    pub fn never_operational(mut self) -> Self {
        self.operational_after = None;
        self
    }

    pub fn with_output(mut self, output: &str) -> Self {
        self.output = output.to_string();
        self
    }

    pub fn ipls(&self) -> u32 {
        self.ipls.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<String> {
        lock(&self.commands).clone()
    }
}

impl Default for MockConsole {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RescueConsole for MockConsole {
    async fn ipl(&self) -> Result<()> {
        self.ipls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn is_operational(&self) -> Result<bool> {
        let poll = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(self.operational_after.is_some_and(|after| poll >= after))
    }

    async fn console_output(&self) -> Result<String> {
        Ok(self.output.clone())
    }

    async fn send_command(&self, command: &str) -> Result<()> {
        lock(&self.commands).push(command.to_string());
        Ok(())
    }
}

// =============================================================================
// z/VM terminal
// =============================================================================

#[derive(Default)]
struct TerminalState {
    user: String,
    cpus: Vec<u32>,
    attached: BTreeSet<String>,
    responses: HashMap<String, String>,
    commands: Vec<String>,
    transfers: Vec<(String, String)>,
    events: Vec<String>,
    loaddev: Option<(String, String)>,
    /// Logoffs still to be refused.
    failing_logoffs: u32,
}

impl TerminalState {
    /// CP's answer to `command` given the modelled guest.
    fn output_for(&mut self, command: &str) -> String {
        if let Some(output) = self.responses.get(command) {
            return output.clone();
        }
        let user = self.user.clone();
        let words: Vec<&str> = command.split_whitespace().collect();
        match words.as_slice() {
            ["q", "v", "cpus"] => self
                .cpus
                .iter()
                .map(|cpu| format!("00: CPU {:02X}  ID  FF0B7A562964  CP   CPUAFF ON", cpu))
                .collect::<Vec<_>>()
                .join("\n"),
            ["define", "cpu", range] => {
                let (first, last) = range.split_once('-').unwrap_or((*range, *range));
                let first = u32::from_str_radix(first, 16).unwrap_or(0);
                let last = u32::from_str_radix(last, 16).unwrap_or(first);
                self.cpus.extend(first..=last);
                (first..=last)
                    .map(|cpu| format!("CPU {:02X} defined", cpu))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
            ["detach", "cpu", "all"] => "HCPCPU1456E No CPUs are eligible for detach".to_string(),
            ["define", "storage", size] => format!("STORAGE = {}", size),
            ["q", "v", "pcif", id] => {
                if self.attached.contains(&id.to_lowercase()) {
                    format!("PCIF {} ON PCHID 01C0 VFN 0001 TYPE ROCE", id.to_uppercase())
                } else {
                    "HCPQVP2800E A PCI function was not found".to_string()
                }
            }
            ["q", "v", id] => {
                if self.attached.contains(&id.to_lowercase()) {
                    format!("OSA  {0} ON OSA   {0} SUBCHANNEL = 0003", id.to_uppercase())
                } else {
                    format!("HCPQVD040E Device {} does not exist", id.to_uppercase())
                }
            }
            ["att", "pcif", id, "*"] | ["att", id, "*"] => {
                self.attached.insert(id.to_lowercase());
                format!("{} ATTACHED TO {}", id.to_uppercase(), user)
            }
            ["define", "nic", address, ..] => {
                format!("NIC {0} is created; devices {0}-{0} defined", address.to_uppercase())
            }
            ["couple", address, "to", "SYSTEM", system] => {
                format!("NIC {} is connected to SYSTEM {}", address.to_uppercase(), system)
            }
            ["define", "vfb-512", "as", devno, ..] => format!("DASD {} DEFINED", devno.to_uppercase()),
            ["set", "loaddev", ..] => {
                let rest = command.trim_start_matches("set loaddev portname ");
                if let Some((port, lun)) = rest.split_once(" lun ") {
                    self.loaddev = Some((port.to_string(), lun.to_string()));
                }
                String::new()
            }
            ["q", "loaddev"] => match &self.loaddev {
                Some((port, lun)) => format!("PORTNAME {}    LUN  {}\nBOOTPROG 0", port, lun),
                None => "PORTNAME 00000000 00000000    LUN  00000000 00000000".to_string(),
            },
            ["i", "cms", ..] => "CMS Level 27\nReady; T=0.01/0.01 11:04:12".to_string(),
            ["system", "clear"] => "Storage cleared - system reset.".to_string(),
            ["ipl", "00c", "clear"] => "Linux version 6.4.0\nKernel command line: root=/dev/ram0".to_string(),
            ["i", _devno] => "Welcome\nlinux01 login: ".to_string(),
            _ => "Ready;".to_string(),
        }
    }
}

/// A scripted CP terminal with a small model of one guest.
#[derive(Clone)]
pub struct MockTerminal {
    state: Arc<Mutex<TerminalState>>,
}

impl MockTerminal {
    pub fn new(user: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(TerminalState {
                user: user.to_uppercase(),
                cpus: vec![0],
                ..Default::default()
            })),
        }
    }

    pub fn with_cpus(self, cpus: &[u32]) -> Self {
        lock(&self.state).cpus = cpus.to_vec();
        self
    }

    pub fn with_attached(self, devno: &str) -> Self {
        lock(&self.state).attached.insert(devno.to_lowercase());
        self
    }

    /// Answer `command` with `output` instead of the modelled reply.
    pub fn respond(self, command: &str, output: &str) -> Self {
        lock(&self.state)
            .responses
            .insert(command.to_string(), output.to_string());
        self
    }

    /// Refuse the next `count` logoffs with a transport error.
    pub fn fail_logoffs(self, count: u32) -> Self {
        lock(&self.state).failing_logoffs = count;
        self
    }

    pub fn commands(&self) -> Vec<String> {
        lock(&self.state).commands.clone()
    }

    /// `(source url, target file)` pairs.
    pub fn transfers(&self) -> Vec<(String, String)> {
        lock(&self.state).transfers.clone()
    }

    /// Logons, disconnects and logoffs in order.
    pub fn events(&self) -> Vec<String> {
        lock(&self.state).events.clone()
    }
}

#[async_trait]
impl CpTerminal for MockTerminal {
    async fn send_cmd(
        &mut self,
        command: &str,
        _use_cp: bool,
        wait_for: &[Regex],
        _timeout: Duration,
    ) -> Result<TerminalReply> {
        let mut state = lock(&self.state);
        state.commands.push(command.to_string());
        let output = state.output_for(command);
        let matched = first_match(&output, wait_for);
        Ok(TerminalReply { output, matched })
    }

    async fn transfer(&mut self, source: &Url, target: &str, _timeout: Duration) -> Result<()> {
        lock(&self.state)
            .transfers
            .push((source.to_string(), target.to_string()));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        lock(&self.state).events.push("disconnect".to_string());
        Ok(())
    }

    async fn logoff(&mut self) -> Result<()> {
        let mut state = lock(&self.state);
        if state.failing_logoffs > 0 {
            state.failing_logoffs -= 1;
            return Err(HypervisorError::ConnectionFailed(
                "terminal connection reset during logoff".to_string(),
            ));
        }
        state.events.push("logoff".to_string());
        Ok(())
    }
}

/// Logs on to one [`MockTerminal`].
pub struct MockTerminalConnector {
    terminal: MockTerminal,
    password: String,
}

impl MockTerminalConnector {
    /// Accepts `password` only.
    pub fn new(terminal: MockTerminal, password: &str) -> Self {
        Self {
            terminal,
            password: password.to_string(),
        }
    }

    pub fn terminal(&self) -> &MockTerminal {
        &self.terminal
    }
}

#[async_trait]
impl TerminalConnector for MockTerminalConnector {
    async fn logon(
        &self,
        host: &str,
        user: &str,
        password: &str,
        options: LogonOptions,
        _timeout: Duration,
    ) -> Result<Box<dyn CpTerminal>> {
        if password != self.password {
            return Err(HypervisorError::AuthenticationFailed(format!(
                "HCPLGA050E LOGON unsuccessful for {} on {}",
                user, host
            )));
        }
        let event = if options.noipl { "logon noipl" } else { "logon" };
        lock(&self.terminal.state).events.push(event.to_string());
        Ok(Box::new(self.terminal.clone()))
    }
}

// =============================================================================
// HMC
// =============================================================================

#[derive(Debug, Clone)]
struct MockLpar {
    status: String,
    resources: Resources,
    boot: Option<PartitionBoot>,
    volumes: Vec<VolumeProperties>,
}

struct HmcState {
    cpc: CpcInfo,
    lpars: BTreeMap<String, MockLpar>,
    calls: Vec<String>,
    os_commands: Vec<String>,
    messages: Vec<String>,
    never_boots: bool,
    reject_login: bool,
    closed: bool,
}

/// HMC Web Services with a model of one CPC.
#[derive(Clone)]
pub struct MockHmc {
    state: Arc<Mutex<HmcState>>,
}

fn not_activated(operation: &str, name: &str) -> HypervisorError {
    HypervisorError::operation_with(
        operation,
        format!("LPAR {} is not activated", name),
        json!({ "http-status": 409, "reason": 1, "message": "The object is not in the correct state" }),
    )
}

fn apply(resources: &mut Resources, update: &ResourceUpdate) {
    if let Some(memory) = update.memory_mb {
        resources.memory_mb = memory;
    }
    if let Some(cp) = update.cp {
        resources.cp = cp;
    }
    if let Some(ifl) = update.ifl {
        resources.ifl = ifl;
    }
}

impl MockHmc {
    fn with_mode(cpc: &str, dpm: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(HmcState {
                cpc: CpcInfo {
                    name: cpc.to_uppercase(),
                    dpm_enabled: dpm,
                    cpus_cp: 4,
                    cpus_ifl: 8,
                },
                lpars: BTreeMap::new(),
                calls: Vec::new(),
                os_commands: Vec::new(),
                messages: vec!["rescue login:".to_string()],
                never_boots: false,
                reject_login: false,
                closed: false,
            })),
        }
    }

    pub fn classic(cpc: &str) -> Self {
        Self::with_mode(cpc, false)
    }

    pub fn dpm(cpc: &str) -> Self {
        Self::with_mode(cpc, true)
    }

    pub fn with_processors(self, cp: u32, ifl: u32) -> Self {
        {
            let mut state = lock(&self.state);
            state.cpc.cpus_cp = cp;
            state.cpc.cpus_ifl = ifl;
        }
        self
    }

    pub fn with_lpar(self, name: &str, status: &str) -> Self {
        lock(&self.state).lpars.insert(
            name.to_string(),
            MockLpar {
                status: status.to_string(),
                resources: Resources {
                    memory_mb: 4096,
                    cp: 0,
                    ifl: 1,
                },
                boot: None,
                volumes: Vec::new(),
            },
        );
        self
    }

    pub fn with_volume(self, lpar: &str, volume: VolumeProperties) -> Self {
        if let Some(entry) = lock(&self.state).lpars.get_mut(lpar) {
            entry.volumes.push(volume);
        }
        self
    }

    /// Loads and partition starts never reach the operating status.
    pub fn never_boots(self) -> Self {
        lock(&self.state).never_boots = true;
        self
    }

    pub fn reject_login(self) -> Self {
        lock(&self.state).reject_login = true;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    pub fn os_commands(&self) -> Vec<String> {
        lock(&self.state).os_commands.clone()
    }

    pub fn status_of(&self, lpar: &str) -> Option<String> {
        lock(&self.state).lpars.get(lpar).map(|l| l.status.clone())
    }

    pub fn resources_of(&self, lpar: &str) -> Option<Resources> {
        lock(&self.state).lpars.get(lpar).map(|l| l.resources)
    }

    pub fn boot_of(&self, lpar: &str) -> Option<PartitionBoot> {
        lock(&self.state).lpars.get(lpar).and_then(|l| l.boot.clone())
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Record `call` and run `f` on the LPAR, failing the way the HMC does
    /// for unknown CPCs and LPARs.
    fn on_lpar<T>(
        &self,
        cpc: &str,
        name: &str,
        call: String,
        f: impl FnOnce(&mut MockLpar, bool) -> Result<T>,
    ) -> Result<T> {
        let mut state = lock(&self.state);
        state.calls.push(call);
        if state.closed {
            return Err(HypervisorError::SessionClosed("HMC session was closed".to_string()));
        }
        if state.cpc.name != cpc {
            return Err(HypervisorError::operation_with(
                "find CPC",
                format!("CPC {} not found", cpc),
                json!({ "http-status": 404, "reason": 1 }),
            ));
        }
        let never_boots = state.never_boots;
        let lpar = state.lpars.get_mut(name).ok_or_else(|| {
            HypervisorError::operation_with(
                "find LPAR",
                format!("{} not found on {}", name, cpc),
                json!({ "http-status": 404, "reason": 1 }),
            )
        })?;
        f(lpar, never_boots)
    }
}

#[async_trait]
impl HmcConnector for MockHmc {
    async fn connect(
        &self,
        host: &str,
        _port: Option<u16>,
        user: &str,
        _password: &str,
        _timeout: Duration,
    ) -> Result<Arc<dyn HmcSession>> {
        let mut state = lock(&self.state);
        state.calls.push("connect".to_string());
        if state.reject_login {
            return Err(HypervisorError::AuthenticationFailed(format!("{}@{}", user, host)));
        }
        state.closed = false;
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl HmcSession for MockHmc {
    async fn cpc(&self, cpc: &str) -> Result<CpcInfo> {
        let state = lock(&self.state);
        if state.cpc.name != cpc {
            return Err(HypervisorError::operation_with(
                "find CPC",
                format!("CPC {} not found", cpc),
                json!({ "http-status": 404, "reason": 1 }),
            ));
        }
        Ok(state.cpc.clone())
    }

    async fn status(&self, cpc: &str, name: &str) -> Result<String> {
        self.on_lpar(cpc, name, format!("status {}", name), |lpar, _| Ok(lpar.status.clone()))
    }

    async fn image_profile(&self, cpc: &str, profile: &str) -> Result<Resources> {
        self.on_lpar(cpc, profile, format!("image_profile {}", profile), |lpar, _| {
            Ok(lpar.resources)
        })
    }

    async fn update_image_profile(&self, cpc: &str, profile: &str, update: &ResourceUpdate) -> Result<()> {
        self.on_lpar(cpc, profile, format!("update_image_profile {}", profile), |lpar, _| {
            apply(&mut lpar.resources, update);
            Ok(())
        })
    }

    async fn activate(&self, cpc: &str, lpar: &str) -> Result<()> {
        self.on_lpar(cpc, lpar, format!("activate {}", lpar), |lpar, _| {
            lpar.status = "not-operating".to_string();
            Ok(())
        })
    }

    async fn load(&self, cpc: &str, name: &str, devno: &str, force: bool) -> Result<()> {
        let call = format!("load {} {} force={}", name, devno, force);
        self.on_lpar(cpc, name, call, |lpar, never| {
            if lpar.status == "not-activated" {
                return Err(not_activated("load", name));
            }
            lpar.status = if never { "not-operating" } else { "operating" }.to_string();
            Ok(())
        })
    }

    async fn scsi_load(&self, cpc: &str, name: &str, devno: &str, wwpn: &str, lun: &str, force: bool) -> Result<()> {
        let call = format!("scsi_load {} {} {} {} force={}", name, devno, wwpn, lun, force);
        self.on_lpar(cpc, name, call, |lpar, never| {
            if lpar.status == "not-activated" {
                return Err(not_activated("scsi load", name));
            }
            lpar.status = if never { "not-operating" } else { "operating" }.to_string();
            Ok(())
        })
    }

    async fn stop(&self, cpc: &str, name: &str) -> Result<()> {
        self.on_lpar(cpc, name, format!("stop {}", name), |lpar, _| {
            if lpar.status == "not-activated" {
                return Err(not_activated("stop", name));
            }
            lpar.status = "not-operating".to_string();
            Ok(())
        })
    }

    async fn reset_clear(&self, cpc: &str, name: &str) -> Result<()> {
        self.on_lpar(cpc, name, format!("reset_clear {}", name), |lpar, _| {
            if lpar.status == "not-activated" {
                return Err(not_activated("reset clear", name));
            }
            Ok(())
        })
    }

    async fn partition_uri(&self, cpc: &str, partition: &str) -> Result<String> {
        self.on_lpar(cpc, partition, format!("partition_uri {}", partition), |_, _| {
            Ok(format!("/api/partitions/{}", partition.to_lowercase()))
        })
    }

    async fn partition_resources(&self, cpc: &str, partition: &str) -> Result<Resources> {
        self.on_lpar(cpc, partition, format!("partition_resources {}", partition), |lpar, _| {
            Ok(lpar.resources)
        })
    }

    async fn update_partition(&self, cpc: &str, partition: &str, update: &ResourceUpdate) -> Result<()> {
        self.on_lpar(cpc, partition, format!("update_partition {}", partition), |lpar, _| {
            apply(&mut lpar.resources, update);
            Ok(())
        })
    }

    async fn storage_volumes(&self, cpc: &str, partition: &str) -> Result<Vec<VolumeProperties>> {
        self.on_lpar(cpc, partition, format!("storage_volumes {}", partition), |lpar, _| {
            Ok(lpar.volumes.clone())
        })
    }

    async fn set_boot_device(&self, cpc: &str, partition: &str, boot: &PartitionBoot) -> Result<()> {
        self.on_lpar(cpc, partition, format!("set_boot_device {}", partition), |lpar, _| {
            lpar.boot = Some(boot.clone());
            Ok(())
        })
    }

    async fn start_partition(&self, cpc: &str, partition: &str) -> Result<()> {
        self.on_lpar(cpc, partition, format!("start_partition {}", partition), |lpar, never| {
            lpar.status = if never { "starting" } else { "active" }.to_string();
            Ok(())
        })
    }

    async fn stop_partition(&self, cpc: &str, partition: &str) -> Result<()> {
        self.on_lpar(cpc, partition, format!("stop_partition {}", partition), |lpar, _| {
            lpar.status = "stopped".to_string();
            Ok(())
        })
    }

    async fn send_os_command(&self, cpc: &str, name: &str, command: &str) -> Result<()> {
        self.on_lpar(cpc, name, format!("send_os_command {}", name), |_, _| Ok(()))?;
        lock(&self.state).os_commands.push(command.to_string());
        Ok(())
    }

    async fn os_messages(&self, cpc: &str, name: &str) -> Result<Vec<String>> {
        self.on_lpar(cpc, name, format!("os_messages {}", name), |_, _| Ok(()))?;
        Ok(lock(&self.state).messages.clone())
    }

    async fn close(&self) -> Result<()> {
        let mut state = lock(&self.state);
        state.calls.push("close".to_string());
        state.closed = true;
        Ok(())
    }
}
