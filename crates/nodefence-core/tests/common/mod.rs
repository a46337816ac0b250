//! Fake transports shared by the integration tests.
//!
//! Every fake appends to one [`CallLog`] so a test can assert on the exact
//! sequence of external actions across the prober and all three backends.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nodefence_core::backend::vsphere::{ApiError, SessionToken};
use nodefence_core::backend::{
    Backends, BmcClient, DirectPowerDriver, PowermanClient, RedundantProxyDriver, VirtApi,
    VirtualizedHostDriver,
};
use nodefence_core::config::{DirectPowerConfig, VirtualizedHostConfig};
use nodefence_core::credentials::{CredentialConfig, Credentials};
use nodefence_core::exec::{CommandError, CommandOutput};
use nodefence_core::interrupt::InterruptFlag;
use nodefence_core::probe::{
    BEGIN_MARKER, ChannelError, END_MARKER, LivenessProber, RemoteShell, SCAN_MARKER,
};
use secrecy::SecretString;

/// Ordered record of every external action.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, call: impl Into<String>) {
        self.0.lock().unwrap().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }
}

/// Builds a probe transcript around `body` lines.
pub fn transcript(body: &[&str]) -> String {
    let mut out = vec![BEGIN_MARKER.to_string(), format!("{SCAN_MARKER} /proc/mounts")];
    out.extend(body.iter().map(|l| (*l).to_string()));
    out.push(END_MARKER.to_string());
    out.join("\n") + "\n"
}

/// How a node answers over the remote shell.
#[derive(Debug, Clone)]
pub enum Remote {
    /// No channel can be established.
    Down,
    /// Channel works; probe scripts print this stdout.
    Up(String),
}

/// [`RemoteShell`] answering from a per-node table.
pub struct ScriptedShell {
    nodes: HashMap<String, Remote>,
    log: CallLog,
}

impl ScriptedShell {
    pub fn new(nodes: &[(&str, Remote)], log: &CallLog) -> Self {
        Self {
            nodes: nodes
                .iter()
                .map(|(n, r)| ((*n).to_string(), r.clone()))
                .collect(),
            log: log.clone(),
        }
    }
}

impl RemoteShell for ScriptedShell {
    fn execute(&self, node: &str, script: &str) -> Result<CommandOutput, ChannelError> {
        self.log.push(format!("ssh {node}"));
        match self.nodes.get(node) {
            Some(Remote::Up(stdout)) => Ok(CommandOutput {
                code: Some(0),
                stdout: if script == "true" {
                    String::new()
                } else {
                    stdout.clone()
                },
                stderr: String::new(),
            }),
            Some(Remote::Down) | None => Err(ChannelError {
                node: node.to_string(),
                reason: "Connection timed out".to_string(),
            }),
        }
    }
}

pub fn prober(nodes: &[(&str, Remote)], log: &CallLog) -> LivenessProber<ScriptedShell> {
    LivenessProber::new(ScriptedShell::new(nodes, log), vec!["/proc/mounts".into()])
}

fn command_failed(program: &str, stderr: &str) -> CommandError {
    CommandError::Failed {
        program: program.to_string(),
        code: Some(1),
        stderr: stderr.to_string(),
    }
}

/// [`BmcClient`] replaying scripted status reports per BMC.
pub struct FakeBmc {
    statuses: Mutex<HashMap<String, VecDeque<String>>>,
    unreachable: HashSet<String>,
    log: CallLog,
}

impl FakeBmc {
    pub fn new(log: &CallLog) -> Self {
        Self {
            statuses: Mutex::new(HashMap::new()),
            unreachable: HashSet::new(),
            log: log.clone(),
        }
    }

    #[must_use]
    pub fn with_statuses(self, bmc: &str, statuses: &[&str]) -> Self {
        self.statuses.lock().unwrap().insert(
            bmc.to_string(),
            statuses.iter().map(|s| (*s).to_string()).collect(),
        );
        self
    }

    #[must_use]
    pub fn with_unreachable(mut self, bmc: &str) -> Self {
        self.unreachable.insert(bmc.to_string());
        self
    }
}

impl BmcClient for FakeBmc {
    fn power_off(&self, bmc: &str, _credentials: Option<&Credentials>) -> Result<(), CommandError> {
        self.log.push(format!("ipmi off {bmc}"));
        if self.unreachable.contains(bmc) {
            return Err(command_failed("ipmitool", "Unable to establish IPMI v2 session"));
        }
        Ok(())
    }

    fn power_status(
        &self,
        bmc: &str,
        _credentials: Option<&Credentials>,
    ) -> Result<String, CommandError> {
        self.log.push(format!("ipmi status {bmc}"));
        if self.unreachable.contains(bmc) {
            return Err(command_failed("ipmitool", "Unable to establish IPMI v2 session"));
        }
        let mut statuses = self.statuses.lock().unwrap();
        let queue = statuses.entry(bmc.to_string()).or_default();
        // The last scripted report repeats once the script runs out.
        let report = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        Ok(report.unwrap_or_else(|| "Chassis Power is on".to_string()))
    }
}

/// [`PowermanClient`] with a fixed set of reachable servers.
pub struct FakePowerman {
    up: HashSet<String>,
    query_output: String,
    log: CallLog,
}

impl FakePowerman {
    pub fn new(up: &[&str], query_output: &str, log: &CallLog) -> Self {
        Self {
            up: up.iter().map(|s| (*s).to_string()).collect(),
            query_output: query_output.to_string(),
            log: log.clone(),
        }
    }
}

impl PowermanClient for FakePowerman {
    fn reachable(&self, server: &str) -> Result<(), String> {
        self.log.push(format!("pm connect {server}"));
        if self.up.contains(server) {
            Ok(())
        } else {
            Err(format!("connect to {server}:10101 timed out"))
        }
    }

    fn power_off(&self, server: &str, node: &str) -> Result<(), CommandError> {
        self.log.push(format!("pm off {server} {node}"));
        Ok(())
    }

    fn query(&self, server: &str, node: &str) -> Result<String, CommandError> {
        self.log.push(format!("pm query {server} {node}"));
        Ok(self.query_output.clone())
    }
}

/// [`VirtApi`] with a scripted login result and guest state.
pub struct FakeVirt {
    login_ok: bool,
    state: String,
    log: CallLog,
}

impl FakeVirt {
    pub fn new(login_ok: bool, state: &str, log: &CallLog) -> Self {
        Self {
            login_ok,
            state: state.to_string(),
            log: log.clone(),
        }
    }
}

impl VirtApi for FakeVirt {
    fn login(&self, host: &str, _credentials: &Credentials) -> Result<SessionToken, ApiError> {
        self.log.push(format!("vsphere login {host}"));
        if self.login_ok {
            Ok(SessionToken::new("session-1"))
        } else {
            Err(ApiError::Api {
                status: 401,
                message: "com.vmware.vapi.std.errors.unauthenticated".to_string(),
            })
        }
    }

    fn power_off(&self, host: &str, _session: &SessionToken, guest: &str) -> Result<(), ApiError> {
        self.log.push(format!("vsphere off {host} {guest}"));
        Ok(())
    }

    fn power_state(
        &self,
        host: &str,
        _session: &SessionToken,
        guest: &str,
    ) -> Result<String, ApiError> {
        self.log.push(format!("vsphere state {host} {guest}"));
        Ok(self.state.clone())
    }

    fn logout(&self, host: &str, _session: &SessionToken) -> Result<(), ApiError> {
        self.log.push(format!("vsphere logout {host}"));
        Ok(())
    }
}

pub fn direct_config(retries: u32) -> DirectPowerConfig {
    DirectPowerConfig {
        status_retries: retries,
        status_wait: Duration::ZERO,
        ..DirectPowerConfig::default()
    }
}

pub fn virtualized_config() -> VirtualizedHostConfig {
    VirtualizedHostConfig {
        credentials: CredentialConfig {
            username: "fence@vsphere.local".to_string(),
            password: Some(SecretString::from("s3cret".to_string())),
            password_base64: None,
        },
        settle: Duration::ZERO,
        ..VirtualizedHostConfig::default()
    }
}

pub fn backends(
    bmc: FakeBmc,
    pm: FakePowerman,
    virt: FakeVirt,
    retries: u32,
) -> Backends<FakeBmc, FakePowerman, FakeVirt> {
    let interrupt = InterruptFlag::new();
    Backends {
        direct: DirectPowerDriver::new(bmc, &direct_config(retries), interrupt.clone()),
        proxy: RedundantProxyDriver::new(pm, interrupt.clone()),
        virtualized: VirtualizedHostDriver::new(virt, &virtualized_config(), interrupt),
    }
}
