//! Liveness probe: does the target node still hold the resource mounted?
//!
//! The probe runs one short script on the target over ssh. The script wraps
//! its search in begin/end markers and announces every status file it
//! actually scanned; the transcript is trusted only when all of those markers
//! are present. A truncated or garbled transcript is
//! [`LivenessResult::ReachableAmbiguous`], never evidence that the resource
//! is gone.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::ProbeConfig;
use crate::exec::{CommandOutput, CommandRunner, CommandSpec, shell};

/// First line of a complete transcript.
pub const BEGIN_MARKER: &str = "NODEFENCE-BEGIN";

/// Last line of a complete transcript.
pub const END_MARKER: &str = "NODEFENCE-END";

/// Prefix of the line announcing a scanned status file.
pub const SCAN_MARKER: &str = "NODEFENCE-SCAN";

/// ssh exits with 255 when the connection itself failed.
const SSH_CONNECTION_FAILURE: i32 = 255;

/// What the probe learned about the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessResult {
    /// The remote command channel could not be established.
    Unreachable,
    /// The channel worked and the resource is present.
    ReachableMounted,
    /// The channel worked and the resource is definitively absent.
    ReachableUnmounted,
    /// The channel worked but the transcript is incomplete.
    ReachableAmbiguous,
}

impl LivenessResult {
    /// Short name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unreachable => "unreachable",
            Self::ReachableMounted => "mounted",
            Self::ReachableUnmounted => "unmounted",
            Self::ReachableAmbiguous => "ambiguous",
        }
    }
}

impl std::fmt::Display for LivenessResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The remote command channel could not be used.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("remote channel to {node} unavailable: {reason}")]
pub struct ChannelError {
    /// Target node.
    pub node: String,
    /// Why the channel failed.
    pub reason: String,
}

/// Remote command execution capability.
pub trait RemoteShell: Send + Sync {
    /// Runs `script` on `node` through the remote user's shell.
    ///
    /// Returns the transcript whatever the script's exit status; an error
    /// means no channel could be established.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] when the node cannot be reached.
    fn execute(&self, node: &str, script: &str) -> Result<CommandOutput, ChannelError>;
}

/// [`RemoteShell`] over the OpenSSH client.
#[derive(Debug, Clone)]
pub struct SshChannel<R> {
    runner: R,
    config: ProbeConfig,
}

impl<R: CommandRunner> SshChannel<R> {
    /// Creates a channel that runs ssh through `runner`.
    #[must_use]
    pub const fn new(runner: R, config: ProbeConfig) -> Self {
        Self { runner, config }
    }

    fn command(&self, node: &str, script: &str) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.config.ssh_program, self.config.command_timeout)
            .args(["-o", "BatchMode=yes"])
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                self.config.connect_timeout.as_secs().max(1)
            ));
        if let Some(identity) = &self.config.identity_file {
            spec = spec.arg("-i").arg(identity.display().to_string());
        }
        if let Some(user) = &self.config.user {
            spec = spec.arg("-l").arg(user);
        }
        spec.arg(node).arg(script)
    }
}

impl<R: CommandRunner> RemoteShell for SshChannel<R> {
    fn execute(&self, node: &str, script: &str) -> Result<CommandOutput, ChannelError> {
        let output = self
            .runner
            .run(&self.command(node, script))
            .map_err(|e| ChannelError {
                node: node.to_string(),
                reason: e.to_string(),
            })?;

        if output.code == Some(SSH_CONNECTION_FAILURE) {
            return Err(ChannelError {
                node: node.to_string(),
                reason: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }
}

/// Liveness operations used by the orchestrator and the self-test harness.
pub trait LivenessProbe {
    /// Determines whether `node` still holds resource `rid`.
    fn probe(&self, node: &str, rid: &str) -> LivenessResult;

    /// Checks only that the remote command channel works.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] when the channel cannot be used.
    fn check_channel(&self, node: &str) -> Result<(), ChannelError>;
}

/// [`LivenessProbe`] that searches status files over a [`RemoteShell`].
#[derive(Debug, Clone)]
pub struct LivenessProber<S> {
    shell: S,
    status_locations: Vec<PathBuf>,
}

impl<S: RemoteShell> LivenessProber<S> {
    /// Creates a prober searching `status_locations` on the target.
    #[must_use]
    pub const fn new(shell: S, status_locations: Vec<PathBuf>) -> Self {
        Self {
            shell,
            status_locations,
        }
    }
}

impl<S: RemoteShell> LivenessProbe for LivenessProber<S> {
    fn probe(&self, node: &str, rid: &str) -> LivenessResult {
        let script = probe_script(&self.status_locations, rid);
        debug!(node, rid, %script, "running liveness probe");

        let result = match self.shell.execute(node, &script) {
            Ok(output) => parse_transcript(&output.stdout, rid, &self.status_locations),
            Err(e) => {
                warn!(node, rid, error = %e, "liveness probe could not reach node");
                LivenessResult::Unreachable
            },
        };

        info!(node, rid, result = %result, "liveness probe finished");
        result
    }

    fn check_channel(&self, node: &str) -> Result<(), ChannelError> {
        let output = self.shell.execute(node, "true")?;
        if output.success() {
            Ok(())
        } else {
            Err(ChannelError {
                node: node.to_string(),
                reason: format!("remote no-op exited with {:?}", output.code),
            })
        }
    }
}

/// Line that marks `rid` as mounted.
fn rid_token(rid: &str) -> String {
    format!("rid:{rid}")
}

/// `NODEFENCE-SCAN <path>` line for one searched location.
fn scan_line(location: &Path) -> String {
    format!("{SCAN_MARKER} {}", location.to_string_lossy())
}

/// Builds the remote script for `rid`.
///
/// Every interpolated value is quoted for the remote shell. A location's
/// scan line is printed only when grep itself completed the search (exit 0
/// for a match, 1 for none); a missing grep, an unreadable file or a
/// directory leaves the line out.
#[must_use]
pub fn probe_script(status_locations: &[PathBuf], rid: &str) -> String {
    let files = shell::join(
        status_locations
            .iter()
            .map(|p| p.to_string_lossy().into_owned()),
    );
    format!(
        "echo {BEGIN_MARKER}; for f in {files}; do grep -F -e {pattern} -- \"$f\"; rc=$?; if [ \"$rc\" -le 1 ]; then echo \"{SCAN_MARKER} $f\"; fi; done; echo {END_MARKER}",
        pattern = shell::quote(&rid_token(rid)),
    )
}

/// Classifies a probe transcript.
///
/// The transcript is trusted only when it is framed by both markers and
/// carries a scan line for every location in `status_locations`.
#[must_use]
pub fn parse_transcript(
    stdout: &str,
    rid: &str,
    status_locations: &[PathBuf],
) -> LivenessResult {
    let lines: Vec<&str> = stdout.lines().map(str::trim_end).collect();

    let Some(begin) = lines.iter().position(|l| *l == BEGIN_MARKER) else {
        return LivenessResult::ReachableAmbiguous;
    };
    let body = &lines[begin + 1..];

    let Some(end) = body.iter().position(|l| *l == END_MARKER) else {
        return LivenessResult::ReachableAmbiguous;
    };
    let body = &body[..end];

    let all_scanned = !status_locations.is_empty()
        && status_locations.iter().all(|location| {
            let expected = scan_line(location);
            body.iter().any(|l| *l == expected)
        });
    if !all_scanned {
        return LivenessResult::ReachableAmbiguous;
    }

    // Substring match over every body line: a near-miss rid errs towards
    // fencing.
    let token = rid_token(rid);
    if body.iter().any(|l| l.contains(&token)) {
        LivenessResult::ReachableMounted
    } else {
        LivenessResult::ReachableUnmounted
    }
}
