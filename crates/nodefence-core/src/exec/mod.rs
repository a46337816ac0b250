//! Bounded external command execution.
//!
//! Every external action the fencing engine takes (ssh, ipmitool, pm) goes
//! through the [`CommandRunner`] trait so drivers can be exercised against
//! fakes. [`SystemCommandRunner`] is the production implementation: it spawns
//! the program directly (no shell), drains stdout and stderr on reader
//! threads, and kills the child once the per-command timeout expires.

pub mod shell;

use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use wait_timeout::ChildExt;

/// Maximum bytes captured from a command's stdout.
const MAX_STDOUT_SIZE: u64 = 1024 * 1024;

/// Maximum bytes captured from a command's stderr.
const MAX_STDERR_SIZE: u64 = 64 * 1024;

/// Errors raised while running an external command.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The program could not be started.
    #[error("failed to spawn {program}: {reason}")]
    SpawnFailed {
        /// Program that failed to start.
        program: String,
        /// Underlying OS error.
        reason: String,
    },

    /// The program did not exit within its timeout and was killed.
    #[error("{program} timed out after {timeout_secs}s")]
    Timeout {
        /// Program that timed out.
        program: String,
        /// Timeout that was exceeded.
        timeout_secs: u64,
    },

    /// Waiting on the child or reading its pipes failed.
    #[error("i/o error running {program}: {reason}")]
    Io {
        /// Program being run.
        program: String,
        /// Underlying error.
        reason: String,
    },

    /// The program ran but exited unsuccessfully.
    #[error("{program} exited with {code:?}: {stderr}")]
    Failed {
        /// Program that failed.
        program: String,
        /// Exit code, if the process was not killed by a signal.
        code: Option<i32>,
        /// Captured stderr, trimmed.
        stderr: String,
    },
}

/// A fully specified command invocation.
#[derive(Debug)]
pub struct CommandSpec {
    /// Program to execute (looked up on `PATH` when not absolute).
    pub program: String,
    /// Arguments, passed verbatim without shell interpretation.
    pub args: Vec<String>,
    /// Environment variables carrying secret material (e.g. BMC passwords),
    /// kept out of argv so they do not show up in process listings.
    pub secret_env: Vec<(String, SecretString)>,
    /// Hard ceiling on the command's wall-clock time.
    pub timeout: Duration,
}

impl CommandSpec {
    /// Creates an invocation of `program` with no arguments.
    #[must_use]
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            secret_env: Vec::new(),
            timeout,
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Adds a secret environment variable.
    #[must_use]
    pub fn secret_env(mut self, key: impl Into<String>, value: SecretString) -> Self {
        self.secret_env.push((key.into(), value));
        self
    }
}

/// Output of a command that ran to completion (successfully or not).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when terminated by a signal.
    pub code: Option<i32>,
    /// Captured stdout, lossily decoded.
    pub stdout: String,
    /// Captured stderr, lossily decoded.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns true when the command exited with status zero.
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Converts a non-zero exit into [`CommandError::Failed`].
    pub fn into_success(self, program: &str) -> Result<Self, CommandError> {
        if self.success() {
            Ok(self)
        } else {
            Err(CommandError::Failed {
                program: program.to_string(),
                code: self.code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Runs external commands.
///
/// Implementations must enforce `spec.timeout`; a runner that can block
/// forever would let one dead endpoint stall a fencing decision.
pub trait CommandRunner: Send + Sync {
    /// Runs the command and returns its output, whatever the exit status.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be spawned, times out, or its
    /// output cannot be collected.
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError>;
}

/// [`CommandRunner`] backed by `std::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        let io_error = |e: &dyn std::fmt::Display| CommandError::Io {
            program: spec.program.clone(),
            reason: e.to_string(),
        };

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &spec.secret_env {
            cmd.env(key, value.expose_secret());
        }

        let mut child = cmd.spawn().map_err(|e| CommandError::SpawnFailed {
            program: spec.program.clone(),
            reason: e.to_string(),
        })?;

        // Pipes are drained concurrently with the wait so a chatty child
        // cannot block on a full pipe buffer.
        let stdout_rx = drain_pipe(child.stdout.take(), MAX_STDOUT_SIZE);
        let stderr_rx = drain_pipe(child.stderr.take(), MAX_STDERR_SIZE);

        let status: Option<ExitStatus> = child
            .wait_timeout(spec.timeout)
            .map_err(|e| io_error(&e))?;

        let Some(status) = status else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(CommandError::Timeout {
                program: spec.program.clone(),
                timeout_secs: spec.timeout.as_secs(),
            });
        };

        let stdout = stdout_rx
            .recv()
            .map_err(|e| io_error(&e))?
            .map_err(|e| io_error(&e))?;
        let stderr = stderr_rx
            .recv()
            .map_err(|e| io_error(&e))?
            .map_err(|e| io_error(&e))?;

        Ok(CommandOutput {
            code: status.code(),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}

fn drain_pipe<R>(pipe: Option<R>, limit: u64) -> mpsc::Receiver<std::io::Result<Vec<u8>>>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    match pipe {
        Some(pipe) => {
            std::thread::spawn(move || {
                let mut buffer = Vec::new();
                let result = pipe
                    .take(limit)
                    .read_to_end(&mut buffer)
                    .map(|_| buffer);
                let _ = tx.send(result);
            });
        },
        None => {
            let _ = tx.send(Ok(Vec::new()));
        },
    }
    rx
}
