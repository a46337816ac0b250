//! Power control through redundant powerman servers.
//!
//! Servers are tried strictly in configured order so the log shows which
//! management path actually fenced the node. A server that fails its TCP
//! reachability check is skipped; a server that answers but does not report
//! the node off is recorded and the next one is tried.

pub mod hostlist;

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{debug, error, info, warn};

use super::{FailureReason, FenceOutcome};
use crate::config::RedundantProxyConfig;
use crate::exec::{CommandError, CommandRunner, CommandSpec};
use crate::interrupt::InterruptFlag;

/// Powerman operations against one server.
pub trait PowermanClient: Send + Sync {
    /// Lightweight TCP reachability check of `server`.
    ///
    /// # Errors
    ///
    /// Returns a description of why the server could not be reached.
    fn reachable(&self, server: &str) -> Result<(), String>;

    /// Requests power off of `node` through `server`.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be run or reports failure.
    fn power_off(&self, server: &str, node: &str) -> Result<(), CommandError>;

    /// Queries the power state of `node` through `server`.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be run or reports failure.
    fn query(&self, server: &str, node: &str) -> Result<String, CommandError>;
}

/// [`PowermanClient`] running the `pm` client.
#[derive(Debug, Clone)]
pub struct PmClient<R> {
    runner: R,
    program: String,
    port: u16,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl<R: CommandRunner> PmClient<R> {
    /// Creates a client from the redundant-proxy configuration.
    #[must_use]
    pub fn new(runner: R, config: &RedundantProxyConfig) -> Self {
        Self {
            runner,
            program: config.pm_program.clone(),
            port: config.port,
            connect_timeout: config.connect_timeout,
            command_timeout: config.command_timeout,
        }
    }

    fn pm(&self, server: &str, flag: &str, node: &str) -> Result<String, CommandError> {
        let spec = CommandSpec::new(&self.program, self.command_timeout)
            .arg("-h")
            .arg(format!("{server}:{}", self.port))
            .arg(flag)
            .arg(node);
        let output = self.runner.run(&spec)?.into_success(&self.program)?;
        Ok(output.stdout)
    }
}

impl<R: CommandRunner> PowermanClient for PmClient<R> {
    fn reachable(&self, server: &str) -> Result<(), String> {
        // Resolution and every connect attempt share one deadline.
        let deadline = Instant::now() + self.connect_timeout;

        let target = (server.to_string(), self.port);
        let addrs = within(self.connect_timeout, move || {
            target.to_socket_addrs().map(Iterator::collect::<Vec<SocketAddr>>)
        })
        .ok_or_else(|| format!("resolving {server} timed out"))?
        .map_err(|e| format!("cannot resolve {server}: {e}"))?;

        let mut last_error = format!("{server} resolved to no addresses");
        for addr in addrs {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(format!("connect to {server} timed out"));
            }
            match TcpStream::connect_timeout(&addr, remaining) {
                Ok(_) => return Ok(()),
                Err(e) => last_error = format!("connect {addr}: {e}"),
            }
        }
        Err(last_error)
    }

    fn power_off(&self, server: &str, node: &str) -> Result<(), CommandError> {
        self.pm(server, "-0", node).map(|_| ())
    }

    fn query(&self, server: &str, node: &str) -> Result<String, CommandError> {
        self.pm(server, "-q", node)
    }
}

/// Runs `work` on a helper thread and waits at most `timeout` for it.
///
/// The system resolver has no timeout of its own; a lookup that outlives the
/// deadline is abandoned and its thread finishes in the background.
fn within<T, F>(timeout: Duration, work: F) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(work());
    });
    rx.recv_timeout(timeout).ok()
}

/// Recognises an `off:` status line naming exactly one node.
#[derive(Debug, Clone)]
pub struct OffMatcher {
    node: String,
    literal: Option<Regex>,
}

impl OffMatcher {
    /// Builds a matcher for `node`; regex metacharacters in the name are
    /// matched literally.
    #[must_use]
    pub fn new(node: &str) -> Self {
        let literal = Regex::new(&format!(r"^\s*off:\s+{}\s*$", regex::escape(node))).ok();
        Self {
            node: node.to_string(),
            literal,
        }
    }

    /// True when `output` has an `off:` line whose host list includes the
    /// node.
    #[must_use]
    pub fn is_off(&self, output: &str) -> bool {
        output.lines().any(|line| {
            if self.literal.as_ref().is_some_and(|re| re.is_match(line)) {
                return true;
            }
            line.trim_start()
                .strip_prefix("off:")
                .filter(|rest| rest.starts_with(char::is_whitespace))
                .is_some_and(|rest| hostlist::contains(rest.trim(), &self.node))
        })
    }
}

/// Redundant power-management proxy driver.
pub struct RedundantProxyDriver<P> {
    client: P,
    interrupt: InterruptFlag,
}

impl<P: PowermanClient> RedundantProxyDriver<P> {
    /// Creates a driver.
    #[must_use]
    pub const fn new(client: P, interrupt: InterruptFlag) -> Self {
        Self { client, interrupt }
    }

    /// Powers `node` off through the first server that confirms it.
    pub fn power_off_and_confirm(&self, servers: &[String], node: &str) -> FenceOutcome {
        let matcher = OffMatcher::new(node);

        for (priority, server) in servers.iter().enumerate() {
            if self.interrupt.is_raised() {
                warn!(node, server, "interrupted, abandoning remaining powerman servers");
                return FenceOutcome::Failed(FailureReason::Interrupted);
            }

            if let Err(reason) = self.client.reachable(server) {
                warn!(node, server, priority, %reason, "powerman server unreachable, skipping");
                continue;
            }

            info!(node, server, priority, "powerman power off");
            if let Err(e) = self.client.power_off(server, node) {
                warn!(node, server, error = %e, "powerman off {node} failed");
            }

            match self.client.query(server, node) {
                Ok(output) if matcher.is_off(&output) => {
                    info!(node, server, "powerman power confirmed off");
                    return FenceOutcome::Confirmed;
                },
                Ok(output) => {
                    debug!(node, server, %output, "powerman query output");
                    warn!(node, server, "powerman stat {node} not off");
                },
                Err(e) => warn!(node, server, error = %e, "powerman stat {node} failed"),
            }
        }

        error!(node, servers = servers.len(), "powerman stat {node} not off on any server");
        FenceOutcome::Failed(FailureReason::NoServerConfirmed)
    }

    /// Checks one server without changing power state: reachability, then a
    /// status query for `node`.
    ///
    /// # Errors
    ///
    /// Returns a description of the failed step.
    pub fn check_server(&self, server: &str, node: &str) -> Result<(), String> {
        self.client.reachable(server)?;
        self.client
            .query(server, node)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// Per-server scripted behaviour.
    #[derive(Clone)]
    struct Server {
        up: bool,
        query: Result<&'static str, &'static str>,
    }

    struct FakePowerman {
        servers: HashMap<&'static str, Server>,
        calls: Mutex<Vec<String>>,
    }

    impl FakePowerman {
        fn new(servers: &[(&'static str, Server)]) -> Self {
            Self {
                servers: servers.iter().cloned().collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl PowermanClient for FakePowerman {
        fn reachable(&self, server: &str) -> Result<(), String> {
            self.calls.lock().unwrap().push(format!("ping {server}"));
            if self.servers[server].up {
                Ok(())
            } else {
                Err("connection refused".to_string())
            }
        }

        fn power_off(&self, server: &str, node: &str) -> Result<(), CommandError> {
            self.calls.lock().unwrap().push(format!("off {server} {node}"));
            Ok(())
        }

        fn query(&self, server: &str, node: &str) -> Result<String, CommandError> {
            self.calls.lock().unwrap().push(format!("query {server} {node}"));
            self.servers[server]
                .query
                .map(str::to_string)
                .map_err(|e| CommandError::Failed {
                    program: "pm".to_string(),
                    code: Some(1),
                    stderr: e.to_string(),
                })
        }
    }

    fn servers(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    const OFF_RADIA: &str = "on:      \noff:     radia[1-5]\nunknown: \n";

    #[test]
    fn skips_unreachable_server_and_confirms_on_next() {
        let fake = FakePowerman::new(&[
            ("v1", Server { up: false, query: Ok("") }),
            ("172.21.1.51", Server { up: true, query: Ok(OFF_RADIA) }),
        ]);
        let driver = RedundantProxyDriver::new(fake, InterruptFlag::new());
        let outcome = driver.power_off_and_confirm(&servers(&["v1", "172.21.1.51"]), "radia2");
        assert_eq!(outcome, FenceOutcome::Confirmed);
        assert_eq!(
            driver.client.calls(),
            [
                "ping v1",
                "ping 172.21.1.51",
                "off 172.21.1.51 radia2",
                "query 172.21.1.51 radia2"
            ]
        );
    }

    #[test]
    fn first_confirming_server_wins() {
        let fake = FakePowerman::new(&[
            ("a", Server { up: true, query: Ok("off: n1\n") }),
            ("b", Server { up: true, query: Ok("off: n1\n") }),
        ]);
        let driver = RedundantProxyDriver::new(fake, InterruptFlag::new());
        assert_eq!(
            driver.power_off_and_confirm(&servers(&["a", "b"]), "n1"),
            FenceOutcome::Confirmed
        );
        assert!(!driver.client.calls().iter().any(|c| c.ends_with(" b") || c.contains(" b ")));
    }

    #[test]
    fn unconfirmed_servers_exhaust_to_failure() {
        let fake = FakePowerman::new(&[
            ("a", Server { up: true, query: Ok("on: n1\noff: \n") }),
            ("b", Server { up: true, query: Err("pm: cannot connect") }),
            ("c", Server { up: false, query: Ok("off: n1\n") }),
        ]);
        let driver = RedundantProxyDriver::new(fake, InterruptFlag::new());
        assert_eq!(
            driver.power_off_and_confirm(&servers(&["a", "b", "c"]), "n1"),
            FenceOutcome::Failed(FailureReason::NoServerConfirmed)
        );
    }

    #[test]
    fn interrupt_abandons_remaining_servers() {
        let interrupt = InterruptFlag::new();
        interrupt.raise();
        let fake = FakePowerman::new(&[("a", Server { up: true, query: Ok("off: n1") })]);
        let driver = RedundantProxyDriver::new(fake, interrupt);
        assert_eq!(
            driver.power_off_and_confirm(&servers(&["a"]), "n1"),
            FenceOutcome::Failed(FailureReason::Interrupted)
        );
        assert!(driver.client.calls().is_empty());
    }

    #[test]
    fn matcher_accepts_exact_and_ranged_names() {
        assert!(OffMatcher::new("radia2").is_off(OFF_RADIA));
        assert!(OffMatcher::new("radia2").is_off("off:\tradia2\n"));
        assert!(OffMatcher::new("gw").is_off("off: gw,n[1-2]"));
    }

    #[test]
    fn matcher_rejects_other_nodes() {
        assert!(!OffMatcher::new("radia2").is_off("off: radia20\n"));
        assert!(!OffMatcher::new("radia2").is_off("off: xradia2\n"));
        assert!(!OffMatcher::new("radia2").is_off("on: radia2\n"));
        assert!(!OffMatcher::new("radia2").is_off("off: radia[3-5]\n"));
        assert!(!OffMatcher::new("radia2").is_off("offline: radia2\n"));
    }

    #[test]
    fn matcher_treats_metacharacters_literally() {
        // Unescaped, "n.1" would match "nx1" and "n+" would match "nnn".
        assert!(!OffMatcher::new("n.1").is_off("off: nx1\n"));
        assert!(OffMatcher::new("n.1").is_off("off: n.1\n"));
        assert!(!OffMatcher::new("n+").is_off("off: nnn\n"));
        assert!(!OffMatcher::new("n1|n2").is_off("off: n2\n"));
        assert!(OffMatcher::new("n1|n2").is_off("off: n1|n2\n"));
    }

    fn pm_client(port: u16) -> PmClient<crate::exec::SystemCommandRunner> {
        let config = RedundantProxyConfig {
            port,
            connect_timeout: Duration::from_secs(2),
            ..RedundantProxyConfig::default()
        };
        PmClient::new(crate::exec::SystemCommandRunner, &config)
    }

    #[test]
    fn within_gives_up_on_slow_work() {
        let started = Instant::now();
        let result = within(Duration::from_millis(50), || {
            std::thread::sleep(Duration::from_secs(2));
            7
        });
        assert_eq!(result, None);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn within_returns_fast_work() {
        assert_eq!(within(Duration::from_secs(1), || 7), Some(7));
    }

    #[test]
    #[cfg_attr(miri, ignore)] // Miri can't open sockets
    fn listening_server_is_reachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert_eq!(pm_client(port).reachable("127.0.0.1"), Ok(()));
    }

    #[test]
    #[cfg_attr(miri, ignore)] // Miri can't open sockets
    fn closed_port_is_unreachable() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = pm_client(port).reachable("127.0.0.1").unwrap_err();
        assert!(err.starts_with("connect 127.0.0.1:"), "{err}");
    }

    #[test]
    #[cfg_attr(miri, ignore)] // Miri can't resolve names
    fn unresolvable_server_is_unreachable() {
        let err = pm_client(10101).reachable("no-such-host.invalid").unwrap_err();
        assert!(
            err.starts_with("cannot resolve") || err.starts_with("resolving"),
            "{err}"
        );
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(128))]

        /// A node is never confirmed off by a line naming a different node.
        #[test]
        fn prop_no_false_match(node in "[a-z0-9.*+?|()^$-]{1,8}", other in "[a-z0-9.*+?|()^$-]{1,8}") {
            proptest::prop_assume!(node != other);
            let line = format!("off: {other}\n");
            proptest::prop_assert!(!OffMatcher::new(&node).is_off(&line));
        }
    }
}
