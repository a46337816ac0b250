//! Read-only self-test of every configured node.
//!
//! For each bound node the harness checks the liveness channel, then the
//! bound backend's status path. Nothing here changes power state. After the
//! first vCenter login failure the remaining vCenter checks are skipped so a
//! bad password cannot lock the account out; other backends keep going.

use std::fmt;

use tracing::{info, warn};

use crate::backend::vsphere::VirtCheckError;
use crate::backend::{Backends, BmcClient, PowermanClient, VirtApi};
use crate::binding::{BackendBinding, BindingTable};
use crate::probe::LivenessProbe;

/// Largest exit code the harness reports.
const MAX_EXIT_CODE: usize = 100;

/// Result of one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    /// The check succeeded.
    Pass,
    /// The check failed.
    Fail,
    /// The check was not run.
    Skip,
}

impl CheckStatus {
    /// Report-line tag.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Skip => "SKIP",
        }
    }
}

/// One line of the self-test report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckLine {
    /// Outcome.
    pub status: CheckStatus,
    /// Check name (`ssh`, `ipmi stat`, `powerman`, `vsphere`).
    pub check: String,
    /// What was checked.
    pub subject: String,
    /// Failure or skip reason.
    pub detail: Option<String>,
}

impl fmt::Display for CheckLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.status.as_str(), self.check, self.subject)?;
        if let Some(detail) = &self.detail {
            write!(f, " ({detail})")?;
        }
        Ok(())
    }
}

/// Collected self-test results, in check order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelfTestReport {
    lines: Vec<CheckLine>,
}

impl SelfTestReport {
    fn record(&mut self, status: CheckStatus, check: &str, subject: String, detail: Option<String>) {
        match status {
            CheckStatus::Pass => info!(check, %subject, "self-test check passed"),
            CheckStatus::Fail => warn!(check, %subject, detail = detail.as_deref(), "self-test check failed"),
            CheckStatus::Skip => info!(check, %subject, detail = detail.as_deref(), "self-test check skipped"),
        }
        self.lines.push(CheckLine {
            status,
            check: check.to_string(),
            subject,
            detail,
        });
    }

    fn record_result<T>(&mut self, check: &str, subject: String, result: Result<T, String>) {
        match result {
            Ok(_) => self.record(CheckStatus::Pass, check, subject, None),
            Err(why) => self.record(CheckStatus::Fail, check, subject, Some(why)),
        }
    }

    /// Every line, in check order.
    #[must_use]
    pub fn lines(&self) -> &[CheckLine] {
        &self.lines
    }

    fn count(&self, status: CheckStatus) -> usize {
        self.lines.iter().filter(|l| l.status == status).count()
    }

    /// Number of passed checks.
    #[must_use]
    pub fn passed(&self) -> usize {
        self.count(CheckStatus::Pass)
    }

    /// Number of failed checks.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(CheckStatus::Fail)
    }

    /// Number of skipped checks.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.count(CheckStatus::Skip)
    }

    /// `<passed> passed, <failed> failed, <skipped> skipped`.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} passed, {} failed, {} skipped",
            self.passed(),
            self.failed(),
            self.skipped()
        )
    }

    /// Failed-check count, capped so it fits an exit status.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        u8::try_from(self.failed().min(MAX_EXIT_CODE)).unwrap_or(u8::MAX)
    }
}

/// Runs every read-only check for every bound node.
pub fn test_all<B, P, V>(
    bindings: &BindingTable,
    probe: &dyn LivenessProbe,
    backends: &Backends<B, P, V>,
) -> SelfTestReport
where
    B: BmcClient,
    P: PowermanClient,
    V: VirtApi,
{
    let mut report = SelfTestReport::default();
    let mut vsphere_auth_failed = false;

    info!(nodes = bindings.len(), "self-test started");
    for entry in bindings.entries() {
        let node = entry.address.as_str();

        report.record_result(
            "ssh",
            node.to_string(),
            probe.check_channel(node).map_err(|e| e.reason),
        );

        match &entry.backend {
            BackendBinding::DirectPower { bmc } => {
                report.record_result("ipmi stat", bmc.clone(), backends.direct.check_status(bmc));
            },
            BackendBinding::RedundantProxy(target) => {
                for server in &target.servers {
                    report.record_result(
                        "powerman",
                        format!("{server} {}", target.node),
                        backends.proxy.check_server(server, &target.node),
                    );
                }
            },
            BackendBinding::VirtualizedHost(target) => {
                let subject = format!("{}:{}", target.api_host, target.guest_id);
                if vsphere_auth_failed {
                    report.record(
                        CheckStatus::Skip,
                        "vsphere",
                        subject,
                        Some("earlier authentication failure".to_string()),
                    );
                    continue;
                }
                let result = backends.virtualized.check(&target.api_host, &target.guest_id);
                if matches!(result, Err(VirtCheckError::Auth(_))) {
                    vsphere_auth_failed = true;
                }
                report.record_result("vsphere", subject, result.map_err(|e| e.to_string()));
            },
        }
    }
    info!(summary = %report.summary(), "self-test finished");
    report
}
