//! Power-off backends and the fencing outcome they report.
//!
//! Each driver owns the retries of its own protocol (status polling, server
//! failover) and reports exactly one [`FenceOutcome`]. Nothing above the
//! driver retries: a node has one bound backend, so there is nothing to fail
//! over to.

pub mod ipmi;
pub mod powerman;
pub mod vsphere;

use std::fmt;

pub use ipmi::{BmcClient, DirectPowerDriver, IpmitoolClient};
pub use powerman::{PmClient, PowermanClient, RedundantProxyDriver};
pub use vsphere::{RestVirtApi, VirtApi, VirtualizedHostDriver};

use crate::binding::BackendBinding;

/// Why no power-off was attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The probe proved the resource is not mounted on the target.
    NotMounted,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotMounted => f.write_str("not-mounted"),
        }
    }
}

/// Why fencing did not reach a confirmed power-off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The request itself is unusable.
    InvalidRequest(String),
    /// No binding exists for the target address.
    UnknownBackend,
    /// Configured credentials did not decode.
    BadCredentials(String),
    /// The power-off command itself failed.
    CommandError(String),
    /// Power-off was issued but status never read off.
    NotConfirmedOff(String),
    /// Every proxy server was tried without a confirmed off.
    NoServerConfirmed,
    /// Authentication to the management API failed.
    AuthError(String),
    /// An interrupt arrived before power-off was confirmed.
    Interrupted,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRequest(why) => write!(f, "invalid-request: {why}"),
            Self::UnknownBackend => f.write_str("unknown-backend"),
            Self::BadCredentials(why) => write!(f, "bad-credentials: {why}"),
            Self::CommandError(why) => write!(f, "command-error: {why}"),
            Self::NotConfirmedOff(why) => write!(f, "not-confirmed-off: {why}"),
            Self::NoServerConfirmed => f.write_str("no-server-confirmed"),
            Self::AuthError(why) => write!(f, "auth-error: {why}"),
            Self::Interrupted => f.write_str("interrupted"),
        }
    }
}

/// Terminal result of one fencing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FenceOutcome {
    /// No power-off attempted.
    Skipped(SkipReason),
    /// Power-off attempted and verified.
    Confirmed,
    /// Power-off not confirmed, or preconditions unmet.
    Failed(FailureReason),
}

impl FenceOutcome {
    /// True for `Confirmed` and `Skipped`.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }
}

impl fmt::Display for FenceOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skipped(reason) => write!(f, "skipped ({reason})"),
            Self::Confirmed => f.write_str("confirmed"),
            Self::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

/// Power-off capability the orchestrator drives.
pub trait FenceBackend {
    /// Checks everything that can be checked without touching the network.
    ///
    /// # Errors
    ///
    /// Returns the failure to report when the backend cannot be used.
    fn preflight(&self, binding: &BackendBinding) -> Result<(), FailureReason>;

    /// Powers the bound node off and confirms it is off.
    fn power_off_and_confirm(&self, binding: &BackendBinding) -> FenceOutcome;
}

/// The three drivers, dispatched on the binding's kind.
pub struct Backends<B, P, V> {
    /// Direct power control driver.
    pub direct: DirectPowerDriver<B>,
    /// Redundant proxy driver.
    pub proxy: RedundantProxyDriver<P>,
    /// Virtualized host driver.
    pub virtualized: VirtualizedHostDriver<V>,
}

impl<B, P, V> FenceBackend for Backends<B, P, V>
where
    B: BmcClient,
    P: PowermanClient,
    V: VirtApi,
{
    fn preflight(&self, binding: &BackendBinding) -> Result<(), FailureReason> {
        match binding {
            BackendBinding::DirectPower { .. } => self.direct.preflight(),
            BackendBinding::RedundantProxy(_) => Ok(()),
            BackendBinding::VirtualizedHost(_) => self.virtualized.preflight(),
        }
    }

    fn power_off_and_confirm(&self, binding: &BackendBinding) -> FenceOutcome {
        match binding {
            BackendBinding::DirectPower { bmc } => self.direct.power_off_and_confirm(bmc),
            BackendBinding::RedundantProxy(target) => {
                self.proxy.power_off_and_confirm(&target.servers, &target.node)
            },
            BackendBinding::VirtualizedHost(target) => self
                .virtualized
                .power_off_and_confirm(&target.api_host, &target.guest_id),
        }
    }
}
