//! Mode implementations and the production transport wiring.

use nodefence_core::backend::{
    Backends, DirectPowerDriver, IpmitoolClient, PmClient, RedundantProxyDriver, RestVirtApi,
    VirtualizedHostDriver,
};
use nodefence_core::config::FenceConfig;
use nodefence_core::exec::SystemCommandRunner;
use nodefence_core::interrupt::InterruptFlag;
use nodefence_core::probe::{LivenessProber, SshChannel};

pub mod fence;
pub mod selftest;

/// Exit codes seen by the quorum subsystem.
pub mod exit_codes {
    /// Power-off confirmed, fencing skipped, or every self-test check passed.
    pub const SUCCESS: u8 = 0;
    /// Fencing failed.
    pub const FENCE_FAILED: u8 = 1;
    /// Configuration or usage error; nothing was attempted.
    pub const CONFIG_ERROR: u8 = 2;
}

/// Real transports: ssh, ipmitool, pm and the vCenter REST API.
pub struct Wiring {
    pub probe: LivenessProber<SshChannel<SystemCommandRunner>>,
    pub backends: Backends<
        IpmitoolClient<SystemCommandRunner>,
        PmClient<SystemCommandRunner>,
        RestVirtApi,
    >,
}

impl Wiring {
    /// Builds every transport from the loaded configuration.
    ///
    /// Nothing here touches the network; the vCenter HTTP client is only
    /// built when a vCenter-backed node is fenced or tested.
    #[must_use]
    pub fn new(config: &FenceConfig, interrupt: &InterruptFlag) -> Self {
        let runner = SystemCommandRunner;

        let probe = LivenessProber::new(
            SshChannel::new(runner, config.probe.clone()),
            config.probe.status_locations.clone(),
        );

        let backends = Backends {
            direct: DirectPowerDriver::new(
                IpmitoolClient::new(runner, &config.direct_power),
                &config.direct_power,
                interrupt.clone(),
            ),
            proxy: RedundantProxyDriver::new(
                PmClient::new(runner, &config.redundant_proxy),
                interrupt.clone(),
            ),
            virtualized: VirtualizedHostDriver::new(
                RestVirtApi::new(&config.virtualized_host),
                &config.virtualized_host,
                interrupt.clone(),
            ),
        };

        Self { probe, backends }
    }
}
