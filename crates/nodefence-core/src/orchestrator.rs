//! Fencing orchestrator.
//!
//! One [`FenceRequest`] per run, resolved to exactly one terminal
//! [`FenceOutcome`]:
//!
//! 1. Validate the request.
//! 2. Resolve the node's backend binding.
//! 3. Preflight the backend (credential decoding, no network).
//! 4. Probe liveness.
//! 5. `ReachableUnmounted` skips; anything else gets one power-off attempt.
//!
//! The probe always completes before the backend is invoked, and nothing
//! here retries: driver-internal retries are the only ones there are.

use tracing::{error, info, warn};

use crate::backend::{FailureReason, FenceBackend, FenceOutcome, SkipReason};
use crate::binding::BindingTable;
use crate::probe::{LivenessProbe, LivenessResult};

/// Node to fence and the resource it must no longer hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FenceRequest {
    /// Node address as it appears in the binding table.
    pub address: String,
    /// Resource identifier searched for on the node.
    pub rid: String,
}

impl FenceRequest {
    /// Creates a request.
    #[must_use]
    pub fn new(address: impl Into<String>, rid: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            rid: rid.into(),
        }
    }

    /// Rejects requests the probe could not interpret unambiguously.
    ///
    /// # Errors
    ///
    /// Returns what is wrong with the request.
    pub fn validate(&self) -> Result<(), String> {
        if self.address.trim().is_empty() {
            return Err("node address is empty".to_string());
        }
        if self.rid.is_empty() {
            return Err("rid is empty".to_string());
        }
        if self.rid.chars().any(char::is_control) {
            return Err("rid contains control characters".to_string());
        }
        Ok(())
    }
}

/// Runs fencing requests against a binding table.
pub struct Fencer<'a> {
    bindings: &'a BindingTable,
    probe: &'a dyn LivenessProbe,
    backend: &'a dyn FenceBackend,
}

impl<'a> Fencer<'a> {
    /// Creates an orchestrator over the loaded bindings and capabilities.
    #[must_use]
    pub fn new(
        bindings: &'a BindingTable,
        probe: &'a dyn LivenessProbe,
        backend: &'a dyn FenceBackend,
    ) -> Self {
        Self {
            bindings,
            probe,
            backend,
        }
    }

    /// Processes one request to its terminal outcome.
    pub fn fence(&self, request: &FenceRequest) -> FenceOutcome {
        let node = request.address.as_str();
        let rid = request.rid.as_str();
        info!(node, rid, "fence request received");

        let outcome = self.decide(request);
        match &outcome {
            FenceOutcome::Failed(reason) => {
                error!(node, rid, %reason, "fence outcome: failed");
            },
            other => info!(node, rid, outcome = %other, "fence outcome"),
        }
        outcome
    }

    fn decide(&self, request: &FenceRequest) -> FenceOutcome {
        let node = request.address.as_str();
        let rid = request.rid.as_str();

        if let Err(why) = request.validate() {
            return FenceOutcome::Failed(FailureReason::InvalidRequest(why));
        }

        let Some(binding) = self.bindings.resolve(node) else {
            error!(node, "no backend bound to {node}");
            return FenceOutcome::Failed(FailureReason::UnknownBackend);
        };
        let backend = binding.kind();
        info!(node, %backend, "backend binding resolved");

        if let Err(reason) = self.backend.preflight(binding) {
            error!(node, %backend, %reason, "backend preflight failed");
            return FenceOutcome::Failed(reason);
        }

        let liveness = self.probe.probe(node, rid);
        if liveness == LivenessResult::ReachableUnmounted {
            info!(node, rid, "resource not mounted on {node}, skipping power off");
            return FenceOutcome::Skipped(SkipReason::NotMounted);
        }

        warn!(node, rid, %liveness, %backend, "powering off {node}");
        self.backend.power_off_and_confirm(binding)
    }
}
