//! Fence mode: one request, one outcome, one exit code.

use nodefence_core::backend::FenceOutcome;
use nodefence_core::binding::BindingTable;
use nodefence_core::orchestrator::{FenceRequest, Fencer};

use super::{Wiring, exit_codes};

/// Runs the request and returns the exit code for its outcome.
pub fn run(request: &FenceRequest, bindings: &BindingTable, wiring: &Wiring) -> u8 {
    let outcome = Fencer::new(bindings, &wiring.probe, &wiring.backends).fence(request);
    exit_code(&outcome)
}

/// 0 for `Confirmed` and `Skipped`, non-zero for `Failed`.
pub const fn exit_code(outcome: &FenceOutcome) -> u8 {
    if outcome.is_success() {
        exit_codes::SUCCESS
    } else {
        exit_codes::FENCE_FAILED
    }
}
