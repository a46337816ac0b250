//! # nodefence-core
//!
//! Fencing decision engine for shared-storage clusters.
//!
//! When the quorum subsystem decides a node must be fenced, this crate
//! answers two questions: does the node still hold the resource mounted, and
//! if it might, can we power it off and prove it is off?
//!
//! ## Modules
//!
//! - [`config`]: TOML configuration, constructed once and passed by reference
//! - [`binding`]: the host-binding table mapping nodes to backends
//! - [`credentials`]: plain or base64-encoded management passwords
//! - [`exec`]: bounded external command execution
//! - [`probe`]: the liveness prober
//! - [`backend`]: direct power (IPMI), redundant proxy (powerman) and
//!   virtualized host (vCenter) drivers
//! - [`orchestrator`]: one request to one terminal outcome
//! - [`selftest`]: read-only checks of every configured node
//! - [`interrupt`]: SIGINT/SIGTERM to a cooperative flag
//!
//! ## Example
//!
//! ```rust
//! use nodefence_core::backend::{FenceBackend, FenceOutcome, FailureReason};
//! use nodefence_core::binding::{BackendBinding, BindingTable};
//! use nodefence_core::orchestrator::{FenceRequest, Fencer};
//! use nodefence_core::probe::{ChannelError, LivenessProbe, LivenessResult};
//!
//! struct Gone;
//!
//! impl LivenessProbe for Gone {
//!     fn probe(&self, _node: &str, _rid: &str) -> LivenessResult {
//!         LivenessResult::ReachableUnmounted
//!     }
//!
//!     fn check_channel(&self, _node: &str) -> Result<(), ChannelError> {
//!         Ok(())
//!     }
//! }
//!
//! struct Never;
//!
//! impl FenceBackend for Never {
//!     fn preflight(&self, _binding: &BackendBinding) -> Result<(), FailureReason> {
//!         Ok(())
//!     }
//!
//!     fn power_off_and_confirm(&self, _binding: &BackendBinding) -> FenceOutcome {
//!         unreachable!("unmounted nodes are never powered off")
//!     }
//! }
//!
//! let bindings: BindingTable = "10.0.0.200 virtualized-host vc1:vm-42\n".parse().unwrap();
//! let outcome = Fencer::new(&bindings, &Gone, &Never).fence(&FenceRequest::new("10.0.0.200", "fs-7"));
//! assert!(outcome.is_success());
//! ```

pub mod backend;
pub mod binding;
pub mod config;
pub mod credentials;
pub mod exec;
pub mod interrupt;
pub mod orchestrator;
pub mod probe;
pub mod selftest;
