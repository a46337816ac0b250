//! SIGINT/SIGTERM handling.
//!
//! An interrupt must not kill the process mid-fence: the virtualized-host
//! driver still owes the API a logout. The handlers installed here only raise
//! an [`InterruptFlag`]; drivers check it between steps and unwind through
//! their normal exit paths.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

/// Flag shared with the installed signal handlers.
static PROCESS_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

/// Cooperative cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    /// A flag no signal handler is attached to.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the flag as raised.
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// True once an interrupt arrived.
    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

extern "C" fn on_signal(_signal: nix::libc::c_int) {
    if let Some(flag) = PROCESS_FLAG.get() {
        flag.store(true, Ordering::SeqCst);
    }
}

/// Routes SIGINT and SIGTERM to the returned flag.
///
/// Interrupted system calls are restarted, so blocking calls keep running
/// until their own timeouts.
///
/// # Errors
///
/// Returns an error if a handler cannot be installed.
pub fn install_handlers() -> Result<InterruptFlag, nix::Error> {
    let flag = PROCESS_FLAG
        .get_or_init(|| Arc::new(AtomicBool::new(false)))
        .clone();
    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: the handler performs a single atomic store on a flag that
        // was initialised before installation, which is async-signal-safe.
        #[allow(unsafe_code)]
        unsafe {
            sigaction(signal, &action)?;
        }
    }
    Ok(InterruptFlag(flag))
}
