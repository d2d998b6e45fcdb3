//! Ctrl-C handling
//!
//! SIGINT sets a process-wide flag instead of killing the process.
//! Interactive children get the signal from the terminal; captured ones run
//! in their own process group and the system runner forwards it when it
//! sees the flag. Either way a running build or flash ends on its own. The
//! flows check the flag between steps and unwind normally, which lets
//! every service guard restart the service on the way out.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_: nix::libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Route SIGINT to the interrupt flag
pub fn install_handler() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_sigint),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // SAFETY: the handler only stores to an atomic.
    unsafe { signal::sigaction(Signal::SIGINT, &action) }?;
    Ok(())
}

/// The flag itself, for flows that take a cancel token
pub fn flag() -> &'static AtomicBool {
    &INTERRUPTED
}

/// Whether SIGINT arrived since the last [`reset`]
pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Clear the flag
pub fn reset() {
    INTERRUPTED.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sigint_sets_flag() {
        install_handler().unwrap();
        reset();
        assert!(!interrupted());

        signal::raise(Signal::SIGINT).unwrap();
        assert!(interrupted());
        assert!(flag().load(Ordering::SeqCst));

        reset();
        assert!(!interrupted());
    }
}
