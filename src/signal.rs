//! Asynchronous drain request.
//!
//! SIGCONT is the only recognized stop signal; everything else keeps its
//! default disposition. The handler does nothing but set a flag; the drain
//! itself (discard of a possibly-incomplete sample, one final sweep, dump)
//! runs on the sampling thread once it observes the flag at a tick boundary.
//! SA_RESTART keeps an in-flight register pread from failing with EINTR,
//! which would otherwise turn an ordinary stop request into a fatal access
//! error.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

static DRAIN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn request_drain(_signal: libc::c_int) {
    DRAIN_REQUESTED.store(true, Ordering::Relaxed);
}

/// Install the SIGCONT handler and return the flag the engine polls.
pub fn install() -> Result<&'static AtomicBool> {
    let action = SigAction::new(
        SigHandler::Handler(request_drain),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGCONT, &action) }
        .context("failed to install the SIGCONT handler")?;
    Ok(&DRAIN_REQUESTED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::raise;

    #[test]
    fn test_sigcont_sets_flag_only() {
        let flag = install().unwrap();
        flag.store(false, Ordering::Relaxed);
        raise(Signal::SIGCONT).unwrap();
        assert!(flag.load(Ordering::Relaxed));
        flag.store(false, Ordering::Relaxed);
    }
}
