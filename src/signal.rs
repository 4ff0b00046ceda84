//! The restart flag: set by the SIGHUP handler, read and cleared by the
//! supervisor.
//!
//! No work happens in signal context — the handler performs a single
//! relaxed-ordering store and returns. The supervisor is the only reader
//! and the only writer that ever clears it, so a `SeqCst` fence isn't
//! needed on either side; `Release`/`Acquire` is enough to make the store
//! visible to the next poll of the flag.

use anyhow::{Context, Result};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::os::raw::c_int;
use std::sync::atomic::{AtomicBool, Ordering};

static RESTART_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_hangup(_signum: c_int) {
    RESTART_REQUESTED.store(true, Ordering::Release);
}

/// Install the SIGHUP handler. Must be called once, before the supervisor
/// starts accepting connections.
pub fn install_hangup_handler() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_hangup),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // SAFETY: `on_hangup` only performs an atomic store, which is
    // async-signal-safe.
    unsafe { sigaction(Signal::SIGHUP, &action) }.context("install SIGHUP handler")?;
    Ok(())
}

/// True if a hangup arrived since the flag was last cleared.
pub fn restart_requested() -> bool {
    RESTART_REQUESTED.load(Ordering::Acquire)
}

/// Clear the flag after a restart has been carried out.
pub fn clear_restart_request() {
    RESTART_REQUESTED.store(false, Ordering::Release);
}
