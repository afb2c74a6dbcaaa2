//! Signal handling and the one-shot teardown guard
//!
//! Handlers only record the signal. Loops notice it when their blocking
//! wait returns `EINTR` and run their destructor from normal context.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use nix::libc::c_int;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_SIGINT: i32 = 130;
pub const EXIT_SIGTERM: i32 = 143;

static RECEIVED: AtomicI32 = AtomicI32::new(0);

extern "C" fn record_signal(signal: c_int) {
    RECEIVED.store(signal, Ordering::SeqCst);
}

/// Install SIGINT/SIGTERM handlers without SA_RESTART.
pub fn install_signal_handlers() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(record_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // SAFETY: the handler only stores to an atomic
    unsafe {
        sigaction(Signal::SIGINT, &action)?;
        sigaction(Signal::SIGTERM, &action)?;
    }
    Ok(())
}

/// Exit status for a received termination signal, if any.
pub fn requested_exit_code() -> Option<i32> {
    exit_code_for(RECEIVED.load(Ordering::SeqCst))
}

fn exit_code_for(signal: c_int) -> Option<i32> {
    match signal {
        0 => None,
        s if s == Signal::SIGINT as c_int => Some(EXIT_SIGINT),
        _ => Some(EXIT_SIGTERM),
    }
}

/// Guards a destructor so that only the first invocation runs it
#[derive(Debug, Default)]
pub struct Teardown {
    fired: AtomicBool,
}

impl Teardown {
    pub fn new() -> Self {
        Self::default()
    }

    /// True exactly once.
    pub fn begin(&self) -> bool {
        !self.fired.swap(true, Ordering::SeqCst)
    }
}
