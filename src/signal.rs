//! Interrupt handling (SIGINT/SIGTERM).
//!
//! The handler only records a reason; the main thread polls it from its
//! timed wait and initiates teardown.  We let the first SIGINT reach child
//! processes via the terminal group, so in-flight actions fail on their own
//! and workers can report them normally.

use std::sync::atomic::{AtomicUsize, Ordering};

const NONE: usize = 0;
const SIGINT: usize = 1;
const SIGTERM: usize = 2;
const ABORTED_CHILD: usize = 3;

static REASON: AtomicUsize = AtomicUsize::new(NONE);

#[cfg(unix)]
extern "C" fn interrupt_handler(sig: libc::c_int) {
    let reason = if sig == libc::SIGTERM { SIGTERM } else { SIGINT };
    let _ = REASON.compare_exchange(NONE, reason, Ordering::Relaxed, Ordering::Relaxed);
    // SA_RESETHAND clears the handler, so a second signal kills us.
}

#[cfg(unix)]
pub fn register() {
    // Safety: registering a signal handler is libc unsafe code.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = interrupt_handler as libc::sighandler_t;
        sa.sa_flags = libc::SA_RESETHAND;
        libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut());
        libc::sigaction(libc::SIGTERM, &sa, std::ptr::null_mut());
    }
}

#[cfg(not(unix))]
pub fn register() {}

/// Records an interrupt raised from inside the build (e.g. a child process
/// was killed out from under us).
pub fn set_reason_aborted_child() {
    let _ = REASON.compare_exchange(NONE, ABORTED_CHILD, Ordering::Relaxed, Ordering::Relaxed);
}

pub fn reason() -> Option<&'static str> {
    match REASON.load(Ordering::Relaxed) {
        SIGINT => Some("interrupted by SIGINT"),
        SIGTERM => Some("interrupted by SIGTERM"),
        ABORTED_CHILD => Some("child process was aborted"),
        _ => None,
    }
}

pub fn is_interrupted() -> bool {
    REASON.load(Ordering::Relaxed) != NONE
}

/// Test hook: clears any recorded reason.
pub fn reset() {
    REASON.store(NONE, Ordering::Relaxed);
}
