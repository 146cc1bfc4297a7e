//! Fatal-signal trap (`spec.md` §2 "Signal trap", §4.8 "Signal handling",
//! §9 REDESIGN FLAGS "Signal handling reentrancy").
//!
//! The signal handler itself does the absolute minimum: write one byte to
//! the notifier's fd. Everything else — invoking the user's `crash`
//! callback, logging, deciding to exit — happens on the reactor thread the
//! next time it drains the notifier. This is non-negotiable per the async-
//! signal-safety rules POSIX imposes on a handler.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use log::{info, warn};

use crate::notifier::Notifier;

static TRAP_INSTALLED: AtomicBool = AtomicBool::new(false);
static LAST_SIGNAL: AtomicI32 = AtomicI32::new(0);

/// Which role this process plays, controlling how a trapped signal is
/// handled once it reaches the reactor thread (`spec.md` §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    /// Standalone, or the cluster master.
    Master,
    /// A cluster worker child.
    Worker,
}

/// Signals this crate traps when `signalInterception(true)` is set
/// (`spec.md` §4.8).
#[cfg(unix)]
pub const TRAPPED_SIGNALS: &[libc::c_int] = &[
    libc::SIGINT,
    libc::SIGTERM,
    libc::SIGABRT,
    libc::SIGFPE,
    libc::SIGILL,
    libc::SIGSEGV,
];

#[cfg(unix)]
extern "C" fn handler(signum: libc::c_int) {
    LAST_SIGNAL.store(signum, Ordering::SeqCst);
    let fd = NOTIFY_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let byte: u8 = 1;
        // SAFETY: write(2) on a pre-registered fd with a pointer to a
        // global static is the one documented async-signal-safe escape
        // hatch; no allocation, no locking, no logging happens on this path.
        unsafe {
            libc::write(fd, (&byte as *const u8).cast(), 1);
        }
    }
}

#[cfg(unix)]
static NOTIFY_FD: AtomicI32 = AtomicI32::new(-1);

/// Install handlers for every signal in [`TRAPPED_SIGNALS`]
/// (`spec.md` §4.8: "the core installs handlers for SIGINT, SIGTERM,
/// SIGABRT, SIGFPE, SIGILL, SIGSEGV"). `notify_fd` is the raw fd the
/// reactor's [`Notifier`] listens on; the handler writes one byte there.
///
/// Idempotent: installing twice is a no-op on the second call.
#[cfg(unix)]
pub fn install(notify_fd: std::os::unix::io::RawFd) {
    if TRAP_INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }
    NOTIFY_FD.store(notify_fd, Ordering::SeqCst);
    for &sig in TRAPPED_SIGNALS {
        // SAFETY: installing a signal handler via sigaction is safe as long
        // as `handler` upholds async-signal-safety, which it does above.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handler as usize;
            libc::sigemptyset(&mut action.sa_mask);
            action.sa_flags = 0;
            libc::sigaction(sig, &action, std::ptr::null_mut());
        }
    }
    info!("signals: fatal-signal trap installed");
}

#[cfg(not(unix))]
pub fn install(_notify_fd: i32) {
    warn!("signals: trap unavailable on this platform");
}

/// Restore default dispositions for every trapped signal.
#[cfg(unix)]
pub fn remove() {
    if !TRAP_INSTALLED.swap(false, Ordering::SeqCst) {
        return;
    }
    for &sig in TRAPPED_SIGNALS {
        // SAFETY: SIG_DFL is always a valid disposition.
        unsafe {
            libc::signal(sig, libc::SIG_DFL);
        }
    }
    info!("signals: fatal-signal trap removed");
}

#[cfg(not(unix))]
pub fn remove() {}

/// Consume the last trapped signal number, if one fired since the previous
/// call. Called by the reactor thread after draining the notifier.
pub fn take_last_signal() -> Option<i32> {
    let v = LAST_SIGNAL.swap(0, Ordering::SeqCst);
    if v == 0 {
        None
    } else {
        Some(v)
    }
}

/// Handle a signal observed on the reactor thread, per the role-specific
/// behavior `spec.md` §4.8 describes.
///
/// - Master: invokes `crash` if set, else exits with the signal.
/// - Worker: logs and exits; the master observes the exit and may respawn.
pub fn handle_on_reactor_thread(signum: i32, role: ProcessRole, crash: Option<&mut dyn FnMut(i32)>) {
    match role {
        ProcessRole::Master => {
            if let Some(f) = crash {
                warn!("signals: signal {signum} trapped, invoking crash callback");
                f(signum);
            } else {
                warn!("signals: signal {signum} trapped, no crash callback registered, exiting");
                std::process::exit(128 + signum);
            }
        }
        ProcessRole::Worker => {
            warn!("signals: worker process received signal {signum}, exiting");
            std::process::exit(128 + signum);
        }
    }
}

/// Register [`Notifier`] as the signal-handler's wakeup target. Convenience
/// wrapper over `install` for `Core` callers that hold a `Notifier` rather
/// than a raw fd.
#[cfg(unix)]
pub fn install_for_notifier(notifier: &Notifier) {
    install(notifier.as_raw_fd());
}

#[cfg(not(unix))]
pub fn install_for_notifier(_notifier: &Notifier) {
    warn!("signals: trap unavailable on this platform");
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn install_is_idempotent() {
        install(-1);
        install(-1);
        remove();
    }

    #[test]
    fn take_last_signal_drains_once() {
        LAST_SIGNAL.store(libc::SIGTERM, Ordering::SeqCst);
        assert_eq!(take_last_signal(), Some(libc::SIGTERM));
        assert_eq!(take_last_signal(), None);
    }
}
