//! File-descriptor soft-limit raising (`spec.md` §4.2, `fds::raise_limit`).
//!
//! Best-effort: a failure here never stops the reactor from starting. It's
//! logged at `warn` and the process carries on with whatever limit it
//! already had.

use crate::constants::DEFAULT_FDS_TARGET;

/// Attempt to raise the process's open-file soft limit toward `target`.
///
/// On Unix this is `setrlimit(RLIMIT_NOFILE, ...)`, clamped to the hard
/// limit. On Windows there's no equivalent kernel knob for socket handles;
/// this is a no-op there; see [`raise_to`] for the platform-specific probe.
pub fn raise_limit() -> u64 {
    raise_to(DEFAULT_FDS_TARGET)
}

/// Attempt to raise the soft limit to exactly `target`, returning whatever
/// soft limit is in effect afterward (which may be lower than requested).
#[cfg(unix)]
pub fn raise_to(target: u64) -> u64 {
    let mut lim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `lim` is a valid out-param for getrlimit.
    let ret = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut lim) };
    if ret != 0 {
        log::warn!("fds: getrlimit(RLIMIT_NOFILE) failed: {}", std::io::Error::last_os_error());
        return 0;
    }

    let desired = target.min(lim.rlim_max);
    if desired <= lim.rlim_cur {
        return lim.rlim_cur;
    }

    let raised = libc::rlimit {
        rlim_cur: desired,
        rlim_max: lim.rlim_max,
    };
    // SAFETY: `raised` is a valid rlimit within [0, rlim_max].
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &raised) };
    if ret != 0 {
        log::warn!(
            "fds: setrlimit(RLIMIT_NOFILE, {desired}) failed: {}, staying at {}",
            std::io::Error::last_os_error(),
            lim.rlim_cur
        );
        return lim.rlim_cur;
    }

    log::info!("fds: raised RLIMIT_NOFILE soft limit from {} to {desired}", lim.rlim_cur);
    desired
}

/// Windows has no file-descriptor rlimit; probe by opening loopback sockets
/// until one fails, which is the closest equivalent signal the spec asks
/// for logged at startup.
#[cfg(windows)]
pub fn raise_to(target: u64) -> u64 {
    use std::net::UdpSocket;

    let mut opened = Vec::new();
    let probe_cap = target.min(4096) as usize;
    while (opened.len() as u64) < probe_cap as u64 {
        match UdpSocket::bind("127.0.0.1:0") {
            Ok(s) => opened.push(s),
            Err(_) => break,
        }
    }
    let usable = opened.len() as u64;
    log::info!("fds: platform has no RLIMIT_NOFILE; probed {usable} available socket handles");
    drop(opened);
    usable
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn raise_to_never_panics_and_reports_nonzero() {
        let got = raise_to(DEFAULT_FDS_TARGET);
        assert!(got > 0);
    }

    #[test]
    fn raise_to_is_idempotent() {
        let first = raise_to(DEFAULT_FDS_TARGET);
        let second = raise_to(DEFAULT_FDS_TARGET);
        assert_eq!(first, second);
    }
}
