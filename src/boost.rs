//! Advisory OS-level socket tuning at startup (`spec.md` §6, "OS tuning
//! hooks (advisory)").
//!
//! `boost()` raises a handful of `sysctl`-equivalent knobs — TCP buffer
//! sizes, the accept backlog, window scaling, congestion control — when the
//! process is running as root. Every knob is applied independently and a
//! failure on one never stops the rest; the whole call is advisory and is
//! never allowed to fail `Core::start`.

/// One `sysctl`-style knob this crate attempts to raise.
#[derive(Debug, Clone, Copy)]
struct Sysctl {
    path: &'static str,
    value: &'static str,
}

const LINUX_SYSCTLS: &[Sysctl] = &[
    Sysctl { path: "/proc/sys/net/core/somaxconn", value: "65535" },
    Sysctl { path: "/proc/sys/net/core/rmem_max", value: "16777216" },
    Sysctl { path: "/proc/sys/net/core/wmem_max", value: "16777216" },
    Sysctl { path: "/proc/sys/net/ipv4/tcp_window_scaling", value: "1" },
    Sysctl { path: "/proc/sys/net/ipv4/tcp_congestion_control", value: "bbr" },
];

/// Best-effort sysctl tuning; silently does nothing when not running as
/// root or on a platform without `/proc/sys` (`spec.md` §6: "failures are
/// silently ignored").
#[cfg(target_os = "linux")]
pub fn boost() {
    // SAFETY: `geteuid` takes no arguments and never fails.
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        log::debug!("boost: not running as root, skipping sysctl tuning");
        return;
    }
    for knob in LINUX_SYSCTLS {
        match std::fs::write(knob.path, knob.value) {
            Ok(()) => log::info!("boost: set {} = {}", knob.path, knob.value),
            Err(e) => log::debug!("boost: couldn't set {}: {e}", knob.path),
        }
    }
}

/// No kernel-tunable equivalent reachable from userspace on this platform;
/// advisory no-op.
#[cfg(not(target_os = "linux"))]
pub fn boost() {
    log::debug!("boost: no sysctl-equivalent tuning on this platform, skipping");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boost_never_panics() {
        boost();
    }
}
