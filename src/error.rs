//! Typed error taxonomy shared by every component.
//!
//! Internal helpers that merely talk to the OS return `anyhow::Result` with
//! `.context(..)` attached at the call site — that's plenty for a log line.
//! The public façade (`Core`, `Dispatcher`, `Broker`) returns [`CoreError`]
//! instead, so upper-layer protocol engines can match on the error *kind*
//! without downcasting an opaque `anyhow::Error`.

use std::fmt;

/// One variant per error kind named in the core's error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Bind/listen/socket creation failed before any broker existed.
    #[error("start failed: {0}")]
    Start(String),

    /// The kernel refused an `accept`, or a post-accept tuning step failed.
    /// The candidate broker is never published to the scheme.
    #[error("accept failed: {0}")]
    Accept(String),

    /// An outbound `connect` syscall failed, or the connect watchdog fired.
    #[error("connect failed: {0}")]
    Connect(String),

    /// A read, write, idle or connect watchdog fired.
    #[error("{direction} timeout after {seconds}s")]
    Timeout {
        /// Which watchdog fired.
        direction: TimeoutDirection,
        /// Configured timeout, for the log line.
        seconds: u64,
    },

    /// The negotiated protocol (ALPN) could not be activated.
    #[error("protocol negotiation failed: {0}")]
    Protocol(String),

    /// CMP framing error: magic mismatch, out-of-order fragment, oversize payload.
    #[error("framing error: {0}")]
    Framing(String),

    /// An OS primitive this build doesn't support (e.g. cluster fork on Windows).
    #[error("unsupported on this platform: {0}")]
    OsBroken(String),
}

/// Which per-direction watchdog fired; used by [`CoreError::Timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutDirection {
    /// Read-side inactivity watchdog.
    Read,
    /// Write-side inactivity watchdog.
    Write,
    /// Generic idle watchdog.
    Idle,
    /// Outbound connect watchdog (single-shot).
    Connect,
}

impl fmt::Display for TimeoutDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Idle => "idle",
            Self::Connect => "connect",
        };
        f.write_str(s)
    }
}

/// Convenience alias for façade methods.
pub type CoreResult<T> = Result<T, CoreError>;
