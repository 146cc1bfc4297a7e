//! Crate-wide constants for corewire.
//!
//! Magic numbers are centralized here with the reasoning behind each value,
//! grouped by the subsystem that owns them.

use std::time::Duration;

// ============================================================================
// Dispatcher
// ============================================================================

/// Default reactor turn frequency when `easy_mode` is enabled (`spec.md` §4.5).
pub const DEFAULT_FREQ_MS: u64 = 10;

/// `mio::Poll::poll` event capacity per turn.
pub const POLL_EVENTS_CAPACITY: usize = 1_024;

// ============================================================================
// Broker watermarks & timeouts
// ============================================================================

/// Default minimum bytes the reactor must accumulate before signalling a
/// broker readable (`spec.md` §4.6, "marker.read.min").
pub const DEFAULT_READ_WATERMARK_MIN: usize = 1;

/// Default cap on a single `recv` (`spec.md` §4.6, "marker.read.max").
pub const DEFAULT_READ_WATERMARK_MAX: usize = 64 * 1024;

/// Default cap on bytes drained per writer turn (`spec.md` §4.6, "marker.write.max").
pub const DEFAULT_WRITE_WATERMARK_MAX: usize = 64 * 1024;

/// How long a broker id stays on the recently-disconnected list after close
/// (`spec.md` §3, Broker lifecycle).
pub const RECENTLY_DISCONNECTED_GRACE: Duration = Duration::from_secs(10);

/// How often the recently-disconnected list is purged (`spec.md` §5).
pub const RECENTLY_DISCONNECTED_SWEEP_INTERVAL: Duration = Duration::from_secs(3);

// ============================================================================
// CMP codec
// ============================================================================

/// Fixed little-endian magic identifying a CMP header (`spec.md` §6).
pub const CMP_MAGIC: u16 = 0xAC4D;

/// On-wire header size in bytes: `u16 + u32 + u8 + u8 + u16 + u32`.
pub const CMP_HEADER_SIZE: usize = 2 + 4 + 1 + 1 + 2 + 4;

/// Default fragmentation threshold (`spec.md` §6).
pub const CMP_DEFAULT_CHUNK_SIZE: usize = 65_536;

/// Minimum permitted fragmentation threshold (`spec.md` §6).
pub const CMP_MIN_CHUNK_SIZE: usize = 1_024;

// ============================================================================
// FDS limiter
// ============================================================================

/// Soft-limit target the limiter tries to raise `RLIMIT_NOFILE` to on startup.
pub const DEFAULT_FDS_TARGET: u64 = 65_536;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmp_chunk_default_above_minimum() {
        assert!(CMP_DEFAULT_CHUNK_SIZE >= CMP_MIN_CHUNK_SIZE);
    }

    #[test]
    fn header_size_matches_wire_layout() {
        assert_eq!(CMP_HEADER_SIZE, 16);
    }
}
