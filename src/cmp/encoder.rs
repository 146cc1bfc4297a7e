//! CMP fragment encoder.
//!
//! `spec.md` §9 ("CMP encoder allocation") asks for a lazy fragment stream
//! rather than one contiguous buffer, so a transport can pull fragments one
//! at a time without the encoder holding the whole encoded message in
//! memory. [`Encoder::push`] returns an iterator of [`Fragment`]; callers
//! that do want one contiguous `Vec<u8>` can `.collect()` it.

use super::{Header, Mode};
use crate::constants::{CMP_DEFAULT_CHUNK_SIZE, CMP_HEADER_SIZE, CMP_MIN_CHUNK_SIZE};

/// One on-wire fragment: a 16-byte header followed by its payload slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Decoded header for this fragment.
    pub header: Header,
    /// Payload bytes this fragment carries.
    pub payload: Vec<u8>,
}

impl Fragment {
    /// Concatenate header and payload into a single on-wire byte vector.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(CMP_HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&self.header.encode());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// Stateful CMP encoder: owns the monotonic message counter.
#[derive(Debug)]
pub struct Encoder {
    chunk_size: usize,
    message_counter: u32,
    /// Our own PID, stamped into every header we emit.
    pid: u32,
}

impl Encoder {
    /// Create an encoder with the default chunk size (`spec.md` §6).
    #[must_use]
    pub fn new() -> Self {
        Self::with_chunk_size(CMP_DEFAULT_CHUNK_SIZE)
    }

    /// Create an encoder with an explicit chunk size, clamped to the
    /// protocol minimum (`spec.md` §6, "minimum 1024").
    #[must_use]
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(CMP_MIN_CHUNK_SIZE),
            message_counter: 0,
            pid: std::process::id(),
        }
    }

    /// Current configured chunk size.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Split `buffer` into fragments addressed `pid = 0` ("my peer").
    ///
    /// Equivalent to [`Encoder::push_to`] with `pid = 0`; the common case
    /// for a single-socketpair worker↔master link.
    pub fn push(&mut self, user_tag: u8, buffer: &[u8]) -> Vec<Fragment> {
        self.push_to(user_tag, buffer, 0)
    }

    /// Split `buffer` into fragments addressed to a specific peer PID.
    ///
    /// Every fragment of this call shares one `id`, drawn from the
    /// monotonic `message_counter`, which is incremented exactly once after
    /// the message (`spec.md` §4.10). The last fragment carries
    /// `mode = END`; every earlier one carries `mode = CONTINUE`. A zero-byte
    /// message still produces exactly one `END` fragment with an empty
    /// payload, so the decoder always sees a terminator.
    pub fn push_to(&mut self, user_tag: u8, buffer: &[u8], dest_pid: u32) -> Vec<Fragment> {
        let id = self.message_counter;
        self.message_counter = self.message_counter.wrapping_add(1);

        let max_payload = self.chunk_size - CMP_HEADER_SIZE;
        let chunks: Vec<&[u8]> = if buffer.is_empty() {
            vec![&[][..]]
        } else {
            buffer.chunks(max_payload).collect()
        };
        let last = chunks.len() - 1;

        chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| Fragment {
                header: Header {
                    id,
                    mode: if i == last { Mode::End } else { Mode::Continue },
                    mid: user_tag,
                    bytes: chunk.len() as u16,
                    pid: dest_pid,
                },
                payload: chunk.to_vec(),
            })
            .collect()
    }

    /// Flatten `push`'s fragments into one contiguous on-wire buffer.
    ///
    /// Convenience for callers that don't need the lazy iterator form —
    /// e.g. tests and the property-based round-trip check.
    pub fn encode_all(&mut self, user_tag: u8, buffer: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        for frag in self.push(user_tag, buffer) {
            out.extend_from_slice(&frag.to_bytes());
        }
        out
    }

    /// The PID this encoder stamps into headers (used by callers that need
    /// to know their own identity, e.g. to detect self-addressed loopback).
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// S4 from `spec.md` §8: chunk_size=64, 200-byte message, mid=7.
    #[test]
    fn s4_fragmentation_matches_spec_example() {
        let mut enc = Encoder::with_chunk_size(64);
        let msg = vec![0xABu8; 200];
        let frags = enc.push(7, &msg);

        assert_eq!(frags.len(), 4);
        let max_payload = 64 - CMP_HEADER_SIZE;
        assert_eq!(max_payload, 48);
        assert_eq!(frags[0].payload.len(), 48);
        assert_eq!(frags[1].payload.len(), 48);
        assert_eq!(frags[2].payload.len(), 48);
        assert_eq!(frags[3].payload.len(), 56);

        assert!(matches!(frags[0].header.mode, Mode::Continue));
        assert!(matches!(frags[1].header.mode, Mode::Continue));
        assert!(matches!(frags[2].header.mode, Mode::Continue));
        assert!(matches!(frags[3].header.mode, Mode::End));

        for f in &frags {
            assert_eq!(f.header.id, 0);
            assert_eq!(f.header.mid, 7);
        }
    }

    #[test]
    fn fragment_count_matches_ceiling_formula() {
        let chunk_size = 128usize;
        let max_payload = chunk_size - CMP_HEADER_SIZE;
        for size in [0usize, 1, max_payload, max_payload + 1, 10_000] {
            let mut enc = Encoder::with_chunk_size(chunk_size);
            let buf = vec![0u8; size];
            let frags = enc.push(0, &buf);
            let expected = if size == 0 {
                1
            } else {
                size.div_ceil(max_payload)
            };
            assert_eq!(frags.len(), expected, "size={size}");
        }
    }

    #[test]
    fn message_counter_increments_once_per_message() {
        let mut enc = Encoder::with_chunk_size(64);
        let a = enc.push(0, &[0u8; 200]);
        let b = enc.push(0, &[0u8; 10]);
        assert_eq!(a[0].header.id, 0);
        assert_eq!(b[0].header.id, 1);
    }
}
