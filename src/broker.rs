//! The broker: per-connection state machine, events, timeouts and
//! watermarks (`spec.md` §3 "Broker", §4.6).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use mio::Token;

use crate::constants::{
    DEFAULT_READ_WATERMARK_MAX, DEFAULT_READ_WATERMARK_MIN, DEFAULT_WRITE_WATERMARK_MAX,
};

/// 64-bit broker id: a monotonic nanosecond timestamp at creation time
/// (`spec.md` §3: "monotonic timestamp in nanoseconds"), guaranteeing
/// process-wide uniqueness without a shared counter.
pub type BrokerId = u64;

/// Mint a fresh, process-wide-unique broker id.
///
/// Guards against two brokers created within the same nanosecond (possible
/// on fast allocation paths, or under a coarse clock) by bumping a
/// thread-local tie-breaker when the raw timestamp doesn't advance.
pub fn next_broker_id() -> BrokerId {
    use std::cell::Cell;
    use std::time::{SystemTime, UNIX_EPOCH};

    thread_local! {
        static LAST: Cell<BrokerId> = const { Cell::new(0) };
    }

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as BrokerId;

    LAST.with(|last| {
        let candidate = now.max(last.get() + 1);
        last.set(candidate);
        candidate
    })
}

/// Broker lifecycle state (`spec.md` §4.6: "IDLE → CONNECTING → OPEN →
/// CLOSING → CLOSED"). A listening broker enters `Open` directly after
/// `listen`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    /// Constructed but not yet connecting or listening.
    Idle,
    /// Outbound connect in flight, `CONNECT` event armed.
    Connecting,
    /// Usable: reading/writing are permitted.
    Open,
    /// Teardown in progress; no new events are armed.
    Closing,
    /// Fully torn down; on the recently-disconnected list.
    Closed,
}

/// Transport kind carried by a broker's socket (`spec.md` §3: "transport
/// kind (TCP/UDP/SCTP/TLS/DTLS)").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Plaintext TCP.
    Tcp,
    /// Plaintext UDP.
    Udp,
    /// TCP wrapped in TLS.
    Tls,
    /// UDP wrapped in DTLS.
    Dtls,
}

/// One logical event slot a broker may have armed with the dispatcher
/// (`spec.md` §3: "six logical event slots").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Socket readable.
    Read,
    /// Socket writable.
    Write,
    /// Listening socket has a pending connection.
    Accept,
    /// Outbound connect completed (or failed).
    Connect,
    /// Generic idle watchdog, arbitrated by the owner.
    Timeout,
}

/// `{min, max}` byte thresholds controlling one direction's burst sizes
/// (`spec.md` §4.6 "Watermarks").
#[derive(Debug, Clone, Copy)]
pub struct Watermark {
    /// Minimum bytes the reactor must accumulate before signalling.
    pub min: usize,
    /// Maximum bytes handled in a single turn.
    pub max: usize,
}

/// Per-direction timeout policy, counted in whole seconds of continuous
/// inactivity (`spec.md` §4.6).
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeoutPolicy {
    /// Read-side inactivity timeout, `None` disables it.
    pub read_secs: Option<u64>,
    /// Write-side inactivity timeout.
    pub write_secs: Option<u64>,
    /// Connect watchdog, single-shot.
    pub connect_secs: Option<u64>,
    /// Generic idle watchdog.
    pub idle_secs: Option<u64>,
}

/// Independent lock bits suppressing callback dispatch without
/// deregistering the underlying OS event (`spec.md` §3 "Lock bits").
#[derive(Debug, Clone, Copy, Default)]
pub struct LockBits {
    /// Suppresses `read` dispatch.
    pub read: bool,
    /// Suppresses `write` dispatch.
    pub write: bool,
}

/// One connected peer or one listening socket (`spec.md` §3 "Broker").
pub struct Broker {
    id: BrokerId,
    scheme_id: u16,
    pub(crate) token: Token,
    state: BrokerState,
    transport: Transport,
    remote_ip: Option<String>,
    remote_port: Option<u16>,
    lock: LockBits,
    timeouts: TimeoutPolicy,
    read_watermark: Watermark,
    write_watermark: Watermark,
    outbox: VecDeque<u8>,
    created_at: Instant,
    last_read_at: Instant,
    last_write_at: Instant,
    /// Reconnect attempt counter (`spec.md` §4.8, "reconnect policy").
    pub(crate) attempts: u32,
    /// Timer id of this broker's single-shot connect watchdog, if armed
    /// (`spec.md` §4.6, "CONNECT timeout is single-shot").
    pub(crate) connect_timer: Option<crate::timer::TimerId>,
    /// Timer id of a pending redial after a failed connect, if one is
    /// scheduled (`spec.md` §4.8 reconnect policy).
    pub(crate) reconnect_timer: Option<crate::timer::TimerId>,
}

impl Broker {
    /// Construct a broker for an accepted or connected socket (`spec.md`
    /// §3, "Lifecycle: created by Scheme on successful accept or connect").
    #[must_use]
    pub fn new(scheme_id: u16, token: Token, transport: Transport) -> Self {
        let now = Instant::now();
        Self {
            id: next_broker_id(),
            scheme_id,
            token,
            state: BrokerState::Idle,
            transport,
            remote_ip: None,
            remote_port: None,
            lock: LockBits::default(),
            timeouts: TimeoutPolicy::default(),
            read_watermark: Watermark {
                min: DEFAULT_READ_WATERMARK_MIN,
                max: DEFAULT_READ_WATERMARK_MAX,
            },
            write_watermark: Watermark {
                min: 0,
                max: DEFAULT_WRITE_WATERMARK_MAX,
            },
            outbox: VecDeque::new(),
            created_at: now,
            last_read_at: now,
            last_write_at: now,
            attempts: 0,
            connect_timer: None,
            reconnect_timer: None,
        }
    }

    /// Stable process-wide broker id (`spec.md` §3 invariant c).
    #[must_use]
    pub fn id(&self) -> BrokerId {
        self.id
    }

    /// The scheme this broker belongs to (`spec.md` §3 invariant b).
    #[must_use]
    pub fn scheme_id(&self) -> u16 {
        self.scheme_id
    }

    #[must_use]
    pub fn state(&self) -> BrokerState {
        self.state
    }

    #[must_use]
    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn set_remote(&mut self, ip: impl Into<String>, port: u16) {
        self.remote_ip = Some(ip.into());
        self.remote_port = Some(port);
    }

    #[must_use]
    pub fn ip(&self) -> Option<&str> {
        self.remote_ip.as_deref()
    }

    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.remote_port
    }

    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Transition to `Connecting`, arming the connect watchdog.
    pub fn begin_connect(&mut self) {
        self.state = BrokerState::Connecting;
    }

    /// Transition a connected/accepted broker to `Open`
    /// (`spec.md` §4.8, deliver `connect(bid)`).
    pub fn mark_open(&mut self) {
        self.state = BrokerState::Open;
        let now = Instant::now();
        self.last_read_at = now;
        self.last_write_at = now;
    }

    /// A listening broker is `Open` immediately after `listen`
    /// (`spec.md` §4.6: "A listening broker uses OPEN directly after
    /// listen").
    pub fn mark_listening(&mut self) {
        self.state = BrokerState::Open;
    }

    /// Begin teardown (`spec.md` §4.6 failure semantics: "drives the broker
    /// to CLOSING").
    pub fn begin_close(&mut self) {
        if self.state != BrokerState::Closed {
            self.state = BrokerState::Closing;
        }
    }

    /// Finalize teardown; `Core::close` calls this once the socket and TLS
    /// context are torn down.
    pub fn mark_closed(&mut self) {
        self.state = BrokerState::Closed;
    }

    /// Set a lock bit without touching the OS-level event registration
    /// (`spec.md` §4.6: "lockup(direction, true) sets the lock without
    /// disarming").
    pub fn set_read_lock(&mut self, locked: bool) {
        self.lock.read = locked;
    }

    pub fn set_write_lock(&mut self, locked: bool) {
        self.lock.write = locked;
    }

    #[must_use]
    pub fn read_locked(&self) -> bool {
        self.lock.read
    }

    #[must_use]
    pub fn write_locked(&self) -> bool {
        self.lock.write
    }

    pub fn set_read_watermark(&mut self, watermark: Watermark) {
        self.read_watermark = watermark;
    }

    pub fn set_write_watermark(&mut self, watermark: Watermark) {
        self.write_watermark = watermark;
    }

    #[must_use]
    pub fn read_watermark(&self) -> Watermark {
        self.read_watermark
    }

    #[must_use]
    pub fn write_watermark(&self) -> Watermark {
        self.write_watermark
    }

    pub fn set_timeouts(&mut self, policy: TimeoutPolicy) {
        self.timeouts = policy;
    }

    #[must_use]
    pub fn timeouts(&self) -> TimeoutPolicy {
        self.timeouts
    }

    /// Re-arm the read watchdog; called on every delivered read callback
    /// (`spec.md` §4.6).
    pub fn touch_read(&mut self) {
        self.last_read_at = Instant::now();
    }

    pub fn touch_write(&mut self) {
        self.last_write_at = Instant::now();
    }

    /// Whether the read-side inactivity timeout has elapsed.
    #[must_use]
    pub fn read_timed_out(&self, now: Instant) -> bool {
        match self.timeouts.read_secs {
            Some(secs) => now.duration_since(self.last_read_at) >= Duration::from_secs(secs),
            None => false,
        }
    }

    #[must_use]
    pub fn write_timed_out(&self, now: Instant) -> bool {
        match self.timeouts.write_secs {
            Some(secs) => now.duration_since(self.last_write_at) >= Duration::from_secs(secs),
            None => false,
        }
    }

    /// Enqueue bytes for the writer turn to drain (`spec.md` §4.6: "Writers
    /// push bytes into an outgoing queue on the broker").
    pub fn enqueue_write(&mut self, bytes: &[u8]) {
        self.outbox.extend(bytes);
    }

    /// Drain up to `max` bytes (bounded by the write watermark) for the
    /// writer to hand to the socket; returns the drained bytes.
    pub fn drain_outbox(&mut self, max: usize) -> Vec<u8> {
        let n = max.min(self.outbox.len());
        self.outbox.drain(..n).collect()
    }

    #[must_use]
    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("id", &self.id)
            .field("scheme_id", &self.scheme_id)
            .field("state", &self.state)
            .field("transport", &self.transport)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_ids_are_unique_and_monotonic() {
        let a = next_broker_id();
        let b = next_broker_id();
        assert!(b > a);
    }

    #[test]
    fn new_broker_starts_idle() {
        let b = Broker::new(1, Token(0), Transport::Tcp);
        assert_eq!(b.state(), BrokerState::Idle);
    }

    #[test]
    fn lock_bit_does_not_change_state() {
        let mut b = Broker::new(1, Token(0), Transport::Tcp);
        b.mark_open();
        b.set_read_lock(true);
        assert!(b.read_locked());
        assert_eq!(b.state(), BrokerState::Open);
    }

    #[test]
    fn outbox_drains_bounded_by_max() {
        let mut b = Broker::new(1, Token(0), Transport::Tcp);
        b.enqueue_write(&[1, 2, 3, 4, 5]);
        let drained = b.drain_outbox(3);
        assert_eq!(drained, vec![1, 2, 3]);
        assert_eq!(b.outbox_len(), 2);
    }

    #[test]
    fn read_timeout_fires_after_configured_duration() {
        let mut b = Broker::new(1, Token(0), Transport::Tcp);
        b.set_timeouts(TimeoutPolicy {
            read_secs: Some(0),
            ..TimeoutPolicy::default()
        });
        std::thread::sleep(Duration::from_millis(5));
        assert!(b.read_timed_out(Instant::now()));
    }

    #[test]
    fn disabled_timeout_never_fires() {
        let b = Broker::new(1, Token(0), Transport::Tcp);
        assert!(!b.read_timed_out(Instant::now() + Duration::from_secs(3600)));
    }
}
