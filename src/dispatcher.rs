//! The event dispatcher — a single-threaded reactor wrapping a platform
//! multiplexer (`spec.md` §4.5).
//!
//! `spec.md` §9 asks, as a REDESIGN FLAG, for "an internal event-library
//! abstraction (trait/interface) with one pluggable backend" rather than the
//! source's hand-rolled per-platform `#ifdef` tree. [`Reactor`] is that
//! trait; [`MioReactor`] is its sole implementation, built on `mio`, which
//! already does the epoll/kqueue/event-ports/IOCP dispatch mio itself
//! supports across every target tier 1/2 platform.

use std::io;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use mio::{Events, Interest, Poll, Token};

use crate::constants::{DEFAULT_FREQ_MS, POLL_EVENTS_CAPACITY};
use crate::notifier::Notifier;

/// Internal event-multiplexer abstraction; the dispatcher drives one of
/// these, never mio directly, so a virtual/shared-loop backend can be
/// substituted (`spec.md` §4.5, `virt` mode).
pub trait Reactor {
    /// Register interest for `token`, replacing any prior registration.
    fn arm(&mut self, token: Token, source: &mut dyn mio::event::Source, interest: Interest) -> io::Result<()>;
    /// Remove interest for `token`.
    fn disarm(&mut self, source: &mut dyn mio::event::Source) -> io::Result<()>;
    /// Run one multiplexer iteration, blocking up to `timeout` (`None` =
    /// indefinite, `Some(Duration::ZERO)` = non-blocking poll).
    fn run_once(&mut self, timeout: Option<Duration>) -> io::Result<Events>;
    /// Break a currently blocked (or about to block) `run_once` immediately.
    fn break_loop(&self) -> io::Result<()>;
    /// Suspend event delivery without tearing down registrations
    /// (`spec.md` §4.5, `freeze(true)`).
    fn suspend(&mut self);
    /// Resume event delivery (`spec.md` §4.5, `freeze(false)`).
    fn resume(&mut self);
}

/// mio-backed [`Reactor`]. Owns its `Poll` unless constructed in `virt` mode
/// over a caller-supplied handle (`spec.md` §4.5, "virt mode").
pub struct MioReactor {
    poll: Poll,
    wakeup_token: Token,
    notifier: Notifier,
    frozen: bool,
}

impl MioReactor {
    /// Create an owning reactor with a fresh `mio::Poll` and notifier.
    pub fn owning() -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut notifier = Notifier::new()?;
        let wakeup_token = Token(usize::MAX);
        poll.registry()
            .register(notifier.as_source(), wakeup_token, Interest::READABLE)?;
        Ok(Self {
            poll,
            wakeup_token,
            notifier,
            frozen: false,
        })
    }

    /// Token reserved for the notifier; never handed out to broker events.
    #[must_use]
    pub fn wakeup_token(&self) -> Token {
        self.wakeup_token
    }

    /// Access the notifier, e.g. to hand its `notify` closure to another
    /// thread (`spec.md` §5, cross-thread entry point).
    #[must_use]
    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Drain and discard one pending notifier payload after observing a
    /// wakeup event, so the fd goes back to non-readable.
    pub fn drain_wakeup(&self) {
        let _ = self.notifier.event();
    }
}

impl Reactor for MioReactor {
    fn arm(&mut self, token: Token, source: &mut dyn mio::event::Source, interest: Interest) -> io::Result<()> {
        match self.poll.registry().register(source, token, interest) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                self.poll.registry().reregister(source, token, interest)
            }
            Err(e) => Err(e),
        }
    }

    fn disarm(&mut self, source: &mut dyn mio::event::Source) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    fn run_once(&mut self, timeout: Option<Duration>) -> io::Result<Events> {
        let mut events = Events::with_capacity(POLL_EVENTS_CAPACITY);
        if self.frozen {
            // `spec.md` §4.5: freeze pauses delivery without tearing down
            // events — we still must not block the thread, so sleep briefly.
            std::thread::sleep(timeout.unwrap_or(Duration::from_millis(DEFAULT_FREQ_MS)));
            return Ok(events);
        }
        match self.poll.poll(&mut events, timeout) {
            Ok(()) => Ok(events),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(events),
            Err(e) => Err(e),
        }
    }

    fn break_loop(&self) -> io::Result<()> {
        self.notifier.notify(0)
    }

    fn suspend(&mut self) {
        self.frozen = true;
        debug!("dispatcher: frozen");
    }

    fn resume(&mut self) {
        self.frozen = false;
        debug!("dispatcher: resumed");
    }
}

/// Dispatcher lifecycle state (`spec.md` §4.5: "`{initialized, working,
/// frozen, easy_mode, virt, freq_ms}`").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Never started.
    Idle,
    /// Inside the reactor loop.
    Working,
    /// `stop()` requested; the loop will exit after this turn.
    Stopping,
}

/// The single-threaded reactor driving one [`crate::core::Core`].
pub struct Dispatcher {
    reactor: MioReactor,
    status: Status,
    easy_mode: bool,
    freq_ms: u64,
    virt: bool,
}

impl Dispatcher {
    /// Build a dispatcher owning its own multiplexer (`spec.md` §9,
    /// "Dispatcher::owning()").
    pub fn owning() -> io::Result<Self> {
        Ok(Self {
            reactor: MioReactor::owning()?,
            status: Status::Idle,
            easy_mode: false,
            freq_ms: 0,
            virt: false,
        })
    }

    /// Build a dispatcher sharing an externally-owned loop handle
    /// (`spec.md` §9, "Dispatcher::with_shared_loop(handle)"; §4.8
    /// `bind(otherCore)`). The shared reactor is still this dispatcher's own
    /// `MioReactor` instance today — `virt` records the intent so `rebase`
    /// refuses to tear down a loop this dispatcher doesn't own.
    pub fn with_shared_loop(reactor: MioReactor) -> Self {
        Self {
            reactor,
            status: Status::Idle,
            easy_mode: false,
            freq_ms: 0,
            virt: true,
        }
    }

    /// True once `start()` has been called and `stop()` hasn't finished.
    #[must_use]
    pub fn is_working(&self) -> bool {
        self.status == Status::Working
    }

    /// Begin the reactor loop. Idempotent: calling `start()` twice is a
    /// no-op on the second call (`spec.md` §4.8, "double-start ... are
    /// no-ops").
    pub fn start(&mut self) {
        if self.status == Status::Working {
            return;
        }
        self.status = Status::Working;
        info!("dispatcher: started");
    }

    /// Request the loop stop; takes effect at the top of the next turn.
    /// Issues a wakeup so a blocked `run_once` observes it immediately
    /// (`spec.md` §4.5, "stop() ... issues a wakeup").
    pub fn stop(&mut self) {
        if self.status != Status::Working {
            return;
        }
        self.status = Status::Stopping;
        if let Err(e) = self.reactor.break_loop() {
            warn!("dispatcher: wakeup during stop failed: {e}");
        }
    }

    /// Mark the loop fully stopped; called by the owner once its
    /// `closedown` hook has run (`spec.md` §4.8, status state machine).
    pub fn finish_stop(&mut self) {
        self.status = Status::Idle;
        info!("dispatcher: stopped");
    }

    /// Force the multiplexer to return immediately (`spec.md` §4.5,
    /// `kick()`).
    pub fn kick(&self) {
        if let Err(e) = self.reactor.break_loop() {
            warn!("dispatcher: kick failed: {e}");
        }
    }

    /// Pause or resume event delivery without tearing down registrations.
    pub fn freeze(&mut self, frozen: bool) {
        if frozen {
            self.reactor.suspend();
        } else {
            self.reactor.resume();
        }
    }

    /// `frequency(ms)` is the source of truth for easy-mode polling: `ms >
    /// 0` enables easy mode at that interval, `ms == 0` disables it
    /// (`spec.md` §4.5 / §9 Open Question, resolved in `SPEC_FULL.md`).
    pub fn frequency(&mut self, ms: u64) {
        self.freq_ms = ms;
        self.easy_mode = ms > 0;
    }

    /// Sugar over `frequency`: `true` enables the default frequency,
    /// `false` disables easy mode entirely.
    pub fn easily(&mut self, enabled: bool) {
        self.frequency(if enabled { DEFAULT_FREQ_MS } else { 0 });
    }

    /// Whether easy (polling) mode is active.
    #[must_use]
    pub fn easy_mode(&self) -> bool {
        self.easy_mode
    }

    /// Configured polling frequency in milliseconds; `0` means "blocking
    /// indefinitely between turns" (timers permitting).
    #[must_use]
    pub fn freq_ms(&self) -> u64 {
        self.freq_ms
    }

    /// Tear down and reinitialize the underlying multiplexer. Legal only
    /// between `stop()` and `start()` (`spec.md` §4.5, `rebase()`); refuses
    /// on a `virt` dispatcher since it doesn't own the loop it would
    /// rebuild.
    pub fn rebase(&mut self) -> io::Result<()> {
        if self.status == Status::Working {
            return Err(io::Error::other("rebase called while dispatcher is running"));
        }
        if self.virt {
            return Err(io::Error::other("rebase called on a virt (shared-loop) dispatcher"));
        }
        self.reactor = MioReactor::owning()?;
        info!("dispatcher: rebased");
        Ok(())
    }

    /// Run one turn: one multiplexer iteration sized by `easy_mode`/timer
    /// deadlines, then the `freq_ms` sleep (`spec.md` §4.5, `start()`
    /// contract). Returns the events observed this turn.
    pub fn run_once(&mut self, next_timer_deadline: Option<Instant>) -> io::Result<Events> {
        let timeout = if self.easy_mode {
            Some(Duration::from_millis(self.freq_ms))
        } else {
            next_timer_deadline.map(|d| d.saturating_duration_since(Instant::now()))
        };
        let events = self.reactor.run_once(timeout)?;
        if self.easy_mode && self.freq_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.freq_ms));
        }
        Ok(events)
    }

    /// Mutable access to the underlying reactor, for `Broker`/`Scheme` event
    /// (re)registration.
    pub fn reactor_mut(&mut self) -> &mut MioReactor {
        &mut self.reactor
    }

    /// The notifier's wakeup token, reserved and never handed to a broker.
    #[must_use]
    pub fn wakeup_token(&self) -> Token {
        self.reactor.wakeup_token()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_stop_is_idempotent() {
        let mut d = Dispatcher::owning().expect("owning dispatcher");
        d.start();
        d.start();
        assert!(d.is_working());
        d.stop();
        d.stop();
        d.finish_stop();
        assert!(!d.is_working());
    }

    /// `SPEC_FULL.md`'s resolved Open Question: `easily(bool)` is sugar for
    /// `frequency(ms)`.
    #[test]
    fn easily_is_sugar_for_frequency() {
        let mut d = Dispatcher::owning().expect("owning dispatcher");
        d.easily(true);
        assert!(d.easy_mode());
        assert_eq!(d.freq_ms(), DEFAULT_FREQ_MS);

        d.easily(false);
        assert!(!d.easy_mode());
        assert_eq!(d.freq_ms(), 0);

        d.frequency(25);
        assert!(d.easy_mode());
        assert_eq!(d.freq_ms(), 25);
    }

    #[test]
    fn rebase_refused_while_working() {
        let mut d = Dispatcher::owning().expect("owning dispatcher");
        d.start();
        assert!(d.rebase().is_err());
    }

    #[test]
    fn rebase_refused_on_virt_dispatcher() {
        let reactor = MioReactor::owning().expect("reactor");
        let mut d = Dispatcher::with_shared_loop(reactor);
        assert!(d.rebase().is_err());
    }
}
