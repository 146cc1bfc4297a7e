//! `Core`: the public reactor façade (`spec.md` §3 "Core", §4.8).
//!
//! Owns a [`Dispatcher`], a timer table, a scheme table and a denormalized
//! broker index for O(1) cross-scheme lookup. All callback dispatch, all
//! socket I/O and all timer firings happen on the thread that calls
//! [`Core::start`] (`spec.md` §5).

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::{debug, info, warn};
use mio::{Interest, Token};

use crate::boost;
use crate::broker::{Broker, BrokerId, BrokerState, Transport};
use crate::callbacks::CallbackSet;
use crate::config::CoreConfig;
use crate::constants::RECENTLY_DISCONNECTED_GRACE;
use crate::dispatcher::Dispatcher;
use crate::error::{CoreError, CoreResult};
use crate::limits;
use crate::scheme::{Scheme, SchemeConfig, SchemeId};
use crate::signals;
use crate::socket::{self, SocketOptions};
use crate::timer::{TimerId, TimerWheel};

/// Core status state machine (`spec.md` §3: "STOP → START → STOP").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Stop,
    Start,
}

/// Token bookkeeping mapping a mio `Token` back to `(scheme_id, broker_id)`.
#[derive(Debug, Clone, Copy)]
struct TokenEntry {
    scheme_id: SchemeId,
    broker_id: BrokerId,
}

/// Process-wide reactor owner (`spec.md` §3 "Core").
pub struct Core {
    config: CoreConfig,
    status: Status,
    dispatcher: Dispatcher,
    timers: TimerWheel,
    schemes: HashMap<SchemeId, Scheme>,
    next_scheme_id: SchemeId,
    /// Denormalized index: broker id -> owning scheme id, for O(1)
    /// cross-scheme lookup (`spec.md` §3).
    broker_index: HashMap<BrokerId, SchemeId>,
    tokens: HashMap<Token, TokenEntry>,
    next_token: usize,
    recently_disconnected: HashMap<BrokerId, Instant>,
    global_callbacks: Arc<Mutex<CallbackSet>>,
    /// `bind`/`unbind` peer cores sharing this dispatcher (`spec.md` §4.8).
    bound_cores: usize,
    listeners: HashMap<BrokerId, mio::net::TcpListener>,
    streams: HashMap<BrokerId, mio::net::TcpStream>,
    /// Reverse lookup from an armed connect-watchdog's timer id back to the
    /// broker it guards (`spec.md` §4.6, "CONNECT timeout is single-shot").
    connect_timeouts: HashMap<TimerId, (SchemeId, BrokerId)>,
    /// Reverse lookup from an armed reconnect redial timer back to the
    /// broker it retries (`spec.md` §4.8 reconnect policy; `spec.md`:291
    /// "each retry uses a fresh socket").
    reconnect_timeouts: HashMap<TimerId, (SchemeId, BrokerId)>,
}

impl Core {
    /// Construct a `Core` in `STOP` state; call [`Core::start`] to begin the
    /// reactor loop.
    pub fn new(config: CoreConfig) -> CoreResult<Self> {
        let dispatcher = Dispatcher::owning().map_err(|e| CoreError::Start(format!("dispatcher init failed: {e}")))?;
        socket::suppress_sigpipe();

        let effective_fds = limits::raise_to(config.fds_target);
        info!("core: effective RLIMIT_NOFILE ceiling is {effective_fds}");

        Ok(Self {
            config,
            status: Status::Stop,
            dispatcher,
            timers: TimerWheel::new(),
            schemes: HashMap::new(),
            next_scheme_id: 1,
            broker_index: HashMap::new(),
            tokens: HashMap::new(),
            next_token: 1,
            recently_disconnected: HashMap::new(),
            global_callbacks: Arc::new(Mutex::new(CallbackSet::new())),
            bound_cores: 0,
            listeners: HashMap::new(),
            streams: HashMap::new(),
            connect_timeouts: HashMap::new(),
            reconnect_timeouts: HashMap::new(),
        })
    }

    fn alloc_token(&mut self) -> Token {
        let t = Token(self.next_token);
        self.next_token += 1;
        t
    }

    /// `add(scheme) -> sid` (`spec.md` §4.8).
    pub fn add(&mut self, config: SchemeConfig) -> SchemeId {
        let sid = self.next_scheme_id;
        self.next_scheme_id += 1;
        self.schemes.insert(sid, Scheme::new(sid, config));
        sid
    }

    /// `remove(sid)`: drop one scheme, closing every broker it owns first so
    /// each one's events, socket and any pending connect watchdog are torn
    /// down through the normal `close` path rather than just dropped from
    /// the map.
    pub fn remove(&mut self, sid: SchemeId) {
        let bids: Vec<BrokerId> = self
            .schemes
            .get(&sid)
            .map(|s| s.iter().map(|(&bid, _)| bid).collect())
            .unwrap_or_default();
        for bid in bids {
            self.close(bid);
        }
        self.schemes.remove(&sid);
    }

    /// `remove()`: drop every scheme.
    pub fn remove_all(&mut self) {
        let ids: Vec<SchemeId> = self.schemes.keys().copied().collect();
        for sid in ids {
            self.remove(sid);
        }
    }

    /// `start()`: idempotent (`spec.md` §4.8: "double-start ... are
    /// no-ops").
    pub fn start(&mut self) {
        if self.status == Status::Start {
            return;
        }
        self.status = Status::Start;
        if self.config.boost_sysctls {
            boost::boost();
        }
        self.dispatcher.frequency(self.config.dispatcher_frequency_ms);
        if self.config.signal_interception {
            #[cfg(unix)]
            signals::install_for_notifier(self.dispatcher.reactor_mut().notifier());
        }
        self.dispatcher.start();
        info!("core: started");
    }

    /// `stop()`: idempotent; cancels all pending events and timers
    /// (`spec.md` §4.8, §5).
    pub fn stop(&mut self) {
        if self.status != Status::Start {
            return;
        }
        self.dispatcher.stop();
        self.remove_all();
        self.timers.rebase();
        if self.config.signal_interception {
            #[cfg(unix)]
            signals::remove();
        }
        self.dispatcher.finish_stop();
        self.status = Status::Stop;
        info!("core: stopped");
    }

    /// `open(sid)` for a server scheme: bind, listen, arm ACCEPT
    /// (`spec.md` §4.8 "open (server)").
    pub fn open_server(&mut self, sid: SchemeId, addr: SocketAddr) -> CoreResult<BrokerId> {
        let backlog = self
            .schemes
            .get(&sid)
            .ok_or_else(|| CoreError::Start(format!("no scheme {sid}")))?
            .config()
            .listen_backlog;
        let opts = SocketOptions::default();
        let mut listener = socket::tcp_listen(addr, backlog, &opts)?;

        let token = self.alloc_token();
        self.dispatcher
            .reactor_mut()
            .arm(token, &mut listener, Interest::READABLE)
            .map_err(|e| CoreError::Start(format!("arming listener failed: {e}")))?;

        let mut broker = Broker::new(sid, token, Transport::Tcp);
        broker.mark_listening();
        let bid = broker.id();

        let scheme = self
            .schemes
            .get_mut(&sid)
            .ok_or_else(|| CoreError::Start(format!("no scheme {sid}")))?;
        scheme.insert(broker);
        scheme.set_listener(bid);
        self.broker_index.insert(bid, sid);
        self.tokens.insert(token, TokenEntry { scheme_id: sid, broker_id: bid });
        self.listeners.insert(bid, listener);
        info!("core: scheme {sid} listening on {addr}");
        Ok(bid)
    }

    /// `open(sid)` for a client scheme: non-blocking connect, arm CONNECT
    /// (`spec.md` §4.8 "open (client)").
    pub fn open_client(&mut self, sid: SchemeId, addr: SocketAddr) -> CoreResult<BrokerId> {
        let opts = SocketOptions::default();
        let mut stream = socket::tcp_connect(addr, &opts)?;

        let default_timeouts = self
            .schemes
            .get(&sid)
            .ok_or_else(|| CoreError::Connect(format!("no scheme {sid}")))?
            .config()
            .default_timeouts;

        let token = self.alloc_token();
        self.dispatcher
            .reactor_mut()
            .arm(token, &mut stream, Interest::WRITABLE)
            .map_err(|e| CoreError::Connect(format!("arming connect watcher failed: {e}")))?;

        let mut broker = Broker::new(sid, token, Transport::Tcp);
        broker.set_remote(addr.ip().to_string(), addr.port());
        broker.set_timeouts(default_timeouts);
        broker.begin_connect();
        let bid = broker.id();

        let scheme = self
            .schemes
            .get_mut(&sid)
            .ok_or_else(|| CoreError::Connect(format!("no scheme {sid}")))?;
        scheme.insert(broker);
        self.broker_index.insert(bid, sid);
        self.tokens.insert(token, TokenEntry { scheme_id: sid, broker_id: bid });
        self.streams.insert(bid, stream);

        if let Some(secs) = default_timeouts.connect_secs {
            let tid = self.timers.arm(std::time::Duration::from_secs(secs), false);
            self.connect_timeouts.insert(tid, (sid, bid));
            if let Some(scheme) = self.schemes.get_mut(&sid) {
                if let Some(broker) = scheme.get_mut(bid) {
                    broker.connect_timer = Some(tid);
                }
            }
        }

        debug!("core: scheme {sid} connecting to {addr}");
        Ok(bid)
    }

    /// Disarms a broker's connect watchdog if one is still pending, e.g.
    /// because the connect completed or the broker closed first.
    fn cancel_connect_timeout(&mut self, sid: SchemeId, bid: BrokerId) {
        let tid = self
            .schemes
            .get_mut(&sid)
            .and_then(|s| s.get_mut(bid))
            .and_then(|b| b.connect_timer.take());
        if let Some(tid) = tid {
            self.timers.clear(tid);
            self.connect_timeouts.remove(&tid);
        }
    }

    /// Disarms a broker's pending redial, if a reconnect is scheduled but
    /// hasn't fired yet (`spec.md` §4.8 reconnect policy).
    fn cancel_reconnect_timeout(&mut self, sid: SchemeId, bid: BrokerId) {
        let tid = self
            .schemes
            .get_mut(&sid)
            .and_then(|s| s.get_mut(bid))
            .and_then(|b| b.reconnect_timer.take());
        if let Some(tid) = tid {
            self.timers.clear(tid);
            self.reconnect_timeouts.remove(&tid);
        }
    }

    /// `close(bid)` (`spec.md` §4.8 "close(bid)"): if the broker is
    /// `CONNECTING`, cancel the connect timer and any pending redial first;
    /// disarm events, tear down the socket, deliver exactly one
    /// `disconnect`.
    pub fn close(&mut self, bid: BrokerId) {
        let Some(&sid) = self.broker_index.get(&bid) else {
            return;
        };
        let is_connecting = self
            .schemes
            .get(&sid)
            .and_then(|s| s.get(bid))
            .is_some_and(|b| b.state() == BrokerState::Connecting);
        if is_connecting {
            self.cancel_connect_timeout(sid, bid);
            self.cancel_reconnect_timeout(sid, bid);
        }

        let Some(scheme) = self.schemes.get_mut(&sid) else {
            return;
        };
        if let Some(broker) = scheme.get_mut(bid) {
            broker.begin_close();
            let token = broker.token;
            if let Some(mut stream) = self.streams.remove(&bid) {
                let _ = self.dispatcher.reactor_mut().disarm(&mut stream);
            }
            if let Some(mut listener) = self.listeners.remove(&bid) {
                let _ = self.dispatcher.reactor_mut().disarm(&mut listener);
            }
            self.tokens.remove(&token);
        }
        if let Some(mut broker) = scheme.remove(bid) {
            broker.mark_closed();
            scheme.callbacks_mut().dispatch_disconnect(bid);
            self.global_callbacks.lock().expect("callback lock poisoned").dispatch_disconnect(bid);
        }
        self.broker_index.remove(&bid);
        self.recently_disconnected.insert(bid, Instant::now());
    }

    /// `close()`: close every broker across every scheme.
    pub fn close_all(&mut self) {
        let ids: Vec<BrokerId> = self.broker_index.keys().copied().collect();
        for bid in ids {
            self.close(bid);
        }
    }

    /// `read(bid)` (`spec.md` §4.8): pull up to `marker.read.max` bytes and
    /// deliver via the `read` callback; returns when the socket would block.
    pub fn read(&mut self, bid: BrokerId) -> CoreResult<usize> {
        let Some(&sid) = self.broker_index.get(&bid) else {
            return Ok(0);
        };
        let max = self
            .schemes
            .get(&sid)
            .and_then(|s| s.get(bid))
            .map(|b| b.read_watermark().max)
            .unwrap_or(64 * 1024);

        let Some(stream) = self.streams.get_mut(&bid) else {
            return Ok(0);
        };

        let mut buf = vec![0u8; max];
        let mut total = 0;
        loop {
            match stream.read(&mut buf[total..]) {
                Ok(0) => {
                    self.close(bid);
                    return Ok(total);
                }
                Ok(n) => {
                    total += n;
                    if total >= max {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("core: read({bid}) failed: {e}");
                    self.close(bid);
                    return Err(CoreError::Connect(format!("read failed: {e}")));
                }
            }
        }

        if total > 0 {
            if let Some(scheme) = self.schemes.get_mut(&sid) {
                if let Some(broker) = scheme.get_mut(bid) {
                    broker.touch_read();
                    if broker.read_locked() {
                        return Ok(total);
                    }
                }
                scheme.callbacks_mut().dispatch_read(bid, &buf[..total]);
            }
        }
        Ok(total)
    }

    /// `write(buf, size, bid)` (`spec.md` §4.8): enqueue bytes; may
    /// partially drain immediately.
    pub fn write(&mut self, bid: BrokerId, buf: &[u8]) -> CoreResult<()> {
        let Some(&sid) = self.broker_index.get(&bid) else {
            return Err(CoreError::Connect(format!("no such broker {bid}")));
        };
        if let Some(scheme) = self.schemes.get_mut(&sid) {
            if let Some(broker) = scheme.get_mut(bid) {
                broker.enqueue_write(buf);
            }
        }
        self.flush_outbox(bid)
    }

    fn flush_outbox(&mut self, bid: BrokerId) -> CoreResult<()> {
        let Some(&sid) = self.broker_index.get(&bid) else {
            return Ok(());
        };
        let max = self
            .schemes
            .get(&sid)
            .and_then(|s| s.get(bid))
            .map(|b| b.write_watermark().max)
            .unwrap_or(64 * 1024);

        let Some(scheme) = self.schemes.get_mut(&sid) else {
            return Ok(());
        };
        let Some(broker) = scheme.get_mut(bid) else {
            return Ok(());
        };
        if broker.write_locked() {
            return Ok(());
        }
        let chunk = broker.drain_outbox(max);
        if chunk.is_empty() {
            return Ok(());
        }
        drop(scheme);

        let Some(stream) = self.streams.get_mut(&bid) else {
            return Ok(());
        };
        match stream.write(&chunk) {
            Ok(n) if n == chunk.len() => {
                if let Some(scheme) = self.schemes.get_mut(&sid) {
                    if let Some(broker) = scheme.get_mut(bid) {
                        broker.touch_write();
                    }
                    scheme.callbacks_mut().dispatch_write(bid);
                }
                Ok(())
            }
            Ok(n) => {
                // Partial write is normal (`spec.md` §4.6): push the
                // undrained remainder back to the front of the outbox.
                if let Some(scheme) = self.schemes.get_mut(&sid) {
                    if let Some(broker) = scheme.get_mut(bid) {
                        let mut remainder = chunk[n..].to_vec();
                        remainder.extend(broker.drain_outbox(usize::MAX));
                        broker.enqueue_write(&remainder);
                    }
                }
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if let Some(scheme) = self.schemes.get_mut(&sid) {
                    if let Some(broker) = scheme.get_mut(bid) {
                        broker.enqueue_write(&chunk);
                    }
                }
                Ok(())
            }
            Err(e) => {
                warn!("core: write({bid}) failed: {e}");
                self.close(bid);
                Err(CoreError::Connect(format!("write failed: {e}")))
            }
        }
    }

    /// `setTimeout(delay_ms, fn) -> tid`.
    pub fn set_timeout(&mut self, delay_ms: u64) -> u16 {
        self.timers.arm(std::time::Duration::from_millis(delay_ms), false)
    }

    /// `setInterval(delay_ms, fn) -> tid`.
    pub fn set_interval(&mut self, delay_ms: u64) -> u16 {
        self.timers.arm(std::time::Duration::from_millis(delay_ms), true)
    }

    /// `clearTimer(tid)`.
    pub fn clear_timer(&mut self, tid: u16) {
        self.timers.clear(tid);
    }

    /// `rebase()`: stop, rebuild dispatcher, restart.
    pub fn rebase(&mut self) -> CoreResult<()> {
        let was_running = self.status == Status::Start;
        if was_running {
            self.stop();
        }
        self.dispatcher
            .rebase()
            .map_err(|e| CoreError::Start(format!("rebase failed: {e}")))?;
        if was_running {
            self.start();
        }
        Ok(())
    }

    /// `bind(otherCore)`: share this core's dispatcher with another Core
    /// (`spec.md` §4.8). Tracked as a reference count; actual event-loop
    /// sharing is modeled by [`Dispatcher::with_shared_loop`].
    pub fn bind(&mut self) {
        self.bound_cores += 1;
    }

    /// `unbind(otherCore)`.
    pub fn unbind(&mut self) {
        self.bound_cores = self.bound_cores.saturating_sub(1);
    }

    pub fn easily(&mut self, enabled: bool) {
        self.dispatcher.easily(enabled);
    }

    pub fn freeze(&mut self, frozen: bool) {
        self.dispatcher.freeze(frozen);
    }

    pub fn frequency(&mut self, ms: u64) {
        self.dispatcher.frequency(ms);
    }

    pub fn signal_interception(&mut self, enabled: bool) {
        self.config.signal_interception = enabled;
    }

    /// Publish the global (core-wide) callback registry.
    pub fn callbacks(&self) -> Arc<Mutex<CallbackSet>> {
        Arc::clone(&self.global_callbacks)
    }

    /// Publish a per-scheme callback registry (`spec.md` §4.7, "Schemes
    /// publish a callback set").
    pub fn scheme_callbacks(&mut self, sid: SchemeId) -> Option<&mut CallbackSet> {
        self.schemes.get_mut(&sid).map(Scheme::callbacks_mut)
    }

    /// Purge brokers that have been on the recently-disconnected list
    /// longer than the grace period (`spec.md` §3, §5: "a timer tick every
    /// 3 s purging entries older than 10 s").
    pub fn sweep_recently_disconnected(&mut self) {
        let now = Instant::now();
        self.recently_disconnected
            .retain(|_, &mut at| now.duration_since(at) < RECENTLY_DISCONNECTED_GRACE);
    }

    /// Whether `bid` is still recognized as live (neither closed nor never
    /// existed).
    #[must_use]
    pub fn is_live(&self, bid: BrokerId) -> bool {
        self.broker_index.contains_key(&bid)
    }

    /// The OS-assigned local address of a listening broker, e.g. to learn
    /// the ephemeral port handed out after `open_server` with port `0`.
    pub fn local_addr(&self, bid: BrokerId) -> CoreResult<SocketAddr> {
        self.listeners
            .get(&bid)
            .ok_or_else(|| CoreError::Start(format!("no listener for broker {bid}")))?
            .local_addr()
            .map_err(|e| CoreError::Start(format!("local_addr failed: {e}")))
    }

    #[must_use]
    pub fn status(&self) -> Status {
        self.status
    }

    /// Run one reactor turn directly, for callers embedding their own loop
    /// (e.g. the demo binary) rather than calling a blocking `run_forever`.
    pub fn tick(&mut self) -> CoreResult<()> {
        if self.status != Status::Start {
            return Ok(());
        }
        let deadline = self.timers.next_deadline();
        let events = self
            .dispatcher
            .run_once(deadline)
            .map_err(|e| CoreError::Start(format!("reactor turn failed: {e}")))?;

        for fired in self.timers.poll(Instant::now()) {
            if let Some((sid, bid)) = self.connect_timeouts.remove(&fired.id) {
                self.fire_connect_timeout(sid, bid, fired.id);
                continue;
            }
            if let Some((sid, bid)) = self.reconnect_timeouts.remove(&fired.id) {
                self.redial(sid, bid);
                continue;
            }
            // Timer-to-broker association for user timers is left to the
            // embedder; the global callback set still observes every firing
            // via the generic `timeout` slot with broker id 0 (core-level
            // timer).
            self.global_callbacks
                .lock()
                .expect("callback lock poisoned")
                .dispatch_timeout(0, fired.id);
        }

        for event in events.iter() {
            if event.token() == self.dispatcher.wakeup_token() {
                self.dispatcher.reactor_mut().drain_wakeup();
                if let Some(signum) = signals::take_last_signal() {
                    signals::handle_on_reactor_thread(signum, signals::ProcessRole::Master, None);
                }
                continue;
            }
            let Some(entry) = self.tokens.get(&event.token()).copied() else {
                continue;
            };
            self.dispatch_socket_event(entry, event);
        }

        self.sweep_recently_disconnected();
        Ok(())
    }

    fn dispatch_socket_event(&mut self, entry: TokenEntry, event: &mio::event::Event) {
        let TokenEntry { scheme_id, broker_id } = entry;

        if self.listeners.contains_key(&broker_id) {
            if event.is_readable() {
                self.accept_loop(scheme_id, broker_id);
            }
            return;
        }

        let was_connecting = self
            .schemes
            .get(&scheme_id)
            .and_then(|s| s.get(broker_id))
            .map(|b| b.state() == BrokerState::Connecting)
            .unwrap_or(false);

        if was_connecting && event.is_writable() {
            self.complete_connect(scheme_id, broker_id);
            return;
        }

        if event.is_readable() {
            let _ = self.read(broker_id);
        }
        if event.is_writable() {
            let _ = self.flush_outbox(broker_id);
        }
    }

    fn accept_loop(&mut self, sid: SchemeId, listener_bid: BrokerId) {
        loop {
            let Some(listener) = self.listeners.get(&listener_bid) else {
                return;
            };
            match listener.accept() {
                Ok((mut stream, addr)) => {
                    let token = self.alloc_token();
                    if let Err(e) = self.dispatcher.reactor_mut().arm(token, &mut stream, Interest::READABLE) {
                        warn!("core: arming accepted socket failed: {e}");
                        continue;
                    }
                    let mut broker = Broker::new(sid, token, Transport::Tcp);
                    broker.set_remote(addr.ip().to_string(), addr.port());
                    broker.mark_open();
                    let bid = broker.id();
                    if let Some(scheme) = self.schemes.get_mut(&sid) {
                        scheme.insert(broker);
                        self.broker_index.insert(bid, sid);
                        self.tokens.insert(token, TokenEntry { scheme_id: sid, broker_id: bid });
                        self.streams.insert(bid, stream);
                        scheme.callbacks_mut().dispatch_accept(bid);
                        scheme.callbacks_mut().dispatch_connect(bid);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!("core: accept on scheme {sid} failed: {e}");
                    return;
                }
            }
        }
    }

    /// The `CONNECT` watchdog fired before the socket became writable
    /// (`spec.md` §4.6: "firing it triggers `timeout(bid, CONNECT)` and
    /// transitions the broker to CLOSING"; §8 scenario S3).
    fn fire_connect_timeout(&mut self, sid: SchemeId, bid: BrokerId, tid: TimerId) {
        warn!("core: connect timeout for broker {bid}");
        if let Some(scheme) = self.schemes.get_mut(&sid) {
            if let Some(broker) = scheme.get_mut(bid) {
                broker.connect_timer = None;
                broker.begin_close();
            }
            scheme.callbacks_mut().dispatch_timeout(bid, tid);
        }
        self.close(bid);
    }

    fn complete_connect(&mut self, sid: SchemeId, bid: BrokerId) {
        let Some(stream) = self.streams.get(&bid) else {
            return;
        };
        let result = stream.take_error();
        self.cancel_connect_timeout(sid, bid);
        match result {
            Ok(None) => {
                if let Some(scheme) = self.schemes.get_mut(&sid) {
                    if let Some(broker) = scheme.get_mut(bid) {
                        broker.mark_open();
                    }
                    scheme.callbacks_mut().dispatch_connect(bid);
                }
            }
            Ok(Some(e)) | Err(e) => {
                warn!("core: connect failed for broker {bid}: {e}");
                self.maybe_reconnect(sid, bid);
            }
        }
    }

    /// Reconnect policy (`spec.md` §4.8): on failure, if the scheme is kept
    /// alive and the attempt count hasn't exceeded the configured maximum,
    /// tear down the dead socket and schedule a redial; otherwise surface
    /// `disconnect`.
    fn maybe_reconnect(&mut self, sid: SchemeId, bid: BrokerId) {
        let should_retry = self.schemes.get(&sid).is_some_and(|s| {
            s.config().alive
                && s.get(bid).is_some_and(|b| b.attempts < s.config().max_attempts)
        });
        if !should_retry {
            self.close(bid);
            return;
        }

        if let Some(scheme) = self.schemes.get_mut(&sid) {
            if let Some(broker) = scheme.get_mut(bid) {
                broker.attempts += 1;
            }
        }

        // `spec.md`:291 "each retry uses a fresh socket": disarm and drop
        // the failed stream and its token now, before the redial timer
        // fires, so `redial` always starts from a clean slate.
        let token = self.schemes.get(&sid).and_then(|s| s.get(bid)).map(|b| b.token);
        if let Some(mut stream) = self.streams.remove(&bid) {
            let _ = self.dispatcher.reactor_mut().disarm(&mut stream);
        }
        if let Some(token) = token {
            self.tokens.remove(&token);
        }

        let tid = self.set_timeout(0);
        self.reconnect_timeouts.insert(tid, (sid, bid));
        if let Some(scheme) = self.schemes.get_mut(&sid) {
            if let Some(broker) = scheme.get_mut(bid) {
                broker.reconnect_timer = Some(tid);
            }
        }
    }

    /// Redial fired from `reconnect_timeouts`: opens a genuinely fresh
    /// socket to the broker's remote address, keeping the same broker id,
    /// and re-arms both the `WRITABLE` interest and the connect watchdog
    /// (`spec.md` §4.6, §4.8; `spec.md`:291 "each retry uses a fresh
    /// socket").
    fn redial(&mut self, sid: SchemeId, bid: BrokerId) {
        if let Some(scheme) = self.schemes.get_mut(&sid) {
            if let Some(broker) = scheme.get_mut(bid) {
                broker.reconnect_timer = None;
            }
        }
        let Some((ip, port)) = self
            .schemes
            .get(&sid)
            .and_then(|s| s.get(bid))
            .and_then(|b| Some((b.ip()?.to_string(), b.port()?)))
        else {
            self.close(bid);
            return;
        };
        let addr: SocketAddr = match format!("{ip}:{port}").parse() {
            Ok(addr) => addr,
            Err(e) => {
                warn!("core: reconnect address {ip}:{port} unparsable: {e}");
                self.close(bid);
                return;
            }
        };

        let opts = SocketOptions::default();
        let mut stream = match socket::tcp_connect(addr, &opts) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("core: reconnect dial to {addr} failed for broker {bid}: {e}");
                self.maybe_reconnect(sid, bid);
                return;
            }
        };

        let token = self.alloc_token();
        if let Err(e) = self.dispatcher.reactor_mut().arm(token, &mut stream, Interest::WRITABLE) {
            warn!("core: arming reconnect watcher failed for broker {bid}: {e}");
            self.maybe_reconnect(sid, bid);
            return;
        }

        let connect_secs = self.schemes.get(&sid).and_then(|s| s.get(bid)).and_then(|b| b.timeouts().connect_secs);

        if let Some(scheme) = self.schemes.get_mut(&sid) {
            if let Some(broker) = scheme.get_mut(bid) {
                broker.token = token;
                broker.begin_connect();
            }
        }
        self.tokens.insert(token, TokenEntry { scheme_id: sid, broker_id: bid });
        self.streams.insert(bid, stream);

        if let Some(secs) = connect_secs {
            let tid = self.timers.arm(std::time::Duration::from_secs(secs), false);
            self.connect_timeouts.insert(tid, (sid, bid));
            if let Some(scheme) = self.schemes.get_mut(&sid) {
                if let Some(broker) = scheme.get_mut(bid) {
                    broker.connect_timer = Some(tid);
                }
            }
        }

        debug!("core: broker {bid} retrying connect to {addr}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_remove_scheme() {
        let mut core = Core::new(CoreConfig::default()).expect("core");
        let sid = core.add(SchemeConfig::default());
        assert!(core.schemes.contains_key(&sid));
        core.remove(sid);
        assert!(!core.schemes.contains_key(&sid));
    }

    #[test]
    fn start_stop_idempotent() {
        let mut core = Core::new(CoreConfig::builder().signal_interception(false).build()).expect("core");
        core.start();
        core.start();
        assert_eq!(core.status(), Status::Start);
        core.stop();
        core.stop();
        assert_eq!(core.status(), Status::Stop);
    }

    #[test]
    fn timer_ids_recycle_through_core() {
        let mut core = Core::new(CoreConfig::default()).expect("core");
        let tid = core.set_timeout(5000);
        core.clear_timer(tid);
        let tid2 = core.set_timeout(5000);
        assert_eq!(tid, tid2);
    }

    #[test]
    fn remove_scheme_closes_brokers_mid_connect_and_disarms_watchdog() {
        let mut core = Core::new(CoreConfig::builder().signal_interception(false).build()).expect("core");
        let sid = core.add(SchemeConfig {
            default_timeouts: crate::broker::TimeoutPolicy { connect_secs: Some(30), ..Default::default() },
            ..SchemeConfig::default()
        });
        let bid = core.open_client(sid, "127.0.0.1:1".parse().unwrap()).expect("connect call");
        assert!(core.is_live(bid));
        assert!(core.connect_timeouts.values().any(|&(s, b)| s == sid && b == bid));

        core.remove(sid);

        assert!(!core.is_live(bid));
        assert!(core.connect_timeouts.values().all(|&(_, b)| b != bid));
        assert!(!core.schemes.contains_key(&sid));
    }

    #[test]
    fn reconnect_dials_a_fresh_socket_then_gives_up_after_max_attempts() {
        let mut core = Core::new(
            CoreConfig::builder().signal_interception(false).dispatcher_frequency_ms(0).build(),
        )
        .expect("core");
        let sid = core.add(SchemeConfig { alive: true, max_attempts: 1, ..SchemeConfig::default() });
        let bid = core.open_client(sid, "127.0.0.1:1".parse().unwrap()).expect("connect call");

        let mut seen_tokens = std::collections::HashSet::new();
        core.start();
        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        while core.is_live(bid) && Instant::now() < deadline {
            if let Some(tok) = core.schemes.get(&sid).and_then(|s| s.get(bid)).map(|b| b.token) {
                seen_tokens.insert(tok);
            }
            core.tick().expect("tick");
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        core.stop();

        assert!(!core.is_live(bid), "broker closes once retries are exhausted");
        assert!(seen_tokens.len() >= 2, "retry dialed a fresh socket under a new token, not the dead one");
    }
}
