//! Typed callback registry consumed by every component (`spec.md` §2,
//! "Callback registry" / §9 REDESIGN FLAGS).
//!
//! The original packs heterogeneous function objects into one registry
//! keyed by integer id or name. Here each recognized event gets its own
//! typed slot — `on_read`, `on_write`, `on_accept`, `on_connect`,
//! `on_timeout`, `on_disconnect` — plus a side table for user-defined named
//! callbacks that protocol layers (HTTP, WebSocket, …) register on top.

use std::collections::HashMap;

use crate::broker::BrokerId;
use crate::timer::TimerId;

/// `read(bid)` — delivered with the bytes the reactor accumulated past the
/// broker's read watermark.
pub type OnRead = Box<dyn FnMut(BrokerId, &[u8])>;
/// `write(bid)` — delivered once the broker's outbox has drained below its
/// low-watermark, so the upper layer can push more.
pub type OnWrite = Box<dyn FnMut(BrokerId)>;
/// `accept(bid)` — delivered once per accepted connection before `connect`.
pub type OnAccept = Box<dyn FnMut(BrokerId)>;
/// `connect(bid)` — delivered once a broker's socket is usable (client
/// connect completed, or immediately after `accept` on the server side).
pub type OnConnect = Box<dyn FnMut(BrokerId)>;
/// `timeout(bid, timer_id)` — delivered when a watchdog or user timer fires.
pub type OnTimeout = Box<dyn FnMut(BrokerId, TimerId)>;
/// `disconnect(bid)` — delivered exactly once per broker termination,
/// regardless of cause (`spec.md` §7, "every broker termination yields
/// exactly one disconnect(bid) callback").
pub type OnDisconnect = Box<dyn FnMut(BrokerId)>;

/// One named, user-defined callback; `args` is a small positional payload so
/// one slot can serve several unrelated call sites without a second generic
/// parameter proliferating through the registry.
pub type NamedCallback = Box<dyn FnMut(BrokerId, &[u8])>;

/// Per-broker (or per-scheme, when `None` `BrokerId` scoping is used by the
/// caller) callback set.
#[derive(Default)]
pub struct CallbackSet {
    on_read: Option<OnRead>,
    on_write: Option<OnWrite>,
    on_accept: Option<OnAccept>,
    on_connect: Option<OnConnect>,
    on_timeout: Option<OnTimeout>,
    on_disconnect: Option<OnDisconnect>,
    named: HashMap<String, NamedCallback>,
}

impl CallbackSet {
    /// Empty registry; every dispatch call below is then a no-op.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the `read` slot.
    pub fn on_read(&mut self, f: OnRead) {
        self.on_read = Some(f);
    }
    /// Register the `write` slot.
    pub fn on_write(&mut self, f: OnWrite) {
        self.on_write = Some(f);
    }
    /// Register the `accept` slot.
    pub fn on_accept(&mut self, f: OnAccept) {
        self.on_accept = Some(f);
    }
    /// Register the `connect` slot.
    pub fn on_connect(&mut self, f: OnConnect) {
        self.on_connect = Some(f);
    }
    /// Register the `timeout` slot.
    pub fn on_timeout(&mut self, f: OnTimeout) {
        self.on_timeout = Some(f);
    }
    /// Register the `disconnect` slot.
    pub fn on_disconnect(&mut self, f: OnDisconnect) {
        self.on_disconnect = Some(f);
    }

    /// Register (or replace) a user-defined named callback, for protocol
    /// layers built on top of the core (`spec.md` §1, non-goal layers that
    /// "consume the callback contract defined here").
    pub fn on_named(&mut self, name: impl Into<String>, f: NamedCallback) {
        self.named.insert(name.into(), f);
    }

    /// Dispatch `read`, if registered.
    pub fn dispatch_read(&mut self, bid: BrokerId, bytes: &[u8]) {
        if let Some(f) = &mut self.on_read {
            f(bid, bytes);
        }
    }
    /// Dispatch `write`, if registered.
    pub fn dispatch_write(&mut self, bid: BrokerId) {
        if let Some(f) = &mut self.on_write {
            f(bid);
        }
    }
    /// Dispatch `accept`, if registered.
    pub fn dispatch_accept(&mut self, bid: BrokerId) {
        if let Some(f) = &mut self.on_accept {
            f(bid);
        }
    }
    /// Dispatch `connect`, if registered.
    pub fn dispatch_connect(&mut self, bid: BrokerId) {
        if let Some(f) = &mut self.on_connect {
            f(bid);
        }
    }
    /// Dispatch `timeout`, if registered.
    pub fn dispatch_timeout(&mut self, bid: BrokerId, timer_id: TimerId) {
        if let Some(f) = &mut self.on_timeout {
            f(bid, timer_id);
        }
    }
    /// Dispatch `disconnect`, if registered.
    pub fn dispatch_disconnect(&mut self, bid: BrokerId) {
        if let Some(f) = &mut self.on_disconnect {
            f(bid);
        }
    }
    /// Dispatch a named callback by name, if registered. Unknown names are
    /// silently ignored, matching the typed slots' no-op-when-unset behavior.
    pub fn dispatch_named(&mut self, name: &str, bid: BrokerId, payload: &[u8]) {
        if let Some(f) = self.named.get_mut(name) {
            f(bid, payload);
        }
    }
}

impl std::fmt::Debug for CallbackSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackSet")
            .field("on_read", &self.on_read.is_some())
            .field("on_write", &self.on_write.is_some())
            .field("on_accept", &self.on_accept.is_some())
            .field("on_connect", &self.on_connect.is_some())
            .field("on_timeout", &self.on_timeout.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("named", &self.named.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn unregistered_slots_are_silent_noops() {
        let mut set = CallbackSet::new();
        set.dispatch_read(1, b"hello");
        set.dispatch_disconnect(1);
    }

    #[test]
    fn read_slot_receives_bytes() {
        let received = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&received);
        let mut set = CallbackSet::new();
        set.on_read(Box::new(move |bid, bytes| {
            sink.borrow_mut().push((bid, bytes.to_vec()));
        }));
        set.dispatch_read(42, b"hello");
        assert_eq!(received.borrow()[0], (42, b"hello".to_vec()));
    }

    #[test]
    fn named_callback_dispatches_by_name() {
        let hit = Rc::new(RefCell::new(false));
        let sink = Rc::clone(&hit);
        let mut set = CallbackSet::new();
        set.on_named("websocket.ping", Box::new(move |_bid, _payload| {
            *sink.borrow_mut() = true;
        }));
        set.dispatch_named("websocket.ping", 1, &[]);
        assert!(*hit.borrow());
        // Unknown name: no panic, no effect.
        set.dispatch_named("unknown", 1, &[]);
    }
}
