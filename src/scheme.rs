//! Scheme: groups brokers that share configuration (`spec.md` §3 "Scheme",
//! §4.7).

use std::collections::HashMap;

use crate::broker::{Broker, BrokerId, TimeoutPolicy};
use crate::callbacks::CallbackSet;

/// 16-bit scheme id.
pub type SchemeId = u16;

/// Socket address family a scheme binds/connects over (`spec.md` §3,
/// "protocol family (IPV4/IPV6/NIX)").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// IPv4.
    Ipv4,
    /// IPv6.
    Ipv6,
    /// Unix domain socket.
    Nix,
}

/// ALPN/application-protocol preference a scheme advertises (`spec.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolPreference {
    /// No ALPN negotiation; raw bytes.
    Raw,
    /// `http/1.0`.
    Http1,
    /// `http/1.1`.
    Http11,
    /// `h2`.
    Http2,
    /// `h3` (QUIC transport, out of this crate's scope, kept as a tag for
    /// the upper-layer protocol engines to branch on).
    Http3,
}

/// Per-scheme configuration (`spec.md` §3 "Scheme" Configuration).
#[derive(Debug, Clone)]
pub struct SchemeConfig {
    /// Address family this scheme binds or connects over.
    pub family: Family,
    /// ALPN/application-protocol preference.
    pub protocol: ProtocolPreference,
    /// Unix-domain socket path, when `family == Nix`.
    pub unix_path: Option<String>,
    /// Permitted local source addresses for outbound connects, used to pick
    /// among multiple local interfaces.
    pub allowed_sources: Vec<std::net::IpAddr>,
    /// Listen backlog for server schemes.
    pub listen_backlog: i32,
    /// Whether this scheme is kept alive across reconnect failures
    /// (`spec.md` §4.8, "reconnect policy": `scheme.alive`).
    pub alive: bool,
    /// Maximum reconnect attempts before surfacing `disconnect` for good.
    pub max_attempts: u32,
    /// Per-direction timeout policy newly created brokers inherit
    /// (`spec.md` §4.6). A broker can still override its own afterwards via
    /// `Broker::set_timeouts`.
    pub default_timeouts: TimeoutPolicy,
}

impl Default for SchemeConfig {
    fn default() -> Self {
        Self {
            family: Family::Ipv4,
            protocol: ProtocolPreference::Raw,
            unix_path: None,
            allowed_sources: Vec::new(),
            listen_backlog: 1024,
            alive: false,
            max_attempts: 0,
            default_timeouts: TimeoutPolicy::default(),
        }
    }
}

/// Groups brokers sharing one listening endpoint or one outbound target
/// (`spec.md` §3 "Scheme", §4.7).
pub struct Scheme {
    id: SchemeId,
    config: SchemeConfig,
    brokers: HashMap<BrokerId, Broker>,
    /// The listening broker, for server schemes (`spec.md` §3: "for server
    /// schemes a listening Broker").
    listener: Option<BrokerId>,
    callbacks: CallbackSet,
}

impl Scheme {
    #[must_use]
    pub fn new(id: SchemeId, config: SchemeConfig) -> Self {
        Self {
            id,
            config,
            brokers: HashMap::new(),
            listener: None,
            callbacks: CallbackSet::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> SchemeId {
        self.id
    }

    #[must_use]
    pub fn config(&self) -> &SchemeConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut SchemeConfig {
        &mut self.config
    }

    pub fn callbacks_mut(&mut self) -> &mut CallbackSet {
        &mut self.callbacks
    }

    /// Insert a broker this scheme now owns.
    pub fn insert(&mut self, broker: Broker) -> BrokerId {
        let bid = broker.id();
        self.brokers.insert(bid, broker);
        bid
    }

    pub fn set_listener(&mut self, bid: BrokerId) {
        self.listener = Some(bid);
    }

    #[must_use]
    pub fn listener(&self) -> Option<BrokerId> {
        self.listener
    }

    /// Broker lookup by id (`spec.md` §4.7).
    #[must_use]
    pub fn get(&self, bid: BrokerId) -> Option<&Broker> {
        self.brokers.get(&bid)
    }

    pub fn get_mut(&mut self, bid: BrokerId) -> Option<&mut Broker> {
        self.brokers.get_mut(&bid)
    }

    /// Remove and return a broker, e.g. once `Core::close` has torn down its
    /// socket and TLS context.
    pub fn remove(&mut self, bid: BrokerId) -> Option<Broker> {
        if self.listener == Some(bid) {
            self.listener = None;
        }
        self.brokers.remove(&bid)
    }

    /// `ip(bid)` convenience accessor (`spec.md` §4.7).
    #[must_use]
    pub fn ip(&self, bid: BrokerId) -> Option<&str> {
        self.brokers.get(&bid).and_then(Broker::ip)
    }

    /// `port(bid)` convenience accessor.
    #[must_use]
    pub fn port(&self, bid: BrokerId) -> Option<u16> {
        self.brokers.get(&bid).and_then(Broker::port)
    }

    /// `mac(bid)` convenience accessor. MAC discovery is an external,
    /// out-of-scope collaborator (`spec.md` §1); this always returns `None`
    /// since no ARP/neighbor-table lookup lives in this crate.
    #[must_use]
    pub fn mac(&self, _bid: BrokerId) -> Option<&str> {
        None
    }

    /// Iterate all brokers, e.g. for the recently-disconnected sweep or
    /// cluster broadcast.
    pub fn iter(&self) -> impl Iterator<Item = (&BrokerId, &Broker)> {
        self.brokers.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&BrokerId, &mut Broker)> {
        self.brokers.iter_mut()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.brokers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.brokers.is_empty()
    }

    /// Drain all brokers (`spec.md` §4.7 "clear()").
    pub fn clear(&mut self) -> Vec<Broker> {
        self.listener = None;
        self.brokers.drain().map(|(_, b)| b).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Transport;
    use mio::Token;

    #[test]
    fn insert_and_lookup_roundtrip() {
        let mut scheme = Scheme::new(1, SchemeConfig::default());
        let broker = Broker::new(1, Token(0), Transport::Tcp);
        let bid = scheme.insert(broker);
        assert!(scheme.get(bid).is_some());
    }

    #[test]
    fn clear_drains_all_brokers_and_listener() {
        let mut scheme = Scheme::new(1, SchemeConfig::default());
        let bid = scheme.insert(Broker::new(1, Token(0), Transport::Tcp));
        scheme.set_listener(bid);
        let drained = scheme.clear();
        assert_eq!(drained.len(), 1);
        assert!(scheme.is_empty());
        assert!(scheme.listener().is_none());
    }

    #[test]
    fn mac_is_always_none_without_a_discovery_collaborator() {
        let scheme = Scheme::new(1, SchemeConfig::default());
        assert!(scheme.mac(42).is_none());
    }
}
