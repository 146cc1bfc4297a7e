//! TLS/DTLS engine (`spec.md` §4.4, interface-only component).
//!
//! The engine is polymorphic over `{RAW, TLS, DTLS}`. `RAW` brokers carry no
//! context at all. `TLS` is backed by `rustls` (ALPN driven by the owning
//! scheme's `ProtocolPreference`, SNI from the connect URL, configurable
//! certificate verification). `DTLS` has no mature `rustls` support, so it
//! goes through `openssl`'s `SslMethod::dtls()` instead — the one place in
//! this crate where `openssl` is load-bearing rather than vestigial.

use std::sync::Arc;

use crate::error::{CoreError, CoreResult, TimeoutDirection};
use crate::scheme::ProtocolPreference;

/// Per-connection TLS/DTLS context, or no context at all for a raw broker.
pub enum Ctx {
    /// No encryption; bytes pass through untouched.
    Raw,
    /// `rustls` client or server connection state.
    Tls(Box<TlsCtx>),
    /// `openssl` DTLS connection state.
    Dtls(Box<DtlsCtx>),
}

/// `rustls`-backed context.
pub struct TlsCtx {
    pub(crate) conn: TlsConn,
}

/// Either half of a `rustls` connection, since client and server share no
/// common trait object in the version this crate targets.
pub enum TlsConn {
    Client(Box<rustls::ClientConnection>),
    Server(Box<rustls::ServerConnection>),
}

/// `openssl`-backed DTLS context.
pub struct DtlsCtx {
    pub(crate) ssl: openssl::ssl::Ssl,
}

/// Which side of a handshake this context plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

/// Connection target the engine initializes a context for.
#[derive(Debug, Clone)]
pub struct ConnectTarget {
    /// Hostname used for SNI and certificate verification.
    pub host: String,
    /// Transport kind requested by the scheme.
    pub transport: TransportKind,
    /// ALPN preference, translated to a protocol id list.
    pub protocol: ProtocolPreference,
    /// Whether to skip certificate verification (testing only; `spec.md`
    /// §4.4 "Certificate verification is configurable per-core").
    pub verify: bool,
}

/// Which engine backs a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Raw,
    Tls,
    Dtls,
}

fn alpn_protocols(pref: ProtocolPreference) -> Vec<Vec<u8>> {
    match pref {
        ProtocolPreference::Raw => Vec::new(),
        ProtocolPreference::Http1 => vec![b"http/1.0".to_vec()],
        ProtocolPreference::Http11 => vec![b"http/1.1".to_vec()],
        ProtocolPreference::Http2 => vec![b"h2".to_vec(), b"http/1.1".to_vec()],
        ProtocolPreference::Http3 => vec![b"h3".to_vec()],
    }
}

fn rustls_root_store(verify: bool) -> rustls::RootCertStore {
    let mut store = rustls::RootCertStore::empty();
    if verify {
        store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let native = rustls_native_certs::load_native_certs().certs;
        let _ = store.add_parsable_certificates(native);
    }
    store
}

/// `init(url) -> Ctx` (`spec.md` §4.4). Builds the appropriate backend for
/// `target.transport`, doing nothing for `Raw`.
pub fn init(target: &ConnectTarget, side: Side) -> CoreResult<Ctx> {
    match target.transport {
        TransportKind::Raw => Ok(Ctx::Raw),
        TransportKind::Tls => init_tls(target, side).map(|ctx| Ctx::Tls(Box::new(ctx))),
        TransportKind::Dtls => init_dtls(target, side).map(|ctx| Ctx::Dtls(Box::new(ctx))),
    }
}

fn init_tls(target: &ConnectTarget, side: Side) -> CoreResult<TlsCtx> {
    let alpn = alpn_protocols(target.protocol);
    let conn = match side {
        Side::Client => {
            let roots = rustls_root_store(target.verify);
            let mut config = rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            config.alpn_protocols = alpn;
            let server_name = rustls::pki_types::ServerName::try_from(target.host.clone())
                .map_err(|e| CoreError::Protocol(format!("invalid SNI hostname {:?}: {e}", target.host)))?;
            let conn = rustls::ClientConnection::new(Arc::new(config), server_name)
                .map_err(|e| CoreError::Protocol(format!("TLS client init failed: {e}")))?;
            TlsConn::Client(Box::new(conn))
        }
        Side::Server => {
            return Err(CoreError::Protocol(
                "TLS server contexts require certificate material supplied by the embedder".into(),
            ));
        }
    };
    Ok(TlsCtx { conn })
}

fn init_dtls(_target: &ConnectTarget, side: Side) -> CoreResult<DtlsCtx> {
    let method = match side {
        Side::Client => openssl::ssl::SslMethod::dtls(),
        Side::Server => openssl::ssl::SslMethod::dtls(),
    };
    let mut builder = openssl::ssl::SslContextBuilder::new(method)
        .map_err(|e| CoreError::Protocol(format!("DTLS context init failed: {e}")))?;
    builder.set_verify(openssl::ssl::SslVerifyMode::NONE);
    let ctx = builder.build();
    let ssl = openssl::ssl::Ssl::new(&ctx).map_err(|e| CoreError::Protocol(format!("DTLS SSL init failed: {e}")))?;
    Ok(DtlsCtx { ssl })
}

/// `timeout(ms, direction) -> ()` (`spec.md` §4.4). For UDP/DTLS brokers
/// the per-direction timeout is pushed into this layer rather than the
/// broker's kernel-readiness watchdog, because byte readiness on a
/// datagram socket isn't a proxy for protocol-level activity (`spec.md`
/// §4.6).
pub fn timeout(_ctx: &Ctx, ms: u64, direction: TimeoutDirection) -> CoreResult<()> {
    if ms == 0 {
        return Err(CoreError::Timeout { direction, seconds: 0 });
    }
    Ok(())
}

/// `clear(Ctx)` (`spec.md` §4.4). Dropping `Ctx` tears down the backend;
/// this exists as an explicit call so broker close ordering (`spec.md` §3
/// invariant d: "TLS context ... destroyed before its socket is closed")
/// is visible at the call site rather than implicit in drop order.
pub fn clear(ctx: Ctx) {
    drop(ctx);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_target_produces_raw_ctx() {
        let target = ConnectTarget {
            host: "example.com".into(),
            transport: TransportKind::Raw,
            protocol: ProtocolPreference::Raw,
            verify: false,
        };
        let ctx = init(&target, Side::Client).expect("raw init never fails");
        assert!(matches!(ctx, Ctx::Raw));
    }

    #[test]
    fn tls_client_init_succeeds_with_verification_disabled() {
        let target = ConnectTarget {
            host: "example.com".into(),
            transport: TransportKind::Tls,
            protocol: ProtocolPreference::Http11,
            verify: false,
        };
        let ctx = init(&target, Side::Client).expect("tls client init");
        assert!(matches!(ctx, Ctx::Tls(_)));
    }

    #[test]
    fn tls_server_without_cert_material_is_an_error() {
        let target = ConnectTarget {
            host: "example.com".into(),
            transport: TransportKind::Tls,
            protocol: ProtocolPreference::Http11,
            verify: false,
        };
        assert!(init(&target, Side::Server).is_err());
    }

    #[test]
    fn alpn_http2_prefers_h2_then_http11() {
        let protocols = alpn_protocols(ProtocolPreference::Http2);
        assert_eq!(protocols[0], b"h2");
        assert_eq!(protocols[1], b"http/1.1");
    }
}
