//! Per-socket construction and tuning (`spec.md` §4.9, "Sockets").
//!
//! Every broker's underlying socket passes through here once, whether it
//! came from `connect` or from an `accept`: non-blocking mode, `SO_REUSEADDR`,
//! keepalive, `TCP_NODELAY`, buffer sizing and `SIGPIPE` suppression are all
//! applied in one place so brokers never touch `socket2`/`libc` directly.

use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};

use crate::error::{CoreError, CoreResult};

/// Keepalive tuning, expressed the way `spec.md` names the three knobs.
#[derive(Debug, Clone, Copy)]
pub struct Keepalive {
    /// `TCP_KEEPIDLE`: seconds of inactivity before the first probe.
    pub idle_secs: u32,
    /// `TCP_KEEPINTVL`: seconds between probes.
    pub interval_secs: u32,
    /// `TCP_KEEPCNT`: probes sent before the connection is declared dead.
    pub count: u32,
}

impl Default for Keepalive {
    fn default() -> Self {
        Self {
            idle_secs: 60,
            interval_secs: 10,
            count: 6,
        }
    }
}

/// Per-socket tuning knobs applied uniformly on connect and on accept
/// (`spec.md` §4.9: "Per-socket options applied on construction").
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// `SO_REUSEADDR`.
    pub reuse_addr: bool,
    /// `TCP_NODELAY`; meaningless for UDP sockets, silently skipped there.
    pub nodelay: bool,
    /// `SO_KEEPALIVE` plus its three sub-knobs; `None` disables keepalive.
    pub keepalive: Option<Keepalive>,
    /// `SO_SNDBUF`, parsed from a human string via [`parse_bandwidth`].
    pub send_buffer: Option<String>,
    /// `SO_RCVBUF`, parsed the same way.
    pub recv_buffer: Option<String>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            reuse_addr: true,
            nodelay: true,
            keepalive: Some(Keepalive::default()),
            send_buffer: None,
            recv_buffer: None,
        }
    }
}

/// Parse a human bandwidth/size string ("64kbps", "1Mbps", "512", "2Gbps")
/// into a byte count suitable for `SO_SNDBUF`/`SO_RCVBUF`.
///
/// Bare numbers are taken as bytes. Suffixes are case-insensitive and may be
/// `bps`/`kbps`/`mbps`/`gbps` (bits per second, divided by 8) — `spec.md`
/// §4.9 calls these out by name.
pub fn parse_bandwidth(s: &str) -> CoreResult<usize> {
    let trimmed = s.trim();
    let lower = trimmed.to_ascii_lowercase();

    let (digits, divisor): (&str, f64) = if let Some(d) = lower.strip_suffix("gbps") {
        (d, 1.0 / (1_000_000_000.0 / 8.0))
    } else if let Some(d) = lower.strip_suffix("mbps") {
        (d, 1.0 / (1_000_000.0 / 8.0))
    } else if let Some(d) = lower.strip_suffix("kbps") {
        (d, 1.0 / (1_000.0 / 8.0))
    } else if let Some(d) = lower.strip_suffix("bps") {
        (d, 1.0 / (1.0 / 8.0))
    } else {
        (lower.as_str(), 1.0)
    };

    let value: f64 = digits
        .trim()
        .parse()
        .map_err(|_| CoreError::Start(format!("invalid bandwidth string {s:?}")))?;

    Ok((value / divisor) as usize)
}

/// Suppress `SIGPIPE` for the whole process (`spec.md` §4.9: "per-process on
/// Linux"). A write to a peer-closed socket then surfaces as `EPIPE` on the
/// syscall return instead of killing the process. Safe and idempotent to
/// call more than once.
#[cfg(unix)]
pub fn suppress_sigpipe() {
    // SAFETY: SIG_IGN is a valid disposition for SIGPIPE; this affects
    // process-wide signal disposition, which is exactly the documented
    // per-process behavior on Linux.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

#[cfg(not(unix))]
pub fn suppress_sigpipe() {}

fn apply_options(sock: &Socket, opts: &SocketOptions, is_stream: bool) -> io::Result<()> {
    sock.set_nonblocking(true)?;
    if opts.reuse_addr {
        sock.set_reuse_address(true)?;
    }
    if is_stream && opts.nodelay {
        sock.set_nodelay(true)?;
    }
    if let Some(ka) = opts.keepalive {
        let conf = TcpKeepalive::new()
            .with_time(std::time::Duration::from_secs(u64::from(ka.idle_secs)))
            .with_interval(std::time::Duration::from_secs(u64::from(ka.interval_secs)));
        #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
        let conf = conf.with_retries(ka.count);
        if is_stream {
            sock.set_tcp_keepalive(&conf)?;
        }
    }
    if let Some(s) = &opts.send_buffer {
        if let Ok(bytes) = parse_bandwidth(s) {
            sock.set_send_buffer_size(bytes)?;
        }
    }
    if let Some(s) = &opts.recv_buffer {
        if let Ok(bytes) = parse_bandwidth(s) {
            sock.set_recv_buffer_size(bytes)?;
        }
    }
    Ok(())
}

/// Create, bind and listen on a TCP socket (`spec.md` §4.9 "open (server)").
pub fn tcp_listen(addr: SocketAddr, backlog: i32, opts: &SocketOptions) -> CoreResult<mio::net::TcpListener> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| CoreError::Start(format!("socket(2) failed: {e}")))?;
    apply_options(&sock, opts, true).map_err(|e| CoreError::Start(format!("setsockopt failed: {e}")))?;
    sock.bind(&addr.into())
        .map_err(|e| CoreError::Start(format!("bind({addr}) failed: {e}")))?;
    sock.listen(backlog)
        .map_err(|e| CoreError::Start(format!("listen({backlog}) failed: {e}")))?;
    let std_listener: std::net::TcpListener = sock.into();
    Ok(mio::net::TcpListener::from_std(std_listener))
}

/// Open an outbound non-blocking TCP connection (`spec.md` §4.9 "open
/// (client)"). The returned stream may still be mid-handshake; callers arm
/// it for writable and check `SO_ERROR` on the first writable event.
pub fn tcp_connect(addr: SocketAddr, opts: &SocketOptions) -> CoreResult<mio::net::TcpStream> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| CoreError::Connect(format!("socket(2) failed: {e}")))?;
    apply_options(&sock, opts, true).map_err(|e| CoreError::Connect(format!("setsockopt failed: {e}")))?;
    match sock.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if matches!(e.raw_os_error(), Some(libc_errno) if libc_errno == libc::EINPROGRESS) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(CoreError::Connect(format!("connect({addr}) failed: {e}"))),
    }
    let std_stream: std::net::TcpStream = sock.into();
    Ok(mio::net::TcpStream::from_std(std_stream))
}

/// Bind a non-blocking UDP socket for DTLS/UDP brokers.
pub fn udp_bind(addr: SocketAddr, opts: &SocketOptions) -> CoreResult<mio::net::UdpSocket> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let sock = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| CoreError::Start(format!("socket(2) failed: {e}")))?;
    apply_options(&sock, opts, false).map_err(|e| CoreError::Start(format!("setsockopt failed: {e}")))?;
    sock.bind(&addr.into())
        .map_err(|e| CoreError::Start(format!("bind({addr}) failed: {e}")))?;
    let std_socket: std::net::UdpSocket = sock.into();
    Ok(mio::net::UdpSocket::from_std(std_socket))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bandwidth_bare_number_is_bytes() {
        assert_eq!(parse_bandwidth("512").unwrap(), 512);
    }

    #[test]
    fn parse_bandwidth_kbps_divides_by_eight() {
        assert_eq!(parse_bandwidth("64kbps").unwrap(), 8_000);
    }

    #[test]
    fn parse_bandwidth_mbps() {
        assert_eq!(parse_bandwidth("1Mbps").unwrap(), 125_000);
    }

    #[test]
    fn parse_bandwidth_rejects_garbage() {
        assert!(parse_bandwidth("not-a-number").is_err());
    }

    #[test]
    fn tcp_listen_then_connect_round_trip() {
        let opts = SocketOptions::default();
        let listener = tcp_listen("127.0.0.1:0".parse().unwrap(), 128, &opts).expect("listen");
        let addr = listener.local_addr().expect("local_addr");
        let _stream = tcp_connect(addr, &opts).expect("connect");
    }
}
