//! One cluster worker: a forked child connected to the master through a
//! full-duplex socketpair, framed with the CMP codec (`spec.md` §3 "Cluster
//! worker", §4.9).

use std::io::{self, Read, Write};
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::net::UnixStream;

use crate::cmp::{Decoder, Encoder, Record};

/// Which side of the socketpair a `Worker` value represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The supervising master process.
    Master,
    /// A forked child.
    Children,
}

/// Child process handle held by the master, or the child's own handle to
/// itself (`spec.md` §3: "{pid, role, read_pipe_fd, write_pipe_fd, encoder,
/// decoder}").
pub struct Worker {
    pub(crate) pid: libc::pid_t,
    pub(crate) role: Role,
    stream: UnixStream,
    encoder: Encoder,
    decoder: Decoder,
    /// Worker id within the scheme's pool (`spec.md` §4.9 "init(sid, size)").
    pub(crate) worker_id: u16,
    /// Set by `restart(sid, true)`; governs whether the master respawns this
    /// slot after the child exits.
    pub(crate) restart_on_exit: bool,
}

impl Worker {
    /// Wrap an already-connected socketpair half.
    pub(crate) fn new(pid: libc::pid_t, role: Role, stream: UnixStream, worker_id: u16) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            pid,
            role,
            stream,
            encoder: Encoder::new(),
            decoder: Decoder::new(crate::constants::CMP_DEFAULT_CHUNK_SIZE),
            worker_id,
            restart_on_exit: false,
        })
    }

    #[must_use]
    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn worker_id(&self) -> u16 {
        self.worker_id
    }

    /// Raw fd for registering this worker's socket with the dispatcher.
    #[must_use]
    pub fn as_raw_fd(&self) -> RawFd {
        use std::os::unix::io::AsRawFd;
        self.stream.as_raw_fd()
    }

    /// Encode `buffer` with the CMP codec and write every fragment,
    /// carrying the sender's own PID (`spec.md` §4.9 "every IPC payload ...
    /// carries the sender's PID").
    pub fn send(&mut self, user_tag: u8, buffer: &[u8]) -> io::Result<()> {
        let wire = self.encoder.encode_all(user_tag, buffer);
        self.stream.write_all(&wire)
    }

    /// Pump available bytes off the socket into the decoder; returns any
    /// newly completed records. Non-blocking: `WouldBlock` just means
    /// nothing new arrived this turn.
    pub fn poll_recv(&mut self) -> io::Result<Vec<Record>> {
        let mut buf = [0u8; 16 * 1024];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "worker socket closed")),
                Ok(n) => self.decoder.push(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        let mut out = Vec::new();
        while let Some(rec) = self.decoder.pop() {
            out.push(rec);
        }
        Ok(out)
    }

    #[must_use]
    pub fn decoder_poisoned(&self) -> bool {
        self.decoder.is_poisoned()
    }
}

/// Create a connected `(master_half, child_half)` pair of raw fds, ready to
/// be handed one to each side across `fork()`.
pub(crate) fn socketpair() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0i32; 2];
    // SAFETY: socketpair(2) writes exactly two valid fds into `fds` on
    // success; AF_UNIX/SOCK_STREAM has no further preconditions.
    let ret = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((fds[0], fds[1]))
}

/// Wrap a raw fd (already a connected `AF_UNIX`/`SOCK_STREAM` socket) as a
/// `UnixStream`.
///
/// # Safety
/// `fd` must be a valid, open, non-shared file descriptor for a connected
/// Unix stream socket; ownership transfers to the returned `UnixStream`.
pub(crate) unsafe fn stream_from_raw_fd(fd: RawFd) -> UnixStream {
    // SAFETY: forwarded from the caller's contract above.
    unsafe { UnixStream::from_raw_fd(fd) }
}
