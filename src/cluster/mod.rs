//! Cluster supervisor: optional multi-process fan-out (`spec.md` §2
//! "Cluster", §4.9).
//!
//! One master forks N workers per scheme, each connected back through a
//! socketpair framed with the CMP codec. On Windows, `fork()` doesn't
//! exist; `ClusterSupervisor::init` logs a warning and the scheme simply
//! runs single-process (`spec.md` §4.9 "Windows fallback").

pub mod identity;
pub mod worker;

use std::collections::HashMap;

use log::{info, warn};

use crate::error::{CoreError, CoreResult};
use crate::scheme::SchemeId;
use worker::{Role, Worker};

/// One worker-pool entry, tracking everything `restart(sid, true)` needs.
struct Pool {
    size: u16,
    async_delivery: bool,
    restart: bool,
    workers: HashMap<u16, Worker>,
    next_worker_id: u16,
}

/// Event surfaced to the owning `Core` when the supervisor respawns a
/// crashed worker (`spec.md` §4.9: "emitting a RESTART event").
#[derive(Debug, Clone, Copy)]
pub struct RestartEvent {
    pub scheme_id: SchemeId,
    pub worker_id: u16,
    pub new_pid: libc::pid_t,
}

/// Master-side multi-process fan-out supervisor.
pub struct ClusterSupervisor {
    pools: HashMap<SchemeId, Pool>,
    supported: bool,
}

impl ClusterSupervisor {
    #[must_use]
    pub fn new() -> Self {
        let supported = cfg!(unix);
        if !supported {
            warn!("cluster: fork() unavailable on this platform, clustering disabled");
        }
        Self {
            pools: HashMap::new(),
            supported,
        }
    }

    /// `init(sid, size)`: declare a worker pool of `size` for a scheme
    /// (`spec.md` §4.9).
    pub fn init(&mut self, sid: SchemeId, size: u16) {
        self.pools.insert(
            sid,
            Pool {
                size,
                async_delivery: false,
                restart: false,
                workers: HashMap::new(),
                next_worker_id: 0,
            },
        );
    }

    /// `async(sid, bool)`: toggle async-delivery mode.
    pub fn set_async(&mut self, sid: SchemeId, enabled: bool) {
        if let Some(pool) = self.pools.get_mut(&sid) {
            pool.async_delivery = enabled;
        }
    }

    /// `restart(sid, bool)`: auto-respawn dead workers.
    pub fn set_restart(&mut self, sid: SchemeId, enabled: bool) {
        if let Some(pool) = self.pools.get_mut(&sid) {
            pool.restart = enabled;
            for w in pool.workers.values_mut() {
                w.restart_on_exit = enabled;
            }
        }
    }

    /// `start(sid)`: fork every worker in the declared pool.
    ///
    /// Each child is created via `fork()` over a fresh socketpair; the
    /// child half is returned to the caller via `on_child` so it can build
    /// its own `Core` and dispatcher loop before the parent's `fork()`
    /// returns control here for the next iteration. Only the master side
    /// remains tracked in `self.pools`.
    #[cfg(unix)]
    pub fn start<F: FnMut(u16, std::os::unix::net::UnixStream) -> !>(
        &mut self,
        sid: SchemeId,
        mut on_child: F,
    ) -> CoreResult<()> {
        if !self.supported {
            return Err(CoreError::OsBroken("cluster fork unavailable".into()));
        }
        let pool = self
            .pools
            .get_mut(&sid)
            .ok_or_else(|| CoreError::Start(format!("no cluster pool declared for scheme {sid}")))?;

        for _ in 0..pool.size {
            let worker_id = pool.next_worker_id;
            pool.next_worker_id += 1;

            let (master_fd, child_fd) = worker::socketpair()
                .map_err(|e| CoreError::Start(format!("socketpair failed: {e}")))?;

            // SAFETY: fork(2); the child branch below touches only
            // async-signal-safe state until it execs its own reactor setup
            // in `on_child`, which takes over and never returns.
            let pid = unsafe { libc::fork() };
            match pid {
                -1 => return Err(CoreError::Start(format!("fork failed: {}", std::io::Error::last_os_error()))),
                0 => {
                    // Child: close the master's half, run the caller's
                    // child entry point, which never returns.
                    // SAFETY: master_fd is valid and unused by the child.
                    unsafe {
                        libc::close(master_fd);
                    }
                    // SAFETY: child_fd is a valid, exclusively-owned fd.
                    let stream = unsafe { worker::stream_from_raw_fd(child_fd) };
                    on_child(worker_id, stream);
                }
                child_pid => {
                    // Master: close the child's half, track the worker.
                    // SAFETY: child_fd is valid and unused by the master.
                    unsafe {
                        libc::close(child_fd);
                    }
                    // SAFETY: master_fd is a valid, exclusively-owned fd.
                    let stream = unsafe { worker::stream_from_raw_fd(master_fd) };
                    let mut w = Worker::new(child_pid, Role::Master, stream, worker_id)
                        .map_err(|e| CoreError::Start(format!("worker setup failed: {e}")))?;
                    w.restart_on_exit = pool.restart;
                    pool.workers.insert(worker_id, w);
                    info!("cluster: forked worker {worker_id} (pid {child_pid}) for scheme {sid}");
                }
            }
        }
        Ok(())
    }

    /// `stop(sid)`: signal every worker in the pool to shut down and reap
    /// them (`spec.md` §4.9 "On master stop, the master signals children to
    /// shut down and waits").
    #[cfg(unix)]
    pub fn stop(&mut self, sid: SchemeId) {
        let Some(pool) = self.pools.get_mut(&sid) else {
            return;
        };
        for (worker_id, worker) in pool.workers.drain() {
            // SAFETY: sending SIGTERM to a PID we forked ourselves.
            unsafe {
                libc::kill(worker.pid(), libc::SIGTERM);
            }
            let mut status = 0;
            // SAFETY: waitpid on a PID this process is the parent of.
            unsafe {
                libc::waitpid(worker.pid(), &mut status, 0);
            }
            info!("cluster: reaped worker {worker_id} (pid {})", worker.pid());
        }
    }

    /// `send(sid, bid, buf, size)`-equivalent fan-in: route a message to the
    /// worker handling `worker_id`. The "by broker id" and "by pid"
    /// overloads from `spec.md` both resolve to this once the caller maps
    /// broker/pid to the owning worker id.
    pub fn send(&mut self, sid: SchemeId, worker_id: u16, user_tag: u8, buf: &[u8]) -> CoreResult<()> {
        let pool = self
            .pools
            .get_mut(&sid)
            .ok_or_else(|| CoreError::Start(format!("no cluster pool for scheme {sid}")))?;
        let worker = pool
            .workers
            .get_mut(&worker_id)
            .ok_or_else(|| CoreError::Start(format!("no worker {worker_id} in scheme {sid}")))?;
        worker
            .send(user_tag, buf)
            .map_err(|e| CoreError::Framing(format!("cluster send failed: {e}")))
    }

    /// `broadcast(sid, buf, size)`: send to every worker in the pool.
    pub fn broadcast(&mut self, sid: SchemeId, user_tag: u8, buf: &[u8]) -> CoreResult<()> {
        let pool = self
            .pools
            .get_mut(&sid)
            .ok_or_else(|| CoreError::Start(format!("no cluster pool for scheme {sid}")))?;
        for worker in pool.workers.values_mut() {
            worker
                .send(user_tag, buf)
                .map_err(|e| CoreError::Framing(format!("cluster broadcast failed: {e}")))?;
        }
        Ok(())
    }

    /// Reap any worker that has exited (non-blocking `waitpid(WNOHANG)`),
    /// classify its exit status, and respawn it if `restart` is enabled for
    /// its pool (`spec.md` §4.9: "the master reads SIGCHLD, classifies exit
    /// status, and if restart=true forks a replacement").
    ///
    /// Called by `Core` on the reactor thread after observing SIGCHLD via
    /// the notifier, never from the signal handler itself.
    #[cfg(unix)]
    pub fn reap_dead_workers<F>(&mut self, mut respawn: F) -> Vec<RestartEvent>
    where
        F: FnMut(SchemeId, u16) -> Option<libc::pid_t>,
    {
        let mut events = Vec::new();
        for (&sid, pool) in &mut self.pools {
            let dead: Vec<u16> = pool
                .workers
                .iter()
                .filter(|(_, w)| {
                    let mut status = 0;
                    // SAFETY: waitpid with WNOHANG on a child we forked; does
                    // not block.
                    let ret = unsafe { libc::waitpid(w.pid(), &mut status, libc::WNOHANG) };
                    ret == w.pid()
                })
                .map(|(&id, _)| id)
                .collect();

            for worker_id in dead {
                let restart_enabled = pool
                    .workers
                    .get(&worker_id)
                    .is_some_and(|w| w.restart_on_exit);
                pool.workers.remove(&worker_id);
                warn!("cluster: worker {worker_id} in scheme {sid} exited");
                if restart_enabled {
                    if let Some(new_pid) = respawn(sid, worker_id) {
                        events.push(RestartEvent {
                            scheme_id: sid,
                            worker_id,
                            new_pid,
                        });
                    }
                }
            }
        }
        events
    }

    #[must_use]
    pub fn is_supported(&self) -> bool {
        self.supported
    }
}

impl Default for ClusterSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn init_declares_empty_pool() {
        let mut sup = ClusterSupervisor::new();
        sup.init(1, 4);
        assert!(sup.send(1, 0, 0, b"hi").is_err());
    }

    #[test]
    fn send_without_init_is_an_error() {
        let mut sup = ClusterSupervisor::new();
        assert!(sup.send(99, 0, 0, b"hi").is_err());
    }

    #[test]
    fn restart_toggle_is_recorded() {
        let mut sup = ClusterSupervisor::new();
        sup.init(1, 1);
        sup.set_restart(1, true);
        assert!(sup.pools.get(&1).unwrap().restart);
    }
}
