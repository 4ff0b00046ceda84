//! The worker pool and `delegate_request` dispatch core (`spec.md` §4.3).
//!
//! This is the heart of the system: given an accepted connection, find an
//! idle worker and hand the descriptor over, growing or repairing the pool
//! as needed. Every branch here is ported directly from
//! `scgi_server.py`'s `spawn_child`/`reap_children`/`delegate_request`.

use crate::fd_transfer::send_fd;
use crate::worker::{ConnectionHandler, ScgiWorker};
use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::collections::HashMap;
use std::io::Read;
use std::net::TcpStream;
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::net::UnixStream;
use tracing::{debug, warn};

/// Timeout escalation per `spec.md` §4.3: a fresh request tries a zero-wait
/// poll first, then falls back to a bounded wait once nothing is ready.
const ESCALATED_TIMEOUT_MS: i32 = 2000;

/// One entry in the worker set (`spec.md` §3): the child's pid plus the
/// parent's end of its control socket.
struct WorkerHandle {
    pid: Pid,
    control: UnixStream,
}

/// Outcome of reading the one-byte readiness token off a control socket.
/// Modeled as an explicit enum so would-block, EOF and a genuine token can
/// never be conflated (`spec.md` §9).
enum Readiness {
    Token,
    WouldBlock,
    Eof,
    Violation(u8),
}

fn read_readiness(control: &UnixStream) -> std::io::Result<Readiness> {
    let mut byte = [0u8; 1];
    match (&*control).read(&mut byte) {
        Ok(0) => Ok(Readiness::Eof),
        Ok(_) if byte[0] == b'1' => Ok(Readiness::Token),
        Ok(_) => Ok(Readiness::Violation(byte[0])),
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(Readiness::WouldBlock),
        Err(err) => Err(err),
    }
}

/// Result of one hand-off attempt against a single candidate worker.
enum HandOff {
    Delivered,
    /// Couldn't use this worker this time; move on without touching the
    /// worker set (a genuine death is picked up by the next `reap`).
    Skip,
    /// The worker wrote something other than the readiness token. Fatal to
    /// that one worker, not to the process.
    ProtocolViolation,
}

/// Manages the set of forked worker processes and the handoff of accepted
/// connections to them.
pub struct WorkerPool<H: ConnectionHandler> {
    workers: HashMap<Pid, WorkerHandle>,
    max_children: usize,
    handler: H,
}

impl<H: ConnectionHandler + Clone> WorkerPool<H> {
    /// Build a pool and spawn its first worker, matching
    /// `SCGIServer.__init__`'s unconditional initial `spawn_child()`.
    pub fn new(max_children: usize, handler: H) -> Result<Self> {
        let mut pool = Self {
            workers: HashMap::new(),
            max_children,
            handler,
        };
        pool.spawn_child(None)?;
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Fork a new worker. `conn`, if given, is the connection currently
    /// being dispatched by the caller; the child must close its inherited
    /// duplicate of it immediately since it isn't the one serving it
    /// (`spec.md` §4.3 step 5).
    fn spawn_child(&mut self, conn: Option<&TcpStream>) -> Result<()> {
        let (worker_end, parent_end) =
            UnixStream::pair().context("create control socket pair")?;
        parent_end
            .set_nonblocking(true)
            .context("set control socket non-blocking")?;

        // SAFETY: fork happens with no heap allocation between it and
        // either the child calling `_exit` or the parent returning; the
        // child only touches already-initialized stack values.
        match unsafe { fork() }.context("fork worker process")? {
            ForkResult::Child => {
                drop(parent_end);
                if let Some(conn) = conn {
                    let _ = nix::unistd::close(conn.as_raw_fd());
                }
                let worker = ScgiWorker::new(worker_end, self.handler.clone());
                if let Err(err) = worker.serve() {
                    debug!("worker exiting: {err:#}");
                }
                std::process::exit(0);
            }
            ForkResult::Parent { child } => {
                drop(worker_end);
                self.workers.insert(
                    child,
                    WorkerHandle {
                        pid: child,
                        control: parent_end,
                    },
                );
                Ok(())
            }
        }
    }

    /// Non-blocking sweep for exited children (`spec.md` §4.3 step 4,
    /// `scgi_server.py`'s `reap_children`).
    fn reap(&mut self) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, _)) | Ok(WaitStatus::Signaled(pid, _, _)) => {
                    self.workers.remove(&pid);
                }
                Ok(WaitStatus::StillAlive) => break,
                Ok(_) => continue,
                Err(Errno::ECHILD) => break,
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    warn!("waitpid failed during reap: {err}");
                    break;
                }
            }
        }
    }

    /// Attempt to hand `conn` to exactly one candidate worker.
    ///
    /// A `send_fd` failure other than broken-pipe is not a worker death —
    /// the worker's readiness byte has already been consumed, so it's stuck
    /// blocked in `recv_fd` with no way to re-signal readiness, and the pool
    /// slot would leak forever if this were swallowed. `spec.md` §4.3 step 3
    /// / §7 call for exactly that case to propagate as fatal.
    fn try_hand_off(&mut self, pid: Pid, conn: &TcpStream) -> Result<HandOff> {
        let handle = match self.workers.get(&pid) {
            Some(h) => h,
            None => return Ok(HandOff::Skip),
        };
        match read_readiness(&handle.control) {
            Ok(Readiness::WouldBlock) | Ok(Readiness::Eof) => Ok(HandOff::Skip),
            Err(_) => Ok(HandOff::Skip),
            Ok(Readiness::Violation(_)) => Ok(HandOff::ProtocolViolation),
            Ok(Readiness::Token) => match send_fd(&handle.control, conn.as_raw_fd()) {
                Ok(()) => Ok(HandOff::Delivered),
                Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => Ok(HandOff::Skip),
                Err(err) => Err(err).with_context(|| format!("send descriptor to worker {pid}")),
            },
        }
    }

    /// Find an idle worker and hand `conn` over to it, growing the pool or
    /// waiting as needed. `spec.md` §4.3, ported from
    /// `scgi_server.py`'s `delegate_request`.
    pub fn delegate_request(&mut self, conn: &TcpStream) -> Result<()> {
        let mut timeout_ms: i32 = 0;
        loop {
            let mut pids: Vec<Pid> = self.workers.keys().copied().collect();
            pids.sort_by_key(|pid| self.workers[pid].control.as_raw_fd());

            let mut pollfds: Vec<PollFd> = pids
                .iter()
                .map(|pid| PollFd::new(self.workers[pid].control.as_fd(), PollFlags::POLLIN))
                .collect();

            let timeout = PollTimeout::try_from(timeout_ms).unwrap_or(PollTimeout::MAX);
            match poll(&mut pollfds, timeout) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err).context("poll worker control sockets"),
            }

            // Lowest file-descriptor number among the ready sockets wins,
            // matching `r.sort(); child_fd = r[0]` in the original.
            let ready = pids
                .iter()
                .zip(pollfds.iter())
                .find(|(_, pollfd)| {
                    pollfd
                        .revents()
                        .is_some_and(|revents| revents.contains(PollFlags::POLLIN))
                })
                .map(|(pid, _)| *pid);

            if let Some(pid) = ready {
                match self.try_hand_off(pid, conn)? {
                    HandOff::Delivered => return Ok(()),
                    HandOff::Skip => {}
                    HandOff::ProtocolViolation => {
                        warn!("worker {pid} sent a malformed readiness byte, dropping it");
                        self.workers.remove(&pid);
                    }
                }
            }

            self.reap();
            if self.workers.len() < self.max_children {
                self.spawn_child(Some(conn))?;
            }
            timeout_ms = ESCALATED_TIMEOUT_MS;
        }
    }

    /// Restart protocol (`spec.md` §4.5): close every control socket, wait
    /// for every worker to exit, then spawn a fresh one. Does not touch the
    /// restart flag itself — that's the supervisor's responsibility.
    pub fn restart(&mut self) -> Result<()> {
        let pids: Vec<Pid> = self.workers.keys().copied().collect();
        self.workers.clear();

        for pid in pids {
            loop {
                match waitpid(pid, None) {
                    Ok(_) => break,
                    Err(Errno::EINTR) => continue,
                    Err(Errno::ECHILD) => break,
                    Err(err) => {
                        return Err(err).with_context(|| format!("wait for worker {pid}"))
                    }
                }
            }
        }

        self.spawn_child(None)
    }
}
