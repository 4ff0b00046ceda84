//! The accept loop (`spec.md` §4.4): binds the listening socket, hands each
//! accepted connection to the dispatcher, and checks for a pending restart
//! after every request. Control flow mirrors `scgi_server.py`'s
//! `SCGIServer.serve` exactly.

use crate::dispatcher::WorkerPool;
use crate::signal;
use crate::worker::ConnectionHandler;
use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::net::TcpListener;
use tracing::info;

pub struct Supervisor<H: ConnectionHandler> {
    listener: TcpListener,
    pool: WorkerPool<H>,
}

impl<H: ConnectionHandler + Clone> Supervisor<H> {
    pub fn new(listener: TcpListener, max_children: usize, handler: H) -> Result<Self> {
        let pool = WorkerPool::new(max_children, handler).context("prime worker pool")?;
        Ok(Self { listener, pool })
    }

    /// Run the accept loop forever. Returns only on an unrecoverable
    /// `accept` failure, or on any error `delegate_request` did not itself
    /// absorb (`spec.md` §7: those are fatal to the supervisor).
    pub fn serve(mut self) -> Result<()> {
        loop {
            let conn = match self.listener.accept() {
                Ok((conn, _addr)) => conn,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err).context("accept connection"),
            };

            self.pool
                .delegate_request(&conn)
                .context("dispatch connection")?;
            // The parent's copy is only ever used to obtain the raw
            // descriptor passed to a worker; drop it once dispatched so the
            // worker's copy is the only one keeping the connection open.
            drop(conn);

            if signal::restart_requested() {
                info!("SIGHUP received, restarting worker pool");
                self.pool.restart().context("restart worker pool")?;
                signal::clear_restart_request();
            }
        }
    }
}
