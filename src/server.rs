//! Top-level wiring: configuration, logging, the listening socket, and the
//! supervisor loop.

use crate::config::Config;
use crate::listener;
use crate::signal;
use crate::supervisor::Supervisor;
use crate::worker::EchoHandler;
use anyhow::{Context, Result};
use tracing::info;

/// The whole running process, from configuration through the accept loop.
pub struct Server {
    config: Config,
}

impl Server {
    /// Parse configuration and install the hangup handler. Does not bind
    /// the listening socket yet — that happens in [`Server::start`], after
    /// logging is initialized, so bind failures are logged.
    pub fn new() -> Result<Self> {
        let config = Config::from_args().context("read configuration")?;
        let server = Self { config };
        server.init_logging();
        signal::install_hangup_handler().context("install SIGHUP handler")?;
        Ok(server)
    }

    fn init_logging(&self) {
        tracing_subscriber::fmt()
            .with_max_level(*self.config.log_level())
            .with_target(true)
            .init();
    }

    /// Bind the listening socket and run the supervisor loop. Never
    /// returns on success — only an unrecoverable `accept` failure ends
    /// the process.
    pub fn start(self) -> Result<()> {
        let listener = listener::bind(self.config.port())
            .with_context(|| format!("bind port {}", self.config.port()))?;
        info!(
            port = self.config.port(),
            max_children = self.config.max_children(),
            "listening"
        );

        let supervisor = Supervisor::new(listener, self.config.max_children(), EchoHandler)
            .context("start worker pool")?;
        supervisor.serve()
    }
}
