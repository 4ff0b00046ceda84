//! The worker-side serve loop (`spec.md` §4.2).
//!
//! After `fork`, a worker holds the blocking end of its control socket and
//! does nothing else: announce readiness, block for a descriptor, serve
//! one connection to completion, repeat. Death of the parent — observed as
//! a write or read failure on the control socket — is terminal and quiet.

use crate::fd_transfer::recv_fd;
use std::io::Write;
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use tracing::debug;

/// The pluggable per-request behavior a worker invokes once it owns a
/// connection. This is the "external request handler" of `spec.md` §1/§6:
/// the dispatch core is generic over it and never looks inside.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Handle one SCGI request/response cycle on `conn`. Errors are logged
    /// by the caller and otherwise swallowed — a single bad request must
    /// not take down the worker, since `serve` depends on looping forever.
    fn handle(&self, conn: TcpStream) -> anyhow::Result<()>;
}

/// Runs the worker side of the control protocol for a given
/// [`ConnectionHandler`]. Constructing one and calling [`ScgiWorker::serve`]
/// is the entire worker process body after `fork`.
pub struct ScgiWorker<H: ConnectionHandler> {
    control: UnixStream,
    handler: H,
}

impl<H: ConnectionHandler> ScgiWorker<H> {
    pub fn new(control: UnixStream, handler: H) -> Self {
        Self { control, handler }
    }

    /// Readiness byte written before each request, per `spec.md` §3.
    const READY: &'static [u8] = b"1";

    /// Run the serve loop until the parent disappears. Never returns `Ok`;
    /// a closed or broken control socket is the only exit condition.
    pub fn serve(mut self) -> anyhow::Result<()> {
        loop {
            self.control.write_all(Self::READY)?;
            let fd = recv_fd(&self.control)?;
            let conn = TcpStream::from(fd);

            // The kernel may hand back a non-blocking socket on some
            // platforms (observed historically on FreeBSD) — force it
            // blocking unconditionally rather than trust the default.
            conn.set_nonblocking(false)?;

            if let Err(err) = self.handler.handle(conn) {
                debug!("request handler failed: {err:#}");
            }
        }
    }
}

/// The default connection handler: parses the SCGI environment and echoes
/// it back as a `text/plain` response. Used as the out-of-the-box smoke
/// test described in `spec.md` §6.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

impl ConnectionHandler for EchoHandler {
    fn handle(&self, conn: TcpStream) -> anyhow::Result<()> {
        let mut reader = std::io::BufReader::new(conn.try_clone()?);
        let env = crate::scgi::read_request_env(&mut reader)?;

        let mut writer = std::io::BufWriter::new(conn);
        writer.write_all(b"Content-Type: text/plain\r\n")?;
        writer.write_all(b"\r\n")?;
        writeln!(writer, "PID: {}", std::process::id())?;

        let mut keys: Vec<&String> = env.keys().collect();
        keys.sort();
        for key in keys {
            let value = &env[key];
            writeln!(writer, "{key}: '{value}'")?;
        }
        writer.flush()?;
        Ok(())
    }
}
