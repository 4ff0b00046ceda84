//! Descriptor passing over a connected Unix-domain stream socket.
//!
//! `send_fd`/`recv_fd` are the only two primitives the rest of the crate
//! needs: transmit rights to an open file descriptor to a peer process, and
//! receive a fresh descriptor (referring to the same open-file-description)
//! from one. Everything is built on `SCM_RIGHTS` ancillary messages via the
//! `sendfd` crate, which does the `sendmsg`/`recvmsg` bookkeeping.

use sendfd::{RecvWithFd, SendWithFd};
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

/// A single, non-empty payload byte accompanies every descriptor transfer.
/// Some kernels drop the ancillary data entirely on a zero-length message.
const PAYLOAD: &[u8] = b" ";

/// Send `fd`'s rights to the peer connected to `channel`.
///
/// Returns [`io::ErrorKind::BrokenPipe`] if the peer has gone away, which
/// callers use to detect a worker that died between being selected and
/// being handed a connection.
pub fn send_fd(channel: &UnixStream, fd: RawFd) -> io::Result<()> {
    channel.send_with_fd(PAYLOAD, &[fd])?;
    Ok(())
}

/// Block until one descriptor arrives on `channel`.
///
/// Returns [`io::ErrorKind::UnexpectedEof`] if the peer closed the channel
/// without sending anything (the worker-side analogue of the parent
/// disappearing).
pub fn recv_fd(channel: &UnixStream) -> io::Result<OwnedFd> {
    let mut payload = [0u8; 1];
    let mut fds = [-1 as RawFd; 1];
    let (n, nfds) = channel.recv_with_fd(&mut payload, &mut fds)?;
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "peer closed descriptor channel",
        ));
    }
    if nfds == 0 {
        return Err(io::Error::other(
            "descriptor channel message carried no file descriptor",
        ));
    }
    // SAFETY: `recv_with_fd` reports exactly `nfds` descriptors filled in
    // from the front of `fds`, each a freshly dup'd, uniquely owned fd.
    Ok(unsafe { OwnedFd::from_raw_fd(fds[0]) })
}
