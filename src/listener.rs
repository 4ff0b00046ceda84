//! The TCP listening socket (`spec.md` §6): IPv4, all interfaces,
//! `SO_REUSEADDR`, backlog 40.

use anyhow::{Context, Result};
use nix::sys::socket::{
    listen, setsockopt, socket, sockopt::ReuseAddr, AddressFamily, Backlog, SockFlag, SockType,
    SockaddrIn,
};
use std::net::TcpListener;
use std::os::fd::AsRawFd;

/// Kernel backlog for the listening socket, per `spec.md` §6.
const BACKLOG: i32 = 40;

/// Bind a TCP/IPv4 listening socket on all interfaces at `port`.
pub fn bind(port: u16) -> Result<TcpListener> {
    let fd = socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::empty(),
        None,
    )
    .context("create listening socket")?;

    setsockopt(&fd, ReuseAddr, &true).context("set SO_REUSEADDR")?;

    let addr = SockaddrIn::new(0, 0, 0, 0, port);
    nix::sys::socket::bind(fd.as_raw_fd(), &addr).context("bind listening socket")?;

    let backlog = Backlog::new(BACKLOG).context("construct listen backlog")?;
    listen(&fd, backlog).context("listen on socket")?;

    Ok(TcpListener::from(fd))
}
