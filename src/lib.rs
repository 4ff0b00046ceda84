//! A pre-forking SCGI dispatch server.
//!
//! The binary (`scgi-dispatchd`) wires together a [`config::Config`], a
//! [`listener`], a [`dispatcher::WorkerPool`] and a [`supervisor::Supervisor`]
//! through [`server::Server`]. The worker pool is generic over any
//! [`worker::ConnectionHandler`]; the binary ships [`worker::EchoHandler`]
//! as its default. Embedders who want a different default handler can skip
//! `Server` and assemble `listener`/`dispatcher`/`supervisor` directly.

pub use dispatcher::WorkerPool;
pub use server::Server;
pub use supervisor::Supervisor;
pub use worker::{ConnectionHandler, EchoHandler, ScgiWorker};

pub mod config;
pub mod dispatcher;
pub mod fd_transfer;
pub mod listener;
pub mod scgi;
mod server;
pub mod signal;
pub mod supervisor;
pub mod worker;
