use anyhow::{Context, Result};
use scgi_dispatch::Server;

fn main() -> Result<()> {
    Server::new()
        .context("create server")?
        .start()
        .context("start server")
}
