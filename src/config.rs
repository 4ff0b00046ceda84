//! Process configuration.
//!
//! The CLI surface is exactly what `spec.md` §6 mandates: one positional
//! port argument, no flags. Everything else (pool size, log level) is an
//! ambient setting sourced purely from the environment, so it never shows
//! up as a CLI flag a user could pass.

use anyhow::{Context, Result};
use clap::Parser;
use getset::{CopyGetters, Getters};
use std::env;
use std::str::FromStr;
use tracing_subscriber::filter::LevelFilter;

/// Default port, per `spec.md` §6.
pub const DEFAULT_PORT: u16 = 4000;

/// Default worker pool bound, matching `scgi_server.py`'s
/// `max_children=5` constructor default.
const DEFAULT_MAX_CHILDREN: usize = 5;

const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Parser, Debug)]
#[command(
    name = "scgi-dispatchd",
    about = "A pre-forking SCGI dispatch server",
    after_help = "Pool size and log level are configured via SCGI_MAX_CHILDREN and SCGI_LOG_LEVEL, not flags."
)]
struct Cli {
    /// TCP port to listen on.
    #[arg(default_value_t = DEFAULT_PORT)]
    port: u16,
}

#[derive(Debug, Getters, CopyGetters)]
pub struct Config {
    #[getset(get_copy = "pub")]
    port: u16,

    #[getset(get_copy = "pub")]
    max_children: usize,

    #[getset(get = "pub")]
    log_level: LevelFilter,
}

impl Config {
    /// Parse CLI arguments and merge in environment-driven ambient
    /// settings. A non-integer port argument is a startup error, per
    /// `spec.md` §6/§7.
    pub fn from_args() -> Result<Self> {
        let cli = Cli::try_parse().context("parse command line")?;
        Self::from_cli(cli)
    }

    fn from_cli(cli: Cli) -> Result<Self> {
        let max_children = match env::var("SCGI_MAX_CHILDREN") {
            Ok(v) => v
                .parse()
                .with_context(|| format!("parse SCGI_MAX_CHILDREN={v:?}"))?,
            Err(env::VarError::NotPresent) => DEFAULT_MAX_CHILDREN,
            Err(e) => return Err(e).context("read SCGI_MAX_CHILDREN"),
        };
        if max_children == 0 {
            anyhow::bail!("SCGI_MAX_CHILDREN must be at least 1");
        }

        let log_level_str =
            env::var("SCGI_LOG_LEVEL").unwrap_or_else(|_| DEFAULT_LOG_LEVEL.into());
        let log_level = LevelFilter::from_str(&log_level_str)
            .with_context(|| format!("parse SCGI_LOG_LEVEL={log_level_str:?}"))?;

        Ok(Self {
            port: cli.port,
            max_children,
            log_level,
        })
    }
}
