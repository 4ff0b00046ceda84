//! The SCGI wire format: netstring-framed, null-delimited request
//! environments.
//!
//! This is the "external collaborator" `spec.md` describes as out of
//! scope for the dispatch core — the core never parses a byte of it. It's
//! implemented here anyway because the shipped default connection handler
//! (`worker::EchoHandler`) needs a working parser, and a pluggable system
//! needs at least one real plugin to prove the seam works.

use anyhow::{anyhow, bail, Context, Result};
use std::collections::HashMap;
use std::io::Read;

/// Read a netstring: `<decimal length>:<payload of that length>,`.
fn read_netstring<R: Read>(input: &mut R) -> Result<Vec<u8>> {
    let mut digits = String::new();
    let mut byte = [0u8; 1];
    loop {
        input
            .read_exact(&mut byte)
            .context("read netstring length")?;
        match byte[0] {
            b':' => break,
            b'0'..=b'9' => digits.push(byte[0] as char),
            other => bail!("unexpected byte {other:#x} in netstring length"),
        }
        if digits.len() > 9 {
            bail!("netstring length field too long");
        }
    }
    let len: usize = digits
        .parse()
        .with_context(|| format!("parse netstring length {digits:?}"))?;

    let mut payload = vec![0u8; len];
    input.read_exact(&mut payload).context("read netstring payload")?;

    input
        .read_exact(&mut byte)
        .context("read netstring terminator")?;
    if byte[0] != b',' {
        bail!("missing netstring terminator");
    }
    Ok(payload)
}

/// Split a netstring payload of `name\0value\0...` pairs into a map.
fn parse_env(payload: &[u8]) -> Result<HashMap<String, String>> {
    let mut items = payload
        .split(|&b| b == 0)
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect::<Vec<_>>();
    // The payload is null-*terminated*, so splitting on b'\0' leaves one
    // trailing empty element that isn't part of any pair.
    if items.last().is_some_and(String::is_empty) {
        items.pop();
    }
    if items.len() % 2 != 0 {
        bail!("malformed SCGI headers: odd number of items");
    }
    let mut env = HashMap::with_capacity(items.len() / 2);
    let mut it = items.into_iter();
    while let (Some(k), Some(v)) = (it.next(), it.next()) {
        env.insert(k, v);
    }
    Ok(env)
}

/// Read and parse the SCGI request header from `input`.
///
/// Per the SCGI protocol the first header must be `CONTENT_LENGTH`, but
/// this implementation (matching the Python original) doesn't enforce
/// that — it just exposes whatever name/value pairs it finds.
pub fn read_request_env<R: Read>(input: &mut R) -> Result<HashMap<String, String>> {
    let payload = read_netstring(input)?;
    parse_env(&payload).map_err(|e| anyhow!(e))
}
