//! Small parsing helpers for addresses and the relay's allowed-port set.

use std::collections::HashSet;

use anyhow::{bail, Context, Result};

/// Parses a port spec like `80,443,8000-8100` into a set of ports.
///
/// Each comma-separated token is either a single port or an inclusive
/// `low-high` range. Any malformed token is an error; startup should treat
/// that as fatal.
pub fn parse_port_set(spec: &str) -> Result<HashSet<u16>> {
    let mut out = HashSet::new();
    for token in spec.split(',') {
        match token.split_once('-') {
            None => {
                let port: u16 = token
                    .parse()
                    .with_context(|| format!("bad port {token:?}"))?;
                out.insert(port);
            }
            Some((lo, hi)) => {
                let lo: u16 = lo.parse().with_context(|| format!("bad range start in {token:?}"))?;
                let hi: u16 = hi.parse().with_context(|| format!("bad range end in {token:?}"))?;
                if lo > hi {
                    bail!("empty range {token:?}");
                }
                for port in lo..=hi {
                    out.insert(port);
                }
            }
        }
    }
    Ok(out)
}

/// Splits a `host:port` pair on the last colon and parses the port.
///
/// IPv6 hosts must be bracketed (`[::1]:443`), the same form the socket
/// address parser accepts when dialing.
pub fn split_host_port(hostport: &str) -> Result<(&str, u16)> {
    let (host, port) = hostport
        .rsplit_once(':')
        .with_context(|| format!("missing port in {hostport:?}"))?;
    if host.is_empty() {
        bail!("missing host in {hostport:?}");
    }
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        bail!("unbracketed IPv6 host in {hostport:?}");
    }
    let port = port
        .parse()
        .with_context(|| format!("bad port in {hostport:?}"))?;
    Ok((host, port))
}

/// Expands a bare `:port` listen flag into a bindable `0.0.0.0:port`.
pub fn listen_addr(flag: &str) -> String {
    if flag.starts_with(':') {
        format!("0.0.0.0{flag}")
    } else {
        flag.to_string()
    }
}
