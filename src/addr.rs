//! `<protocol/host:port>` data-address designators

use std::fmt;
use std::str::FromStr;

use crate::error::{EtdError, Result};

/// One advertised data-channel endpoint. The host is stored without
/// brackets; `Display` re-brackets IPv6 literals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SockName {
    pub protocol: String,
    pub host: String,
    pub port: u16,
}

impl SockName {
    pub fn new(protocol: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        SockName {
            protocol: protocol.into(),
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for SockName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "<{}/[{}]:{}>", self.protocol, self.host, self.port)
        } else {
            write!(f, "<{}/{}:{}>", self.protocol, self.host, self.port)
        }
    }
}

impl FromStr for SockName {
    type Err = EtdError;

    fn from_str(s: &str) -> Result<Self> {
        parse_sockname(s)
    }
}

fn bad(s: &str) -> EtdError {
    EtdError::InvalidArgument(format!("'{}' is not a valid data address designator", s))
}

/// Parse `<proto/host:port>`. Hosts are RFC1123 DNS names (labels up to 63
/// bytes, 255 total) or bracketed IPv6 literals with optional `/prefix` and
/// `%zone`.
pub fn parse_sockname(s: &str) -> Result<SockName> {
    let inner = s
        .strip_prefix('<')
        .and_then(|r| r.strip_suffix('>'))
        .ok_or_else(|| bad(s))?;
    let (proto, rest) = inner.split_once('/').ok_or_else(|| bad(s))?;
    if proto.is_empty() {
        return Err(bad(s));
    }

    let (host, port_s) = if let Some(r) = rest.strip_prefix('[') {
        let (lit, tail) = r.split_once(']').ok_or_else(|| bad(s))?;
        if !is_ipv6_literal(lit) {
            return Err(bad(s));
        }
        (lit, tail.strip_prefix(':').ok_or_else(|| bad(s))?)
    } else {
        let (h, p) = rest.rsplit_once(':').ok_or_else(|| bad(s))?;
        if h.len() > 255 {
            return Err(EtdError::InvalidArgument(
                "host names can not be longer than 255 characters (RFC1123)".to_string(),
            ));
        }
        if !is_dns_name(h) {
            return Err(bad(s));
        }
        (h, p)
    };

    if port_s.is_empty() || !port_s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(bad(s));
    }
    let port: u16 = port_s
        .parse()
        .map_err(|_| EtdError::InvalidArgument(format!("port '{}' out of range", port_s)))?;

    Ok(SockName::new(proto, host, port))
}

fn is_dns_label(l: &str) -> bool {
    let b = l.as_bytes();
    !b.is_empty()
        && b.len() <= 63
        && b[0].is_ascii_alphanumeric()
        && b[b.len() - 1].is_ascii_alphanumeric()
        && b.iter().all(|c| c.is_ascii_alphanumeric() || *c == b'-')
}

fn is_dns_name(h: &str) -> bool {
    !h.is_empty() && h.split('.').all(is_dns_label)
}

/// Loose IPv6 acceptance matching the wire grammar: hex-ish body, then an
/// optional `/prefix` (1-3 digits), then an optional `%zone`.
fn is_ipv6_literal(l: &str) -> bool {
    let (body, zone) = match l.split_once('%') {
        Some((b, z)) => (b, Some(z)),
        None => (l, None),
    };
    let (addr, prefix) = match body.split_once('/') {
        Some((a, p)) => (a, Some(p)),
        None => (body, None),
    };
    if addr.is_empty() || !addr.bytes().all(|b| b == b':' || b.is_ascii_alphanumeric()) {
        return false;
    }
    if let Some(p) = prefix {
        if p.is_empty() || p.len() > 3 || !p.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
    }
    if let Some(z) = zone {
        if z.is_empty() || !z.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return false;
        }
    }
    true
}

/// Parse a comma-separated list of designators, as carried by `send-file`.
pub fn parse_sockname_list(s: &str) -> Result<Vec<SockName>> {
    s.split(',')
        .filter(|p| !p.is_empty())
        .map(parse_sockname)
        .collect()
}

/// Format a designator list for the wire, comma-separated.
pub fn format_sockname_list(addrs: &[SockName]) -> String {
    let parts: Vec<String> = addrs.iter().map(|a| a.to_string()).collect();
    parts.join(",")
}
