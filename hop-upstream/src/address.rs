//! Upstream address parsing
//!
//! Parses upstream server addresses in various formats:
//! - `host`, `host:port` or `udp://host[:port]` - plain DNS, UDP with TCP fallback
//! - `tcp://host[:port]` - plain DNS over TCP only
//! - `tls://host[:port]` - DNS over TLS (DoT)
//! - `sdns://...` - DNSCrypt server stamp
//!
//! Hostnames are kept as-is; they are resolved through the bootstrap
//! servers when the upstream is first used.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::stamp::{ServerStamp, STAMP_PREFIX};

/// Default port for plain DNS
pub const DEFAULT_PLAIN_PORT: u16 = 53;

/// Default port for DNS over TLS
pub const DEFAULT_TLS_PORT: u16 = 853;

/// Transport used to reach an upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// UDP, retried over TCP when the answer is truncated
    Plain,

    /// TCP only
    Tcp,

    /// DNS over TLS with pooled sessions
    Tls,

    /// DNSCrypt, addressed by a server stamp
    DnsCrypt,
}

impl TransportKind {
    /// Get a human-readable description of this transport
    pub fn description(&self) -> &'static str {
        match self {
            TransportKind::Plain => "UDP",
            TransportKind::Tcp => "TCP",
            TransportKind::Tls => "DoT",
            TransportKind::DnsCrypt => "DNSCrypt",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// A parsed upstream address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    kind: TransportKind,
    host: String,
    port: u16,
    stamp: Option<ServerStamp>,
}

impl ServerAddress {
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Domain name or literal IP, without brackets
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Decoded stamp for DNSCrypt addresses
    pub fn stamp(&self) -> Option<&ServerStamp> {
        self.stamp.as_ref()
    }

    /// The host as an IP address, if it is a literal
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    /// Whether the host must be resolved through bootstrap servers
    pub fn needs_bootstrap(&self) -> bool {
        self.ip().is_none()
    }

    fn host_port(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TransportKind::Plain => write!(f, "{}", self.host_port()),
            TransportKind::Tcp => write!(f, "tcp://{}", self.host_port()),
            TransportKind::Tls => {
                if self.port == DEFAULT_TLS_PORT && !self.host.contains(':') {
                    write!(f, "tls://{}", self.host)
                } else {
                    write!(f, "tls://{}", self.host_port())
                }
            }
            TransportKind::DnsCrypt => match &self.stamp {
                Some(stamp) => write!(f, "{}", stamp),
                None => write!(f, "sdns://{}", self.host_port()),
            },
        }
    }
}

impl FromStr for ServerAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_address(s)
    }
}

/// Parse an upstream address string
///
/// Supported formats:
/// - `8.8.8.8` - UDP to 8.8.8.8:53, TCP on truncation
/// - `8.8.8.8:5353` - UDP to 8.8.8.8:5353
/// - `[2001:4860:4860::8888]:53` - IPv6 literal
/// - `dns.example` - UDP, resolved through bootstrap servers
/// - `udp://8.8.8.8` - explicit form of the above
/// - `tcp://8.8.8.8` - TCP only
/// - `tls://dns.google` - DoT on port 853
/// - `tls://dns.google:8853` - DoT on port 8853
/// - `sdns://AQ...` - DNSCrypt stamp
pub fn parse_address(s: &str) -> Result<ServerAddress> {
    let s = s.trim();

    if s.starts_with(STAMP_PREFIX) {
        let stamp = ServerStamp::decode(s)?;
        return Ok(ServerAddress {
            kind: TransportKind::DnsCrypt,
            host: stamp.server_addr().ip().to_string(),
            port: stamp.server_addr().port(),
            stamp: Some(stamp),
        });
    }

    let (kind, rest, default_port) = match s.split_once("://") {
        Some((scheme, rest)) => match scheme.to_lowercase().as_str() {
            "udp" => (TransportKind::Plain, rest, DEFAULT_PLAIN_PORT),
            "tcp" => (TransportKind::Tcp, rest, DEFAULT_PLAIN_PORT),
            "tls" => (TransportKind::Tls, rest, DEFAULT_TLS_PORT),
            _ => {
                return Err(Error::InvalidAddress(format!(
                    "unsupported scheme '{}' in '{}', expected udp, tcp, tls or sdns",
                    scheme, s
                )))
            }
        },
        None => (TransportKind::Plain, s, DEFAULT_PLAIN_PORT),
    };

    let (host, port) = split_host_port(rest, default_port)?;

    Ok(ServerAddress {
        kind,
        host,
        port,
        stamp: None,
    })
}

/// Parse bootstrap server entries, each a literal `ip[:port]`
pub fn parse_bootstrap<S: AsRef<str>>(entries: &[S]) -> Result<Vec<SocketAddr>> {
    entries
        .iter()
        .map(|entry| {
            parse_socket_addr(entry.as_ref().trim(), DEFAULT_PLAIN_PORT).map_err(|e| {
                Error::InvalidAddress(format!("bootstrap '{}': {}", entry.as_ref(), e))
            })
        })
        .collect()
}

/// Split `host[:port]` where host is a domain name or IP literal
fn split_host_port(s: &str, default_port: u16) -> Result<(String, u16)> {
    if let Some(inner) = s.strip_prefix('[') {
        let bracket_end = inner
            .find(']')
            .ok_or_else(|| Error::InvalidAddress(format!("unterminated '[' in '{}'", s)))?;
        let ip_str = &inner[..bracket_end];
        let ip = ip_str
            .parse::<IpAddr>()
            .map_err(|e| Error::InvalidAddress(format!("invalid IP address '{}': {}", ip_str, e)))?;

        let port = match &inner[bracket_end + 1..] {
            "" => default_port,
            tail => parse_port(tail.strip_prefix(':').ok_or_else(|| {
                Error::InvalidAddress(format!("unexpected '{}' after address", tail))
            })?)?,
        };

        return Ok((ip.to_string(), port));
    }

    // Bare IPv4 or IPv6 literal without a port
    if let Ok(ip) = s.parse::<IpAddr>() {
        return Ok((ip.to_string(), default_port));
    }

    let (host, port) = match s.rsplit_once(':') {
        Some((host, port)) => (host, parse_port(port)?),
        None => (s, default_port),
    };

    if host.is_empty() {
        return Err(Error::InvalidAddress(format!("empty host in '{}'", s)));
    }
    if host.contains(|c: char| c == ':' || c == '/' || c.is_whitespace()) {
        return Err(Error::InvalidAddress(format!("invalid host '{}'", host)));
    }

    Ok((host.to_string(), port))
}

fn parse_port(s: &str) -> Result<u16> {
    s.parse::<u16>()
        .map_err(|e| Error::InvalidAddress(format!("invalid port '{}': {}", s, e)))
}

/// Parse an IP address with optional port, defaulting to the given port
pub(crate) fn parse_socket_addr(s: &str, default_port: u16) -> Result<SocketAddr> {
    // Try parsing as full socket address first
    if let Ok(addr) = SocketAddr::from_str(s) {
        return Ok(addr);
    }

    let (host, port) = split_host_port(s, default_port)?;
    let ip = host
        .parse::<IpAddr>()
        .map_err(|_| Error::InvalidAddress(format!("'{}' is not a literal IP address", host)))?;

    Ok(SocketAddr::new(ip, port))
}
