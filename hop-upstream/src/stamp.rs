//! DNSCrypt server stamps
//!
//! A stamp is `sdns://` followed by the unpadded URL-safe base64 encoding of:
//!
//! ```text
//! 0x01 | props (u64 LE) | LP(addr) | LP(provider pk) | LP(provider name)
//! ```
//!
//! where `LP(x)` is a one-byte length followed by `x`. The address is a
//! literal IP with an optional port (default 443).

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::address::parse_socket_addr;
use crate::error::{Error, Result};

/// Scheme prefix of every server stamp
pub const STAMP_PREFIX: &str = "sdns://";

/// Default DNSCrypt port when a stamp address omits it
pub const DEFAULT_DNSCRYPT_PORT: u16 = 443;

/// Longest field a one-byte length prefix can describe
const MAX_FIELD_LEN: usize = u8::MAX as usize;

/// Stamp protocol identifier for DNSCrypt
const PROTO_DNSCRYPT: u8 = 0x01;

/// Server supports DNSSEC
pub const PROP_DNSSEC: u64 = 1;

/// Server does not keep logs
pub const PROP_NO_LOG: u64 = 1 << 1;

/// Server does not filter responses
pub const PROP_NO_FILTER: u64 = 1 << 2;

/// Decoded DNSCrypt server stamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStamp {
    props: u64,
    server_addr: SocketAddr,
    provider_pk: [u8; 32],
    provider_name: String,
}

impl ServerStamp {
    /// Create a stamp with no informational properties set
    ///
    /// The provider name must fit a one-byte length prefix.
    pub fn new(
        server_addr: SocketAddr,
        provider_pk: [u8; 32],
        provider_name: impl Into<String>,
    ) -> Result<Self> {
        let provider_name = provider_name.into();
        if provider_name.is_empty() {
            return Err(Error::InvalidAddress("stamp has an empty provider name".into()));
        }
        if provider_name.len() > MAX_FIELD_LEN {
            return Err(Error::InvalidAddress(format!(
                "stamp provider name is {} bytes, at most {} fit",
                provider_name.len(),
                MAX_FIELD_LEN
            )));
        }

        Ok(Self {
            props: 0,
            server_addr,
            provider_pk,
            provider_name,
        })
    }

    /// Set the informational property flags
    pub fn with_props(mut self, props: u64) -> Self {
        self.props = props;
        self
    }

    pub fn props(&self) -> u64 {
        self.props
    }

    pub fn dnssec(&self) -> bool {
        self.props & PROP_DNSSEC != 0
    }

    pub fn no_log(&self) -> bool {
        self.props & PROP_NO_LOG != 0
    }

    pub fn no_filter(&self) -> bool {
        self.props & PROP_NO_FILTER != 0
    }

    /// Resolver address taken from the stamp
    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Ed25519 key the provider signs its certificates with
    pub fn provider_pk(&self) -> &[u8; 32] {
        &self.provider_pk
    }

    /// Provider name, queried for TXT certificates
    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    /// Decode an `sdns://` string
    pub fn decode(s: &str) -> Result<Self> {
        let encoded = s
            .trim()
            .strip_prefix(STAMP_PREFIX)
            .ok_or_else(|| Error::InvalidAddress(format!("stamp must start with {}", STAMP_PREFIX)))?;

        let bin = URL_SAFE_NO_PAD
            .decode(encoded.trim_end_matches('='))
            .map_err(|e| Error::InvalidAddress(format!("invalid stamp encoding: {}", e)))?;

        let mut reader = Reader::new(&bin);

        let proto = reader.byte()?;
        if proto != PROTO_DNSCRYPT {
            return Err(Error::InvalidAddress(format!(
                "unsupported stamp protocol 0x{:02x}, only DNSCrypt is supported",
                proto
            )));
        }

        let props = u64::from_le_bytes(
            reader
                .take(8)?
                .try_into()
                .map_err(|_| Error::InvalidAddress("truncated stamp properties".into()))?,
        );

        let addr = std::str::from_utf8(reader.length_prefixed()?)
            .map_err(|_| Error::InvalidAddress("stamp address is not UTF-8".into()))?;
        if addr.is_empty() {
            return Err(Error::InvalidAddress("stamp has an empty server address".into()));
        }
        let server_addr = parse_socket_addr(addr, DEFAULT_DNSCRYPT_PORT)?;

        let provider_pk: [u8; 32] = reader.length_prefixed()?.try_into().map_err(|_| {
            Error::InvalidAddress("stamp provider key must be 32 bytes".into())
        })?;

        let provider_name = std::str::from_utf8(reader.length_prefixed()?)
            .map_err(|_| Error::InvalidAddress("stamp provider name is not UTF-8".into()))?
            .to_string();
        if provider_name.is_empty() {
            return Err(Error::InvalidAddress("stamp has an empty provider name".into()));
        }

        if !reader.is_empty() {
            return Err(Error::InvalidAddress("garbage after end of stamp".into()));
        }

        Ok(Self {
            props,
            server_addr,
            provider_pk,
            provider_name,
        })
    }

    /// Encode back into an `sdns://` string
    pub fn encode(&self) -> String {
        let addr = if self.server_addr.port() == DEFAULT_DNSCRYPT_PORT {
            match self.server_addr {
                SocketAddr::V4(v4) => v4.ip().to_string(),
                SocketAddr::V6(v6) => format!("[{}]", v6.ip()),
            }
        } else {
            self.server_addr.to_string()
        };

        let mut bin = Vec::with_capacity(1 + 8 + 3 + addr.len() + 32 + self.provider_name.len());
        bin.push(PROTO_DNSCRYPT);
        bin.extend_from_slice(&self.props.to_le_bytes());
        push_length_prefixed(&mut bin, addr.as_bytes());
        push_length_prefixed(&mut bin, &self.provider_pk);
        push_length_prefixed(&mut bin, self.provider_name.as_bytes());

        format!("{}{}", STAMP_PREFIX, URL_SAFE_NO_PAD.encode(bin))
    }
}

impl FromStr for ServerStamp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::decode(s)
    }
}

impl fmt::Display for ServerStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Fields are at most MAX_FIELD_LEN bytes; `new` and `decode` enforce it
fn push_length_prefixed(buf: &mut Vec<u8>, data: &[u8]) {
    debug_assert!(data.len() <= MAX_FIELD_LEN);
    buf.push(data.len() as u8);
    buf.extend_from_slice(data);
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn byte(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(Error::InvalidAddress("truncated stamp".into()));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn length_prefixed(&mut self) -> Result<&'a [u8]> {
        let len = self.byte()? as usize;
        self.take(len)
    }
}
