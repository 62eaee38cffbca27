//! hop-upstream - DNS upstream client over multiple transports
//!
//! This crate turns an upstream address string into something that can
//! exchange DNS messages:
//! - `8.8.8.8`, `udp://8.8.8.8:53` - plain DNS, UDP with TCP fallback on truncation
//! - `tcp://8.8.8.8` - plain DNS over TCP
//! - `tls://dns.google` - DNS over TLS with pooled sessions
//! - `sdns://...` - DNSCrypt, addressed by a server stamp
//!
//! Hostnames are resolved through bootstrap servers, which must be literal
//! IP addresses. Every exchange is bounded by the upstream's timeout,
//! including bootstrap resolution and connection setup.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use hickory_proto::op::{Message, Query};
//! use hickory_proto::rr::{Name, RecordType};
//! use hop_upstream::address_to_upstream;
//!
//! # async fn example() -> hop_upstream::Result<()> {
//! let upstream = address_to_upstream("tls://dns.google", &["8.8.8.8"], Duration::from_secs(5))?;
//!
//! let mut query = Message::new();
//! query.set_id(1).set_recursion_desired(true);
//! query.add_query(Query::query(Name::from_ascii("example.com.").unwrap(), RecordType::A));
//!
//! let response = upstream.exchange(&query).await?;
//! println!("{} answered with {} records", upstream.address(), response.answers().len());
//! # Ok(())
//! # }
//! ```
//!
//! Upstreams are `Send + Sync`; share one behind an `Arc` and call
//! `exchange` from as many tasks as needed.

mod address;
mod bootstrap;
mod config;
pub mod error;
mod pool;
mod stamp;
mod upstream;
mod wire;

pub use address::{parse_address, parse_bootstrap, ServerAddress, TransportKind, DEFAULT_PLAIN_PORT, DEFAULT_TLS_PORT};
pub use bootstrap::{resolve, Bootstrap};
pub use config::{
    UpstreamConfig, UpstreamOptions, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_IDLE_CONNECTIONS, DEFAULT_TIMEOUT,
};
pub use error::{Error, Result};
pub use pool::{ConnectionPool, PooledConnection};
pub use stamp::{ServerStamp, DEFAULT_DNSCRYPT_PORT, PROP_DNSSEC, PROP_NO_FILTER, PROP_NO_LOG};
pub use upstream::{
    address_to_upstream, address_to_upstream_with_options, Construction, DnsCryptUpstream, PlainUpstream,
    ResolverCertificate, TlsSession, TlsUpstream, Upstream, RESOLVER_MAGIC,
};
