//! The [`Upstream`] trait and the factory building its implementations
//!
//! | Address          | Implementation        |
//! |------------------|-----------------------|
//! | `8.8.8.8`        | [`PlainUpstream`]     |
//! | `tcp://8.8.8.8`  | [`PlainUpstream`]     |
//! | `tls://dns.host` | [`TlsUpstream`]       |
//! | `sdns://...`     | [`DnsCryptUpstream`]  |

mod dnscrypt;
mod plain;
mod tls;

pub use dnscrypt::{Construction, DnsCryptUpstream, ResolverCertificate, RESOLVER_MAGIC};
pub use plain::PlainUpstream;
pub use tls::{TlsSession, TlsUpstream};

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Message;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::address::{parse_address, parse_bootstrap, ServerAddress, TransportKind};
use crate::bootstrap::Bootstrap;
use crate::config::UpstreamOptions;
use crate::error::{Error, Result};

/// A DNS server reachable over one transport
///
/// Implementations are safe to share between tasks; every call to
/// [`exchange`](Upstream::exchange) is independent and bounded by the
/// upstream's timeout.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Send `query` and wait for its response
    ///
    /// Never returns a truncated response when the full one could be
    /// fetched over TCP.
    async fn exchange(&self, query: &Message) -> Result<Message>;

    /// Display form of the upstream address
    fn address(&self) -> String;

    fn transport(&self) -> TransportKind;
}

/// Build an upstream from an address string
///
/// `bootstrap` lists literal `ip[:port]` servers used to resolve the
/// address's hostname. It may be empty only when the host is a literal IP.
///
/// ```no_run
/// # async fn example() -> hop_upstream::Result<()> {
/// use std::time::Duration;
/// use hop_upstream::address_to_upstream;
///
/// let upstream = address_to_upstream("tls://dns.google", &["8.8.8.8:53"], Duration::from_secs(5))?;
/// # Ok(())
/// # }
/// ```
pub fn address_to_upstream<S: AsRef<str>>(
    address: &str,
    bootstrap: &[S],
    timeout: Duration,
) -> Result<Box<dyn Upstream>> {
    address_to_upstream_with_options(address, bootstrap, UpstreamOptions::new(timeout))
}

/// Build an upstream with explicit options
pub fn address_to_upstream_with_options<S: AsRef<str>>(
    address: &str,
    bootstrap: &[S],
    options: UpstreamOptions,
) -> Result<Box<dyn Upstream>> {
    let server = parse_address(address)?;
    let bootstrap = Bootstrap::new(parse_bootstrap(bootstrap)?).with_bind_addr(options.bind_addr);

    if server.needs_bootstrap() && bootstrap.is_empty() {
        return Err(Error::InvalidAddress(format!(
            "{}: bootstrap servers are required to resolve '{}'",
            address,
            server.host()
        )));
    }

    log::info!(
        "Creating {} upstream {} with timeout {:?} and {} bootstrap servers",
        server.kind(),
        server,
        options.timeout,
        bootstrap.servers().len()
    );

    let upstream: Box<dyn Upstream> = match server.kind() {
        TransportKind::Plain | TransportKind::Tcp => {
            Box::new(PlainUpstream::new(server, bootstrap, options))
        }
        TransportKind::Tls => Box::new(TlsUpstream::new(server, bootstrap, options)?),
        TransportKind::DnsCrypt => Box::new(DnsCryptUpstream::new(server, options)?),
    };

    Ok(upstream)
}

/// Server socket address, resolved on first use and cached afterwards
#[derive(Debug)]
pub(crate) struct Endpoint {
    host: String,
    port: u16,
    bootstrap: Bootstrap,
    resolved: RwLock<Option<SocketAddr>>,
}

impl Endpoint {
    pub(crate) fn new(address: &ServerAddress, bootstrap: Bootstrap) -> Self {
        Self {
            host: address.host().to_string(),
            port: address.port(),
            bootstrap,
            resolved: RwLock::new(address.ip().map(|ip| SocketAddr::new(ip, address.port()))),
        }
    }

    pub(crate) fn host(&self) -> &str {
        &self.host
    }

    /// Resolve the server address before `deadline`
    ///
    /// Concurrent callers racing on a cold cache each resolve on their own
    /// rather than queueing behind one another.
    pub(crate) async fn socket_addr(&self, deadline: Instant) -> Result<SocketAddr> {
        if let Some(addr) = *self.resolved.read().await {
            return Ok(addr);
        }

        let ip = self.bootstrap.resolve(&self.host, deadline).await?;
        let addr = SocketAddr::new(ip, self.port);
        *self.resolved.write().await = Some(addr);
        Ok(addr)
    }
}
