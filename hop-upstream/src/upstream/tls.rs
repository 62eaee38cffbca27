//! DNS over TLS with pooled sessions

use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::Message;
use rustls_pki_types::ServerName;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;

use super::{Endpoint, Upstream};
use crate::address::{ServerAddress, TransportKind};
use crate::bootstrap::Bootstrap;
use crate::config::UpstreamOptions;
use crate::error::{Error, Result};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::wire;

/// An established DoT session
pub type TlsSession = tokio_rustls::client::TlsStream<TcpStream>;

/// DoT upstream (RFC 7858)
///
/// Sessions are kept in a [`ConnectionPool`] between exchanges. A pooled
/// session that fails is discarded and the exchange is retried once on a
/// freshly established one.
#[derive(Debug)]
pub struct TlsUpstream {
    address: ServerAddress,
    endpoint: Endpoint,
    server_name: ServerName<'static>,
    tls_config: Arc<rustls::ClientConfig>,
    pool: ConnectionPool<TlsSession>,
    options: UpstreamOptions,
}

impl TlsUpstream {
    pub fn new(address: ServerAddress, bootstrap: Bootstrap, options: UpstreamOptions) -> Result<Self> {
        let server_name = ServerName::try_from(address.host().to_string()).map_err(|e| {
            Error::InvalidAddress(format!("invalid TLS server name '{}': {}", address.host(), e))
        })?;
        let tls_config = options.tls_client_config()?;
        let pool = ConnectionPool::new(options.max_idle_connections, options.idle_timeout);
        let endpoint = Endpoint::new(&address, bootstrap);

        Ok(Self {
            address,
            endpoint,
            server_name,
            tls_config,
            pool,
            options,
        })
    }

    /// Idle sessions kept for reuse
    pub fn pool(&self) -> &ConnectionPool<TlsSession> {
        &self.pool
    }

    async fn connect(&self, deadline: Instant) -> Result<PooledConnection<TlsSession>> {
        let addr = self.endpoint.socket_addr(deadline).await?;
        let tcp_stream = wire::tcp_connect(addr, self.options.bind_addr, deadline).await?;

        log::debug!("Opening TLS session to {} ({})", self.endpoint.host(), addr);

        let connector = TlsConnector::from(self.tls_config.clone());
        let stream = wire::until(deadline, async {
            connector
                .connect(self.server_name.clone(), tcp_stream)
                .await
                .map_err(|e| Error::Connect(format!("TLS handshake with {} failed: {}", addr, e)))
        })
        .await?;

        Ok(PooledConnection::new(stream))
    }
}

#[async_trait]
impl Upstream for TlsUpstream {
    async fn exchange(&self, query: &Message) -> Result<Message> {
        let deadline = Instant::now() + self.options.timeout;
        let packet = wire::encode(query)?;

        if let Some(mut conn) = self.pool.get().await {
            match wire::stream_exchange(conn.get_mut(), &packet, query.id(), deadline).await {
                Ok(response) => {
                    self.pool.put(conn).await;
                    return Ok(response);
                }
                Err(e) if e.is_timeout() => return Err(e),
                Err(e) => {
                    log::debug!(
                        "Pooled session to {} failed ({}), opening a new one",
                        self.address,
                        e
                    );
                    conn.mark_dead();
                    self.pool.put(conn).await;
                }
            }
        } else {
            log::debug!("No idle session to {}", self.address);
        }

        let mut conn = self.connect(deadline).await?;
        let response = wire::stream_exchange(conn.get_mut(), &packet, query.id(), deadline).await?;
        self.pool.put(conn).await;
        Ok(response)
    }

    fn address(&self) -> String {
        self.address.to_string()
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Tls
    }
}
