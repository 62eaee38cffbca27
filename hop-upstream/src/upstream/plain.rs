//! Plain DNS over UDP or TCP

use async_trait::async_trait;
use hickory_proto::op::Message;
use tokio::time::Instant;

use super::{Endpoint, Upstream};
use crate::address::{ServerAddress, TransportKind};
use crate::bootstrap::Bootstrap;
use crate::config::UpstreamOptions;
use crate::error::Result;
use crate::wire;

/// Plain DNS upstream
///
/// `udp://` (and scheme-less) upstreams query over UDP and repeat the query
/// over TCP when the answer comes back truncated. `tcp://` upstreams go
/// straight to TCP with a fresh connection per query.
#[derive(Debug)]
pub struct PlainUpstream {
    address: ServerAddress,
    endpoint: Endpoint,
    options: UpstreamOptions,
}

impl PlainUpstream {
    pub fn new(address: ServerAddress, bootstrap: Bootstrap, options: UpstreamOptions) -> Self {
        let endpoint = Endpoint::new(&address, bootstrap);
        Self {
            address,
            endpoint,
            options,
        }
    }

    fn tcp_only(&self) -> bool {
        self.address.kind() == TransportKind::Tcp
    }
}

#[async_trait]
impl Upstream for PlainUpstream {
    async fn exchange(&self, query: &Message) -> Result<Message> {
        let deadline = Instant::now() + self.options.timeout;
        let addr = self.endpoint.socket_addr(deadline).await?;
        let packet = wire::encode(query)?;

        log::debug!(
            "Querying {} ({}) over {}",
            self.address,
            addr,
            self.address.kind()
        );

        wire::exchange_plain(
            addr,
            &packet,
            query.id(),
            self.tcp_only(),
            self.options.bind_addr,
            deadline,
        )
        .await
    }

    fn address(&self) -> String {
        self.address.to_string()
    }

    fn transport(&self) -> TransportKind {
        self.address.kind()
    }
}
