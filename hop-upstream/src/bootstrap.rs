//! Bootstrap resolution of upstream hostnames
//!
//! A `tls://dns.example` upstream needs the IP of `dns.example` before it can
//! connect. Bootstrap servers are plain DNS servers given as literal
//! addresses; all of them are queried in parallel and the first successful
//! answer wins, so one unreachable server cannot eat the whole timeout.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::wire;

/// Resolve `host` through `bootstrap`, bounded by `timeout`
///
/// Literal IPs are returned immediately without any network I/O.
pub async fn resolve(host: &str, bootstrap: &[SocketAddr], timeout: Duration) -> Result<IpAddr> {
    Bootstrap::new(bootstrap.to_vec())
        .resolve(host, Instant::now() + timeout)
        .await
}

/// A set of bootstrap servers
#[derive(Debug, Clone, Default)]
pub struct Bootstrap {
    servers: Vec<SocketAddr>,
    bind_addr: Option<IpAddr>,
}

impl Bootstrap {
    pub fn new(servers: Vec<SocketAddr>) -> Self {
        Self {
            servers,
            bind_addr: None,
        }
    }

    /// Bind outgoing bootstrap queries to a local address
    pub fn with_bind_addr(mut self, bind_addr: Option<IpAddr>) -> Self {
        self.bind_addr = bind_addr;
        self
    }

    pub fn servers(&self) -> &[SocketAddr] {
        &self.servers
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Resolve `host` to an IP address before `deadline`
    pub async fn resolve(&self, host: &str, deadline: Instant) -> Result<IpAddr> {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            return Ok(ip);
        }

        if self.servers.is_empty() {
            return Err(Error::InvalidAddress(format!(
                "no bootstrap servers to resolve '{}'",
                host
            )));
        }

        let fqdn = if host.ends_with('.') {
            host.to_string()
        } else {
            format!("{}.", host)
        };
        let name = Name::from_ascii(&fqdn)
            .map_err(|e| Error::InvalidAddress(format!("invalid hostname '{}': {}", host, e)))?;

        // Dropping the set aborts the lookups still in flight
        let mut lookups = JoinSet::new();
        for &server in &self.servers {
            let name = name.clone();
            let bind_addr = self.bind_addr;
            lookups.spawn(async move { (server, lookup(server, name, bind_addr, deadline).await) });
        }

        let race = async {
            let mut errors = Vec::new();
            let mut all_timed_out = true;

            while let Some(joined) = lookups.join_next().await {
                match joined {
                    Ok((server, Ok(ip))) => {
                        log::debug!("Bootstrap {} resolved {} to {}", server, host, ip);
                        return Ok(ip);
                    }
                    Ok((server, Err(e))) => {
                        log::debug!("Bootstrap {} failed to resolve {}: {}", server, host, e);
                        all_timed_out &= e.is_timeout();
                        errors.push(format!("{}: {}", server, e));
                    }
                    Err(e) => {
                        all_timed_out = false;
                        errors.push(format!("lookup task failed: {}", e));
                    }
                }
            }

            if all_timed_out {
                return Err(Error::BootstrapTimeout {
                    host: host.to_string(),
                });
            }

            Err(Error::BootstrapFailed(format!(
                "all {} bootstrap servers failed for {}: {}",
                errors.len(),
                host,
                errors.join("; ")
            )))
        };

        match tokio::time::timeout_at(deadline, race).await {
            Ok(result) => result,
            Err(_) => Err(Error::BootstrapTimeout {
                host: host.to_string(),
            }),
        }
    }
}

/// Look up A records, then AAAA if there are none
async fn lookup(
    server: SocketAddr,
    name: Name,
    bind_addr: Option<IpAddr>,
    deadline: Instant,
) -> Result<IpAddr> {
    for record_type in [RecordType::A, RecordType::AAAA] {
        let mut query = Message::new();
        query.set_id(rand::random());
        query.set_message_type(MessageType::Query);
        query.set_op_code(OpCode::Query);
        query.set_recursion_desired(true);
        query.add_query(Query::query(name.clone(), record_type));

        let packet = wire::encode(&query)?;
        let response =
            wire::exchange_plain(server, &packet, query.id(), false, bind_addr, deadline).await?;

        if response.response_code() != ResponseCode::NoError {
            return Err(Error::BootstrapFailed(format!(
                "{} answered {} for {}",
                server,
                response.response_code(),
                name
            )));
        }

        if let Some(ip) = first_address(&response) {
            return Ok(ip);
        }
    }

    Err(Error::BootstrapFailed(format!("no A or AAAA records for {}", name)))
}

fn first_address(response: &Message) -> Option<IpAddr> {
    response.answers().iter().find_map(|record| match record.data() {
        RData::A(a) => Some(IpAddr::V4(a.0)),
        RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
        _ => None,
    })
}
