//! DNSCrypt v2 upstream
//!
//! The client fetches the provider's certificate over plain DNS, checks it
//! against the key in the server stamp and derives a shared key with the
//! resolver's short-term key. Queries and responses are then exchanged as
//! single encrypted packets:
//!
//! ```text
//! query:    client magic (8) | client pk (32) | client nonce (12) | box(padded query)
//! response: resolver magic (8) | nonce (24) | box(padded response)
//! ```
//!
//! The response nonce starts with the client nonce. Queries go over UDP
//! first and over length-prefixed TCP when the answer is truncated.

mod cert;
mod cipher;

pub use cert::{Construction, ResolverCertificate};

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use crypto_box::SecretKey;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use tokio::sync::RwLock;
use tokio::time::Instant;

use self::cipher::{pad, unpad, SharedKey, MIN_UDP_QUERY_SIZE};
use super::Upstream;
use crate::address::{ServerAddress, TransportKind};
use crate::config::UpstreamOptions;
use crate::error::{Error, Result};
use crate::stamp::ServerStamp;
use crate::wire;

/// Magic prefix of every resolver response
pub const RESOLVER_MAGIC: &[u8; 8] = b"r6fnvWj8";

const CLIENT_NONCE_LEN: usize = 12;
const QUERY_HEADER_LEN: usize = 8 + 32 + CLIENT_NONCE_LEN;
const RESPONSE_HEADER_LEN: usize = 8 + 24;

/// Encryption state bound to one resolver certificate
struct Session {
    cert: ResolverCertificate,
    client_pk: [u8; 32],
    key: SharedKey,
}

impl Session {
    fn new(cert: ResolverCertificate) -> Self {
        let client_sk = SecretKey::from(rand::random::<[u8; 32]>());
        let client_pk = *client_sk.public_key().as_bytes();
        let key = SharedKey::new(cert.construction(), &client_sk, cert.resolver_pk());
        Self {
            cert,
            client_pk,
            key,
        }
    }

    fn encrypt(&self, packet: &[u8], min_len: usize) -> Result<(Vec<u8>, [u8; CLIENT_NONCE_LEN])> {
        let client_nonce: [u8; CLIENT_NONCE_LEN] = rand::random();
        let mut nonce = [0u8; 24];
        nonce[..CLIENT_NONCE_LEN].copy_from_slice(&client_nonce);

        let sealed = self.key.seal(&nonce, &pad(packet, min_len))?;

        let mut encrypted = Vec::with_capacity(QUERY_HEADER_LEN + sealed.len());
        encrypted.extend_from_slice(self.cert.client_magic());
        encrypted.extend_from_slice(&self.client_pk);
        encrypted.extend_from_slice(&client_nonce);
        encrypted.extend_from_slice(&sealed);
        Ok((encrypted, client_nonce))
    }

    fn decrypt(&self, packet: &[u8], client_nonce: &[u8; CLIENT_NONCE_LEN]) -> Result<Vec<u8>> {
        if packet.len() < RESPONSE_HEADER_LEN {
            return Err(Error::Protocol(format!(
                "DNSCrypt response of {} bytes is too short",
                packet.len()
            )));
        }
        if &packet[..8] != RESOLVER_MAGIC {
            return Err(Error::Protocol("DNSCrypt resolver magic mismatch".into()));
        }

        let mut nonce = [0u8; 24];
        nonce.copy_from_slice(&packet[8..RESPONSE_HEADER_LEN]);
        if &nonce[..CLIENT_NONCE_LEN] != client_nonce {
            return Err(Error::Protocol("DNSCrypt response nonce mismatch".into()));
        }

        let padded = self.key.open(&nonce, &packet[RESPONSE_HEADER_LEN..])?;
        Ok(unpad(&padded)?.to_vec())
    }
}

/// DNSCrypt upstream addressed by an `sdns://` stamp
///
/// The certificate and shared key are fetched on first use and reused
/// until the certificate expires.
pub struct DnsCryptUpstream {
    address: ServerAddress,
    stamp: ServerStamp,
    options: UpstreamOptions,
    session: RwLock<Option<Arc<Session>>>,
}

impl fmt::Debug for DnsCryptUpstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnsCryptUpstream")
            .field("provider", &self.stamp.provider_name())
            .field("server", &self.stamp.server_addr())
            .finish_non_exhaustive()
    }
}

impl DnsCryptUpstream {
    pub fn new(address: ServerAddress, options: UpstreamOptions) -> Result<Self> {
        let stamp = address
            .stamp()
            .cloned()
            .ok_or_else(|| Error::InvalidAddress(format!("{} is not a DNSCrypt stamp", address)))?;

        Ok(Self {
            address,
            stamp,
            options,
            session: RwLock::new(None),
        })
    }

    pub fn stamp(&self) -> &ServerStamp {
        &self.stamp
    }

    /// Certificate currently in use, if one was fetched
    pub async fn certificate(&self) -> Option<ResolverCertificate> {
        self.session.read().await.as_ref().map(|s| s.cert.clone())
    }

    async fn session(&self, deadline: Instant) -> Result<Arc<Session>> {
        let now = unix_now();
        if let Some(session) = self.session.read().await.as_ref() {
            if session.cert.is_valid_at(now) {
                return Ok(session.clone());
            }
            log::debug!(
                "Certificate {} of {} expired, refreshing",
                session.cert.serial(),
                self.stamp.provider_name()
            );
        }

        let cert = self.fetch_certificate(deadline).await?;
        let session = Arc::new(Session::new(cert));
        *self.session.write().await = Some(session.clone());
        Ok(session)
    }

    /// Query the provider name for TXT certificates and keep the best one
    async fn fetch_certificate(&self, deadline: Instant) -> Result<ResolverCertificate> {
        let provider_name = self.stamp.provider_name();
        let fqdn = if provider_name.ends_with('.') {
            provider_name.to_string()
        } else {
            format!("{}.", provider_name)
        };
        let name = Name::from_ascii(&fqdn).map_err(|e| {
            Error::InvalidAddress(format!("invalid provider name '{}': {}", provider_name, e))
        })?;

        let mut query = Message::new();
        query.set_id(rand::random());
        query.set_message_type(MessageType::Query);
        query.set_op_code(OpCode::Query);
        query.set_recursion_desired(true);
        query.add_query(Query::query(name, RecordType::TXT));

        let packet = wire::encode(&query)?;
        let response = wire::exchange_plain(
            self.stamp.server_addr(),
            &packet,
            query.id(),
            false,
            self.options.bind_addr,
            deadline,
        )
        .await?;

        let now = unix_now();
        let mut best: Option<ResolverCertificate> = None;

        for record in response.answers() {
            let RData::TXT(txt) = record.data() else {
                continue;
            };
            let bytes: Vec<u8> = txt.txt_data().iter().flat_map(|chunk| chunk.iter().copied()).collect();

            let cert = match ResolverCertificate::parse(&bytes, self.stamp.provider_pk()) {
                Ok(cert) => cert,
                Err(e) => {
                    log::warn!("Rejected certificate from {}: {}", provider_name, e);
                    continue;
                }
            };
            if !cert.is_valid_at(now) {
                log::warn!(
                    "Rejected certificate {} from {}: not valid now",
                    cert.serial(),
                    provider_name
                );
                continue;
            }
            match &best {
                Some(current) if current.serial() >= cert.serial() => {}
                _ => best = Some(cert),
            }
        }

        let cert = best.ok_or_else(|| {
            Error::Protocol(format!("no valid DNSCrypt certificate for {}", provider_name))
        })?;

        log::debug!(
            "Using certificate {} ({:?}) of {}",
            cert.serial(),
            cert.construction(),
            provider_name
        );
        Ok(cert)
    }

    async fn exchange_udp(
        &self,
        session: &Session,
        addr: SocketAddr,
        packet: &[u8],
        id: u16,
        deadline: Instant,
    ) -> Result<Message> {
        let (encrypted, client_nonce) = session.encrypt(packet, MIN_UDP_QUERY_SIZE)?;
        let reply = wire::udp_exchange(addr, &encrypted, self.options.bind_addr, deadline).await?;
        wire::decode_response(&session.decrypt(&reply, &client_nonce)?, id)
    }

    async fn exchange_tcp(
        &self,
        session: &Session,
        addr: SocketAddr,
        packet: &[u8],
        id: u16,
        deadline: Instant,
    ) -> Result<Message> {
        let (encrypted, client_nonce) = session.encrypt(packet, 0)?;
        let mut stream = wire::tcp_connect(addr, self.options.bind_addr, deadline).await?;
        wire::write_framed(&mut stream, &encrypted, deadline).await?;
        let reply = wire::read_framed(&mut stream, deadline).await?;
        wire::decode_response(&session.decrypt(&reply, &client_nonce)?, id)
    }
}

#[async_trait]
impl Upstream for DnsCryptUpstream {
    async fn exchange(&self, query: &Message) -> Result<Message> {
        let deadline = Instant::now() + self.options.timeout;
        let session = self.session(deadline).await?;
        let addr = self.stamp.server_addr();
        let packet = wire::encode(query)?;

        let response = self.exchange_udp(&session, addr, &packet, query.id(), deadline).await?;
        if !response.truncated() {
            return Ok(response);
        }

        log::debug!("Truncated DNSCrypt response from {}, retrying over TCP", addr);
        self.exchange_tcp(&session, addr, &packet, query.id(), deadline).await
    }

    fn address(&self) -> String {
        self.address.to_string()
    }

    fn transport(&self) -> TransportKind {
        TransportKind::DnsCrypt
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
