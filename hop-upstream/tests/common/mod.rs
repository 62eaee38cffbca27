//! Local DNS responders for integration tests
//!
//! - [`DnsServer`]: plain DNS on UDP and TCP sharing one port
//! - [`TlsServer`]: DoT with a self-signed certificate for `dns.test`
//! - [`DnsCryptServer`]: DNSCrypt resolver answering its own certificate query
//!
//! Every responder answers A queries with `127.0.0.1`. Names starting with
//! `big.` come back truncated over UDP and with three records over TCP.

#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crypto_box::aead::generic_array::GenericArray;
use crypto_box::aead::Aead;
use crypto_box::{ChaChaBox, PublicKey, SalsaBox, SecretKey};
use ed25519_dalek::{Signer, SigningKey};
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::rdata::{A, TXT};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};

use hop_upstream::{ServerStamp, RESOLVER_MAGIC};

/// Hostname the TLS certificate is issued for
pub const TLS_HOST: &str = "dns.test";

/// Provider name of the DNSCrypt responder
pub const PROVIDER_NAME: &str = "2.dnscrypt-cert.test";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn query(name: &str, id: u16) -> Message {
    let mut message = Message::new();
    message.set_id(id);
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(true);
    message.add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
    message
}

/// Build the response the responders send for `query`
pub fn answer(query: &Message, over_udp: bool) -> Message {
    let mut response = Message::new();
    response.set_id(query.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(OpCode::Query);
    response.set_recursion_desired(query.recursion_desired());
    response.set_recursion_available(true);
    response.add_queries(query.queries().to_vec());

    let Some(question) = query.queries().first() else {
        return response;
    };
    if question.query_type() != RecordType::A {
        return response;
    }

    let name = question.name().clone();
    let big = name.to_ascii().starts_with("big.");
    if big && over_udp {
        response.set_truncated(true);
        return response;
    }

    let count = if big { 3 } else { 1 };
    for i in 1..=count {
        response.add_answer(Record::from_rdata(
            name.clone(),
            60,
            RData::A(A(Ipv4Addr::new(127, 0, 0, i))),
        ));
    }
    response
}

async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Option<Vec<u8>> {
    let mut len = [0u8; 2];
    stream.read_exact(&mut len).await.ok()?;
    let mut buf = vec![0u8; u16::from_be_bytes(len) as usize];
    stream.read_exact(&mut buf).await.ok()?;
    Some(buf)
}

async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, payload: &[u8]) -> Option<()> {
    let mut msg = (payload.len() as u16).to_be_bytes().to_vec();
    msg.extend_from_slice(payload);
    stream.write_all(&msg).await.ok()?;
    stream.flush().await.ok()
}

/// Answer length-prefixed queries on `stream` until the peer goes away
async fn serve_stream<S, F>(mut stream: S, handle: F)
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: Fn(&[u8]) -> Option<Vec<u8>>,
{
    while let Some(request) = read_frame(&mut stream).await {
        let Some(reply) = handle(&request) else {
            return;
        };
        if write_frame(&mut stream, &reply).await.is_none() {
            return;
        }
    }
}

/// Bind UDP and TCP sockets on the same loopback port
async fn bind_pair() -> (UdpSocket, TcpListener) {
    for _ in 0..32 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        if let Ok(socket) = UdpSocket::bind(addr).await {
            return (socket, listener);
        }
    }
    panic!("no free port for UDP and TCP");
}

/// A UDP socket that never answers, counting what it receives
pub struct SilentServer {
    pub addr: SocketAddr,
    pub received: Arc<AtomicUsize>,
}

impl SilentServer {
    pub async fn start() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let received = Arc::new(AtomicUsize::new(0));

        let counter = received.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            while socket.recv_from(&mut buf).await.is_ok() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        Self { addr, received }
    }
}

/// Plain DNS responder on UDP and TCP
pub struct DnsServer {
    pub addr: SocketAddr,
    pub udp_queries: Arc<AtomicUsize>,
    pub tcp_queries: Arc<AtomicUsize>,
}

impl DnsServer {
    pub async fn start() -> Self {
        let (socket, listener) = bind_pair().await;
        let addr = socket.local_addr().unwrap();
        let udp_queries = Arc::new(AtomicUsize::new(0));
        let tcp_queries = Arc::new(AtomicUsize::new(0));

        let counter = udp_queries.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            while let Ok((len, src)) = socket.recv_from(&mut buf).await {
                counter.fetch_add(1, Ordering::SeqCst);
                let Ok(query) = Message::from_vec(&buf[..len]) else {
                    continue;
                };
                let reply = answer(&query, true).to_vec().unwrap();
                let _ = socket.send_to(&reply, src).await;
            }
        });

        let counter = tcp_queries.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let counter = counter.clone();
                tokio::spawn(serve_stream(stream, move |request| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let query = Message::from_vec(request).ok()?;
                    answer(&query, false).to_vec().ok()
                }));
            }
        });

        Self {
            addr,
            udp_queries,
            tcp_queries,
        }
    }
}

/// DoT responder with a self-signed certificate for [`TLS_HOST`]
pub struct TlsServer {
    pub addr: SocketAddr,
    pub accepted: Arc<AtomicUsize>,
    pub client_config: Arc<rustls::ClientConfig>,
}

impl TlsServer {
    pub async fn start() -> Self {
        let certified = rcgen::generate_simple_self_signed(vec![TLS_HOST.to_string()]).unwrap();
        let cert_der: CertificateDer<'static> = certified.cert.der().clone();
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));

        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let server_config = rustls::ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der.clone()], key_der)
            .unwrap();

        let mut roots = rustls::RootCertStore::empty();
        roots.add(cert_der).unwrap();
        let client_config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));

        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let Ok(stream) = acceptor.accept(stream).await else {
                        return;
                    };
                    serve_stream(stream, |request| {
                        let query = Message::from_vec(request).ok()?;
                        answer(&query, false).to_vec().ok()
                    })
                    .await;
                });
            }
        });

        Self {
            addr,
            accepted,
            client_config: Arc::new(client_config),
        }
    }
}

enum ResolverBox {
    Salsa(SalsaBox),
    ChaCha(ChaChaBox),
}

impl ResolverBox {
    fn new(es_version: u16, client_pk: &[u8], resolver_sk: &SecretKey) -> Option<Self> {
        let client_pk = PublicKey::from(<[u8; 32]>::try_from(client_pk).ok()?);
        match es_version {
            1 => Some(ResolverBox::Salsa(SalsaBox::new(&client_pk, resolver_sk))),
            2 => Some(ResolverBox::ChaCha(ChaChaBox::new(&client_pk, resolver_sk))),
            _ => None,
        }
    }

    fn open(&self, nonce: &[u8; 24], ciphertext: &[u8]) -> Option<Vec<u8>> {
        let nonce = GenericArray::from_slice(nonce);
        match self {
            ResolverBox::Salsa(b) => b.decrypt(nonce, ciphertext).ok(),
            ResolverBox::ChaCha(b) => b.decrypt(nonce, ciphertext).ok(),
        }
    }

    fn seal(&self, nonce: &[u8; 24], plaintext: &[u8]) -> Option<Vec<u8>> {
        let nonce = GenericArray::from_slice(nonce);
        match self {
            ResolverBox::Salsa(b) => b.encrypt(nonce, plaintext).ok(),
            ResolverBox::ChaCha(b) => b.encrypt(nonce, plaintext).ok(),
        }
    }
}

fn unix_now() -> u32 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as u32
}

/// Encode a resolver certificate signed by `provider`
pub fn sign_certificate(
    provider: &SigningKey,
    es_version: u16,
    resolver_pk: &[u8; 32],
    client_magic: &[u8; 8],
    serial: u32,
    valid: std::ops::Range<u32>,
) -> Vec<u8> {
    let mut signed = Vec::with_capacity(52);
    signed.extend_from_slice(resolver_pk);
    signed.extend_from_slice(client_magic);
    signed.extend_from_slice(&serial.to_be_bytes());
    signed.extend_from_slice(&valid.start.to_be_bytes());
    signed.extend_from_slice(&valid.end.to_be_bytes());

    let mut cert = b"DNSC".to_vec();
    cert.extend_from_slice(&es_version.to_be_bytes());
    cert.extend_from_slice(&[0, 0]);
    cert.extend_from_slice(&provider.sign(&signed).to_bytes());
    cert.extend_from_slice(&signed);
    cert
}

fn pad(packet: &[u8]) -> Vec<u8> {
    let mut padded = packet.to_vec();
    padded.push(0x80);
    padded.resize(padded.len().div_ceil(64) * 64, 0);
    padded
}

fn unpad(packet: &[u8]) -> Option<&[u8]> {
    let end = packet.iter().rposition(|&b| b != 0)?;
    (packet[end] == 0x80).then(|| &packet[..end])
}

struct Resolver {
    es_version: u16,
    client_magics: Vec<[u8; 8]>,
    secret: SecretKey,
    certificates: Vec<Vec<u8>>,
}

impl Resolver {
    /// Whether `packet` starts with the magic of a published certificate
    fn accepts(&self, packet: &[u8]) -> bool {
        self.client_magics.iter().any(|magic| packet.starts_with(magic))
    }

    /// Decrypt a query, answer it and encrypt the response
    fn handle_encrypted(&self, packet: &[u8], over_udp: bool) -> Option<Vec<u8>> {
        if packet.len() < 52 || !self.accepts(packet) {
            return None;
        }
        let shared = ResolverBox::new(self.es_version, &packet[8..40], &self.secret)?;

        let mut nonce = [0u8; 24];
        nonce[..12].copy_from_slice(&packet[40..52]);
        let padded = shared.open(&nonce, &packet[52..])?;
        let query = Message::from_vec(unpad(&padded)?).ok()?;

        nonce[12..].copy_from_slice(&rand::random::<[u8; 12]>());
        let sealed = shared.seal(&nonce, &pad(&answer(&query, over_udp).to_vec().ok()?))?;

        let mut response = RESOLVER_MAGIC.to_vec();
        response.extend_from_slice(&nonce);
        response.extend_from_slice(&sealed);
        Some(response)
    }

    /// Answer the certificate TXT query in the clear
    fn handle_plain(&self, packet: &[u8]) -> Option<Vec<u8>> {
        let query = Message::from_vec(packet).ok()?;
        let question = query.queries().first()?;

        let mut response = answer(&query, true);
        if question.query_type() == RecordType::TXT {
            for cert in &self.certificates {
                response.add_answer(Record::from_rdata(
                    question.name().clone(),
                    60,
                    RData::TXT(TXT::from_bytes(vec![cert.as_slice()])),
                ));
            }
        }
        response.to_vec().ok()
    }
}

/// DNSCrypt responder on UDP and TCP sharing one port
pub struct DnsCryptServer {
    pub addr: SocketAddr,
    pub stamp: ServerStamp,
    pub cert_queries: Arc<AtomicUsize>,
    pub udp_queries: Arc<AtomicUsize>,
    pub tcp_queries: Arc<AtomicUsize>,
}

impl DnsCryptServer {
    /// Start a resolver using the given es-version (1 = XSalsa20, 2 = XChaCha20)
    ///
    /// Besides the certificate in use (serial 20, magic `hopmagic`), the
    /// responder publishes an older serial, an expired certificate and one
    /// signed by a foreign key.
    pub async fn start(es_version: u16) -> Self {
        Self::start_with(es_version, false).await
    }

    /// Like [`start`](Self::start), but serial 20 expires one second after
    /// startup. Its successor, serial 21 with magic `newmagic`, becomes
    /// valid the second after that.
    pub async fn start_rotating(es_version: u16) -> Self {
        Self::start_with(es_version, true).await
    }

    async fn start_with(es_version: u16, rotating: bool) -> Self {
        let provider = SigningKey::from_bytes(&rand::random::<[u8; 32]>());
        let foreign = SigningKey::from_bytes(&rand::random::<[u8; 32]>());
        let secret = SecretKey::from(rand::random::<[u8; 32]>());
        let resolver_pk = *secret.public_key().as_bytes();
        let now = unix_now();
        let day = 86_400;

        let current_end = if rotating { now + 1 } else { now + day };
        let mut certificates = vec![
            sign_certificate(&provider, es_version, &[9u8; 32], b"oldmagic", 10, now - day..now + day),
            sign_certificate(&provider, es_version, &resolver_pk, b"hopmagic", 20, now - day..current_end),
            sign_certificate(&provider, es_version, &[9u8; 32], b"expired!", 30, now - 2 * day..now - day),
            sign_certificate(&foreign, es_version, &[9u8; 32], b"foreign!", 40, now - day..now + day),
        ];
        let mut client_magics = vec![*b"hopmagic"];
        if rotating {
            certificates.push(sign_certificate(
                &provider,
                es_version,
                &resolver_pk,
                b"newmagic",
                21,
                now + 2..now + day,
            ));
            client_magics.push(*b"newmagic");
        }

        let resolver = Arc::new(Resolver {
            es_version,
            client_magics,
            secret,
            certificates,
        });

        let (socket, listener) = bind_pair().await;
        let addr = socket.local_addr().unwrap();
        let cert_queries = Arc::new(AtomicUsize::new(0));
        let udp_queries = Arc::new(AtomicUsize::new(0));
        let tcp_queries = Arc::new(AtomicUsize::new(0));

        {
            let resolver = resolver.clone();
            let cert_queries = cert_queries.clone();
            let udp_queries = udp_queries.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                while let Ok((len, src)) = socket.recv_from(&mut buf).await {
                    let packet = &buf[..len];
                    let reply = if resolver.accepts(packet) {
                        udp_queries.fetch_add(1, Ordering::SeqCst);
                        resolver.handle_encrypted(packet, true)
                    } else {
                        cert_queries.fetch_add(1, Ordering::SeqCst);
                        resolver.handle_plain(packet)
                    };
                    if let Some(reply) = reply {
                        let _ = socket.send_to(&reply, src).await;
                    }
                }
            });
        }

        {
            let tcp_queries = tcp_queries.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let resolver = resolver.clone();
                    let tcp_queries = tcp_queries.clone();
                    tokio::spawn(serve_stream(stream, move |request| {
                        tcp_queries.fetch_add(1, Ordering::SeqCst);
                        resolver.handle_encrypted(request, false)
                    }));
                }
            });
        }

        let stamp = ServerStamp::new(addr, provider.verifying_key().to_bytes(), PROVIDER_NAME).unwrap();

        Self {
            addr,
            stamp,
            cert_queries,
            udp_queries,
            tcp_queries,
        }
    }
}

/// Generous timeout for exchanges that are expected to succeed
pub const TIMEOUT: Duration = Duration::from_secs(5);
