//! Socket helpers shared by the transports
//!
//! Every helper takes the exchange deadline and fails with
//! [`Error::ExchangeTimeout`] once it passes, so a whole exchange is bounded
//! by one timeout no matter how many steps it takes.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use hickory_proto::op::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tokio::time::Instant;

use crate::error::{Error, Result};

/// Largest datagram a UDP reply can be, so EDNS answers are never cut short
pub(crate) const MAX_UDP_RESPONSE_SIZE: usize = u16::MAX as usize;

/// Run `fut` until `deadline`
pub(crate) async fn until<T, F>(deadline: Instant, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::ExchangeTimeout),
    }
}

/// Serialize a query
pub(crate) fn encode(message: &Message) -> Result<Vec<u8>> {
    message
        .to_vec()
        .map_err(|e| Error::Protocol(format!("failed to serialize DNS message: {}", e)))
}

/// Parse a response and check it answers the query with `id`
pub(crate) fn decode_response(bytes: &[u8], id: u16) -> Result<Message> {
    let response = Message::from_vec(bytes)
        .map_err(|e| Error::Protocol(format!("malformed DNS response: {}", e)))?;

    if response.id() != id {
        return Err(Error::Protocol(format!(
            "response id {} does not match query id {}",
            response.id(),
            id
        )));
    }

    Ok(response)
}

fn unspecified_for(addr: &SocketAddr) -> IpAddr {
    if addr.is_ipv6() {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }
}

/// Send one datagram and wait for one reply
pub(crate) async fn udp_exchange(
    addr: SocketAddr,
    packet: &[u8],
    bind_addr: Option<IpAddr>,
    deadline: Instant,
) -> Result<Vec<u8>> {
    let bind_socket_addr = SocketAddr::new(bind_addr.unwrap_or_else(|| unspecified_for(&addr)), 0);

    let socket = UdpSocket::bind(bind_socket_addr).await.map_err(|e| {
        Error::Connect(format!("failed to bind UDP socket to {}: {}", bind_socket_addr, e))
    })?;

    // Connected sockets only accept datagrams from `addr` and surface ICMP errors
    socket
        .connect(addr)
        .await
        .map_err(|e| Error::Connect(format!("UDP connect to {} failed: {}", addr, e)))?;

    until(deadline, async {
        socket.send(packet).await?;

        let mut buf = vec![0u8; MAX_UDP_RESPONSE_SIZE];
        let len = socket.recv(&mut buf).await?;
        buf.truncate(len);
        Ok(buf)
    })
    .await
}

/// Connect to `addr` from a socket bound to `bind_addr`
async fn create_bound_tcp_stream(addr: SocketAddr, bind_addr: IpAddr) -> std::io::Result<TcpStream> {
    let domain = if addr.is_ipv6() {
        socket2::Domain::IPV6
    } else {
        socket2::Domain::IPV4
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.bind(&SocketAddr::new(bind_addr, 0).into())?;
    socket.set_nonblocking(true)?;

    let socket = TcpSocket::from_std_stream(socket.into());
    socket.connect(addr).await
}

/// Open a TCP connection, optionally from a specific local address
pub(crate) async fn tcp_connect(
    addr: SocketAddr,
    bind_addr: Option<IpAddr>,
    deadline: Instant,
) -> Result<TcpStream> {
    until(deadline, async {
        let stream = match bind_addr {
            Some(bind_ip) => create_bound_tcp_stream(addr, bind_ip).await.map_err(|e| {
                Error::Connect(format!(
                    "TCP connect to {} (bound to {}) failed: {}",
                    addr, bind_ip, e
                ))
            })?,
            None => TcpStream::connect(addr)
                .await
                .map_err(|e| Error::Connect(format!("TCP connect to {} failed: {}", addr, e)))?,
        };
        // Queries are small and latency bound
        let _ = stream.set_nodelay(true);
        Ok(stream)
    })
    .await
}

/// Write one length-prefixed message
pub(crate) async fn write_framed<S>(stream: &mut S, payload: &[u8], deadline: Instant) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let len = u16::try_from(payload.len())
        .map_err(|_| Error::Protocol(format!("message of {} bytes is too large", payload.len())))?;

    let mut msg = Vec::with_capacity(2 + payload.len());
    msg.extend_from_slice(&len.to_be_bytes());
    msg.extend_from_slice(payload);

    until(deadline, async {
        stream.write_all(&msg).await?;
        stream.flush().await?;
        Ok(())
    })
    .await
}

/// Read one length-prefixed message
pub(crate) async fn read_framed<S>(stream: &mut S, deadline: Instant) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    until(deadline, async {
        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await?;

        // A two-byte prefix caps a frame at 65535 bytes
        let response_len = u16::from_be_bytes(len_buf) as usize;
        let mut response = vec![0u8; response_len];
        stream.read_exact(&mut response).await?;
        Ok(response)
    })
    .await
}

/// One query/response round trip over an established stream
pub(crate) async fn stream_exchange<S>(
    stream: &mut S,
    packet: &[u8],
    id: u16,
    deadline: Instant,
) -> Result<Message>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_framed(stream, packet, deadline).await?;
    let reply = read_framed(stream, deadline).await?;
    decode_response(&reply, id)
}

/// Plain DNS exchange: UDP first, the same query over TCP when truncated
pub(crate) async fn exchange_plain(
    addr: SocketAddr,
    packet: &[u8],
    id: u16,
    force_tcp: bool,
    bind_addr: Option<IpAddr>,
    deadline: Instant,
) -> Result<Message> {
    if !force_tcp {
        let reply = udp_exchange(addr, packet, bind_addr, deadline).await?;
        let response = decode_response(&reply, id)?;
        if !response.truncated() {
            return Ok(response);
        }
        log::debug!("Truncated UDP response from {}, retrying over TCP", addr);
    }

    let mut stream = tcp_connect(addr, bind_addr, deadline).await?;
    stream_exchange(&mut stream, packet, id, deadline).await
}
