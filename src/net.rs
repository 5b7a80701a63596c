//! Endpoint descriptors and the socket plumbing beneath the forwarders:
//! network-name parsing with explicit stream/datagram classification,
//! listener and dialer helpers, and the shared accept-retry backoff.

use std::borrow::Cow;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpSocket, TcpStream, UdpSocket, lookup_host};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::time;

use crate::{Error, Result};

pub(crate) const DEFAULT_READ_BUF_SIZE: usize = 4096;

/// Whether a network carries a byte stream or discrete datagrams.
///
/// The listener and dial path are chosen by matching on this, never by
/// probing the socket at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Stream,
    Datagram,
}

/// A network name in the `"tcp"`/`"udp4"`/`"unix"` style.
///
/// Raw IP networks (`ip`, `ip4`, `ip6`, `ip:<proto>`) parse and classify
/// as datagram so front-ends can produce a precise error, but the tokio
/// runtime cannot open them; bind and dial return [`Error::Unsupported`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Tcp4,
    Tcp6,
    Udp,
    Udp4,
    Udp6,
    Unix,
    UnixPacket,
    UnixGram,
    Ip,
    Ip4,
    Ip6,
    /// `ip:<proto>`, e.g. `ip4:ospf` or `ip:1`.
    IpProto(String),
}

impl Network {
    pub fn family(&self) -> Family {
        match self {
            Network::Tcp | Network::Tcp4 | Network::Tcp6 | Network::Unix | Network::UnixPacket => {
                Family::Stream
            }
            Network::Udp
            | Network::Udp4
            | Network::Udp6
            | Network::UnixGram
            | Network::Ip
            | Network::Ip4
            | Network::Ip6
            | Network::IpProto(_) => Family::Datagram,
        }
    }
}

impl FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            "udp" => Ok(Network::Udp),
            "udp4" => Ok(Network::Udp4),
            "udp6" => Ok(Network::Udp6),
            "unix" => Ok(Network::Unix),
            "unixpacket" => Ok(Network::UnixPacket),
            "unixgram" => Ok(Network::UnixGram),
            "ip" => Ok(Network::Ip),
            "ip4" => Ok(Network::Ip4),
            "ip6" => Ok(Network::Ip6),
            other => {
                if let Some(proto) = other.strip_prefix("ip:")
                    && !proto.is_empty()
                {
                    return Ok(Network::IpProto(proto.to_string()));
                }
                Err(Error::UnknownNetwork(other.to_string()))
            }
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => f.write_str("tcp"),
            Network::Tcp4 => f.write_str("tcp4"),
            Network::Tcp6 => f.write_str("tcp6"),
            Network::Udp => f.write_str("udp"),
            Network::Udp4 => f.write_str("udp4"),
            Network::Udp6 => f.write_str("udp6"),
            Network::Unix => f.write_str("unix"),
            Network::UnixPacket => f.write_str("unixpacket"),
            Network::UnixGram => f.write_str("unixgram"),
            Network::Ip => f.write_str("ip"),
            Network::Ip4 => f.write_str("ip4"),
            Network::Ip6 => f.write_str("ip6"),
            Network::IpProto(p) => write!(f, "ip:{p}"),
        }
    }
}

/// One side of a forwarder: a network plus a bind/source address and a
/// target address. Immutable once a transport has started.
///
/// `local` is the listen address (listening sides) or the optional source
/// address (dialing sides); `remote` is the dial target and is unused by
/// listen-only sides.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub network: Network,
    pub local: Option<String>,
    pub remote: Option<String>,
}

impl Endpoint {
    /// Endpoint for a listening side.
    pub fn listen(network: Network, local: impl Into<String>) -> Self {
        Self {
            network,
            local: Some(local.into()),
            remote: None,
        }
    }

    /// Endpoint for a dialing side.
    pub fn dial(network: Network, remote: impl Into<String>) -> Self {
        Self {
            network,
            local: None,
            remote: Some(remote.into()),
        }
    }

    /// Pin the source address used for outgoing dials.
    pub fn with_local(mut self, local: impl Into<String>) -> Self {
        self.local = Some(local.into());
        self
    }

    pub(crate) fn local_or_err(&self) -> Result<&str> {
        match self.local.as_deref() {
            Some(a) if !a.trim().is_empty() => Ok(a),
            _ => Err(Error::MissingAddress("local")),
        }
    }

    pub(crate) fn remote_or_err(&self) -> Result<&str> {
        match self.remote.as_deref() {
            Some(a) if !a.trim().is_empty() => Ok(a),
            _ => Err(Error::MissingAddress("remote")),
        }
    }
}

/// Normalize a bind address: the `":PORT"` shorthand means all
/// interfaces, which the tokio bind APIs do not accept directly.
pub(crate) fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// An established stream connection on either side of a splice.
#[derive(Debug)]
pub enum Conn {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Conn {
    /// Canonical key of the connection's peer, used by the pools.
    pub fn peer_key(&self) -> String {
        match self {
            Conn::Tcp(s) => s
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_default(),
            #[cfg(unix)]
            Conn::Unix(s) => s
                .peer_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
                .unwrap_or_default(),
        }
    }

    /// Non-destructive liveness probe for parked connections.
    ///
    /// A peek that is immediately ready with `Ok(0)` or an error means
    /// the peer hung up. Pending means the socket is open with nothing
    /// buffered; ready with data means the peer already sent bytes (for
    /// example a verify token) which must stay in the socket.
    pub(crate) fn is_stale(&self) -> bool {
        match self {
            Conn::Tcp(s) => {
                let mut probe = [0u8; 1];
                match s.peek(&mut probe).now_or_never() {
                    Some(Ok(0)) | Some(Err(_)) => true,
                    Some(Ok(_)) | None => false,
                }
            }
            // No peek on unix sockets; a dead peer surfaces on first use.
            #[cfg(unix)]
            Conn::Unix(_) => false,
        }
    }
}

impl AsyncRead for Conn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Conn::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Conn::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Conn::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Conn::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Conn::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// A bound stream listener for whichever stream network the endpoint
/// names.
pub(crate) enum StreamListener {
    Tcp(tokio::net::TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl StreamListener {
    pub(crate) async fn accept(&self) -> io::Result<Conn> {
        match self {
            StreamListener::Tcp(l) => l.accept().await.map(|(s, _)| Conn::Tcp(s)),
            #[cfg(unix)]
            StreamListener::Unix(l) => l.accept().await.map(|(s, _)| Conn::Unix(s)),
        }
    }

    pub(crate) fn local_desc(&self) -> String {
        match self {
            StreamListener::Tcp(l) => l
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_default(),
            #[cfg(unix)]
            StreamListener::Unix(l) => l
                .local_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
                .unwrap_or_default(),
        }
    }

    pub(crate) fn local_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            StreamListener::Tcp(l) => l.local_addr().ok(),
            #[cfg(unix)]
            StreamListener::Unix(_) => None,
        }
    }
}

pub(crate) async fn bind_stream(ep: &Endpoint) -> Result<StreamListener> {
    let local = ep.local_or_err()?;
    match &ep.network {
        Network::Tcp | Network::Tcp4 | Network::Tcp6 => {
            let ln = tokio::net::TcpListener::bind(normalize_bind_addr(local).as_ref()).await?;
            Ok(StreamListener::Tcp(ln))
        }
        #[cfg(unix)]
        Network::Unix => Ok(StreamListener::Unix(UnixListener::bind(local)?)),
        #[cfg(not(unix))]
        Network::Unix => Err(Error::Unsupported("unix sockets on this platform")),
        Network::UnixPacket => Err(Error::Unsupported("unixpacket (seqpacket) sockets")),
        _ => Err(Error::Unsupported("datagram network on a stream listener")),
    }
}

pub(crate) async fn bind_datagram(ep: &Endpoint) -> Result<UdpSocket> {
    let local = ep.local_or_err()?;
    match &ep.network {
        Network::Udp | Network::Udp4 | Network::Udp6 => {
            Ok(UdpSocket::bind(normalize_bind_addr(local).as_ref()).await?)
        }
        Network::UnixGram => Err(Error::Unsupported("unixgram sockets")),
        Network::Ip | Network::Ip4 | Network::Ip6 | Network::IpProto(_) => {
            Err(Error::Unsupported("raw ip sockets"))
        }
        _ => Err(Error::Unsupported("stream network on a datagram listener")),
    }
}

async fn resolve(addr: &str) -> io::Result<SocketAddr> {
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return Ok(sa);
    }
    lookup_host(addr).await?.next().ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("could not resolve {addr:?}"))
    })
}

async fn dial_tcp(local: Option<&str>, remote: &str) -> io::Result<TcpStream> {
    let remote = resolve(remote).await?;
    match local {
        Some(l) if !l.trim().is_empty() => {
            let source: SocketAddr = resolve(l).await?;
            let socket = if remote.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.bind(source)?;
            socket.connect(remote).await
        }
        _ => TcpStream::connect(remote).await,
    }
}

/// Dial the endpoint's remote on a stream network, bounded by `timeout`
/// and aborted early when the cancellation root flips.
pub(crate) async fn dial_stream(
    ep: &Endpoint,
    timeout: Option<Duration>,
    shutdown: Option<&watch::Receiver<bool>>,
) -> Result<Conn> {
    let remote = ep.remote_or_err()?;
    let fut = async {
        match &ep.network {
            Network::Tcp | Network::Tcp4 | Network::Tcp6 => {
                Ok(Conn::Tcp(dial_tcp(ep.local.as_deref(), remote).await?))
            }
            #[cfg(unix)]
            Network::Unix => Ok(Conn::Unix(UnixStream::connect(remote).await?)),
            #[cfg(not(unix))]
            Network::Unix => Err(Error::Unsupported("unix sockets on this platform")),
            Network::UnixPacket => Err(Error::Unsupported("unixpacket (seqpacket) sockets")),
            _ => Err(Error::Unsupported("datagram network on a stream dial")),
        }
    };

    let bounded = async {
        match timeout {
            Some(d) if !d.is_zero() => match time::timeout(d, fut).await {
                Ok(r) => r,
                Err(_) => Err(Error::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("dial {remote} timed out"),
                ))),
            },
            _ => fut.await,
        }
    };

    match shutdown {
        Some(rx) => {
            let mut rx = rx.clone();
            tokio::select! {
                biased;
                _ = rx.wait_for(|stop| *stop) => Err(Error::Closed),
                r = bounded => r,
            }
        }
        None => bounded.await,
    }
}

/// Open a connected datagram socket to the endpoint's remote.
pub(crate) async fn dial_datagram(ep: &Endpoint) -> Result<UdpSocket> {
    let remote = ep.remote_or_err()?;
    match &ep.network {
        Network::Udp | Network::Udp4 | Network::Udp6 => {
            let target = resolve(remote).await?;
            let bind = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
            let sock = UdpSocket::bind(bind).await?;
            sock.connect(target).await?;
            Ok(sock)
        }
        Network::UnixGram => Err(Error::Unsupported("unixgram sockets")),
        Network::Ip | Network::Ip4 | Network::Ip6 | Network::IpProto(_) => {
            Err(Error::Unsupported("raw ip sockets"))
        }
        _ => Err(Error::Unsupported("stream network on a datagram dial")),
    }
}

/// Accept/read errors the transport layer may clear on its own; retried
/// with backoff instead of killing the loop.
pub(crate) fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Exponential retry delay: starts at 1% of the cap, doubles per
/// failure, saturates at the cap, resets on success.
pub(crate) struct Backoff {
    wait: Duration,
    max: Duration,
}

impl Backoff {
    pub(crate) fn new(max: Duration) -> Self {
        Self {
            wait: Duration::ZERO,
            max,
        }
    }

    /// True once at least one delay has been taken since the last reset.
    pub(crate) fn in_streak(&self) -> bool {
        !self.wait.is_zero()
    }

    pub(crate) fn reset(&mut self) {
        self.wait = Duration::ZERO;
    }

    pub(crate) async fn sleep(&mut self) {
        self.wait = if self.wait.is_zero() {
            self.max / 100
        } else {
            self.wait * 2
        };
        if self.wait > self.max {
            self.wait = self.max;
        }
        time::sleep(self.wait).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_parse_and_family() {
        assert_eq!("tcp".parse::<Network>().unwrap(), Network::Tcp);
        assert_eq!("udp6".parse::<Network>().unwrap(), Network::Udp6);
        assert_eq!(
            "ip:1".parse::<Network>().unwrap(),
            Network::IpProto("1".to_string())
        );
        assert_eq!(Network::Tcp4.family(), Family::Stream);
        assert_eq!(Network::UnixPacket.family(), Family::Stream);
        assert_eq!(Network::UnixGram.family(), Family::Datagram);
        assert_eq!(Network::Ip6.family(), Family::Datagram);
        assert!(matches!(
            "sctp".parse::<Network>(),
            Err(Error::UnknownNetwork(_))
        ));
        assert!(matches!(
            "ip:".parse::<Network>(),
            Err(Error::UnknownNetwork(_))
        ));
    }

    #[test]
    fn normalize_bind_addr_shorthand() {
        assert_eq!(normalize_bind_addr(":9000").as_ref(), "0.0.0.0:9000");
        assert_eq!(
            normalize_bind_addr("127.0.0.1:9000").as_ref(),
            "127.0.0.1:9000"
        );
    }

    #[test]
    fn endpoint_missing_addresses() {
        let ep = Endpoint::dial(Network::Tcp, "127.0.0.1:1");
        assert!(matches!(
            ep.local_or_err(),
            Err(Error::MissingAddress("local"))
        ));
        assert!(ep.remote_or_err().is_ok());
    }

    #[tokio::test]
    async fn backoff_doubles_and_caps() {
        let mut b = Backoff::new(Duration::from_millis(8));
        assert!(!b.in_streak());
        b.sleep().await;
        assert!(b.in_streak());
        b.sleep().await;
        b.sleep().await;
        b.sleep().await;
        b.sleep().await;
        b.sleep().await;
        b.sleep().await;
        // 0.08ms, 0.16, 0.32, 0.64, 1.28, 2.56, 5.12 -> next caps at 8ms.
        b.sleep().await;
        assert_eq!(b.wait, Duration::from_millis(8));
        b.reset();
        assert!(!b.in_streak());
    }

    #[tokio::test]
    async fn dial_stream_respects_cancellation() {
        let (tx, rx) = tokio::sync::watch::channel(false);
        tx.send(true).unwrap();
        // 192.0.2.0/24 is TEST-NET; the dial would hang long enough for
        // the cancelled root to win.
        let ep = Endpoint::dial(Network::Tcp, "192.0.2.1:9");
        let got = dial_stream(&ep, Some(Duration::from_secs(5)), Some(&rx)).await;
        assert!(matches!(got, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn stream_listener_round_trip() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let ep = Endpoint::listen(Network::Tcp, "127.0.0.1:0");
        let ln = bind_stream(&ep).await.unwrap();
        let addr = ln.local_socket_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut c = TcpStream::connect(addr).await.unwrap();
            c.write_all(b"ping").await.unwrap();
            let mut buf = [0u8; 4];
            c.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut conn = ln.accept().await.unwrap();
        assert!(!conn.peer_key().is_empty());
        let mut buf = [0u8; 4];
        tokio::io::AsyncReadExt::read_exact(&mut conn, &mut buf)
            .await
            .unwrap();
        assert_eq!(&buf, b"ping");
        tokio::io::AsyncWriteExt::write_all(&mut conn, b"pong")
            .await
            .unwrap();
        assert_eq!(&client.await.unwrap(), b"pong");
    }
}
