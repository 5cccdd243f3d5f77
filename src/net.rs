//! Connection setup for the control and data channels
//!
//! Resolves the server honouring the address family preference, optionally
//! binds a local address, and layers TLS on top when requested.

use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::tls::{MaybeTlsStream, connect_tls};

/// Address family preference for outgoing connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressFamily {
    V4Only,
    V6Only,
    /// Whatever the resolver returns first
    #[default]
    DualStack,
}

impl std::str::FromStr for AddressFamily {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "4" | "v4" | "ipv4" | "v4only" | "ipv4-only" => Ok(Self::V4Only),
            "6" | "v6" | "ipv6" | "v6only" | "ipv6-only" => Ok(Self::V6Only),
            "dual" | "dualstack" | "dual-stack" | "both" => Ok(Self::DualStack),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::V4Only => write!(f, "IPv4"),
            Self::V6Only => write!(f, "IPv6"),
            Self::DualStack => write!(f, "dual-stack"),
        }
    }
}

/// Resolve a hostname to addresses, filtered by address family preference
pub fn resolve_host(host: &str, port: u16, family: AddressFamily) -> io::Result<Vec<SocketAddr>> {
    // Zone IDs (fe80::1%eth0) are not understood by the resolver
    let host_for_lookup = host.split('%').next().unwrap_or(host);

    let addrs: Vec<SocketAddr> = (host_for_lookup, port).to_socket_addrs()?.collect();
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        ));
    }

    let filtered: Vec<SocketAddr> = match family {
        AddressFamily::V4Only => addrs.into_iter().filter(|a| a.is_ipv4()).collect(),
        AddressFamily::V6Only => addrs.into_iter().filter(|a| a.is_ipv6()).collect(),
        AddressFamily::DualStack => addrs,
    };

    if filtered.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("No {} addresses found for host: {}", family, host),
        ));
    }

    Ok(filtered)
}

/// Connect to a host, trying each resolved address in turn
pub async fn connect_tcp(
    host: &str,
    port: u16,
    family: AddressFamily,
    bind_ip: Option<IpAddr>,
) -> io::Result<(TcpStream, SocketAddr)> {
    let addrs = resolve_host(host, port, family)?;

    let mut last_err = None;

    for addr in addrs {
        debug!("Trying to connect to {}", addr);
        match connect_tcp_with_bind(addr, bind_ip).await {
            Ok(stream) => {
                debug!("Connected to {}", addr);
                return Ok((stream, normalize_addr(addr)));
            }
            Err(e) => {
                debug!("Failed to connect to {}: {}", addr, e);
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotConnected, "No addresses to connect to")
    }))
}

/// Connect from an optional local address. The local port is always
/// ephemeral so the control and data connections can share one bind IP.
pub async fn connect_tcp_with_bind(
    remote: SocketAddr,
    bind_ip: Option<IpAddr>,
) -> io::Result<TcpStream> {
    let Some(local_ip) = bind_ip else {
        return TcpStream::connect(remote).await;
    };
    let local = SocketAddr::new(local_ip, 0);

    let domain = if remote.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.bind(&SockAddr::from(local))?;

    match socket.connect(&SockAddr::from(remote)) {
        Ok(()) => {}
        #[cfg(unix)]
        Err(e)
            if e.raw_os_error() == Some(libc::EINPROGRESS)
                || e.raw_os_error() == Some(libc::EALREADY)
                || e.raw_os_error() == Some(libc::EWOULDBLOCK) => {}
        #[cfg(windows)]
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }

    let std_stream: std::net::TcpStream = socket.into();
    let stream = TcpStream::from_std(std_stream)?;

    // Wait for the non-blocking connect to finish
    stream.writable().await?;
    if let Some(e) = stream.take_error()? {
        return Err(e);
    }

    debug!("Connected to {} from {}", remote, local_ip);
    Ok(stream)
}

/// Convert IPv4-mapped IPv6 to IPv4 if applicable
pub fn normalize_addr(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), v6.port()),
            None => addr,
        },
        _ => addr,
    }
}

/// Opens connections to one server: the control port once per attempt and
/// each data port the server hands out.
#[derive(Clone)]
pub struct Dialer {
    pub host: String,
    pub family: AddressFamily,
    pub bind_ip: Option<IpAddr>,
    pub tls: Option<TlsConnector>,
    pub connect_timeout: Duration,
}

impl Dialer {
    pub async fn dial(&self, port: u16) -> anyhow::Result<(MaybeTlsStream, SocketAddr)> {
        let (stream, addr) = tokio::time::timeout(
            self.connect_timeout,
            connect_tcp(&self.host, port, self.family, self.bind_ip),
        )
        .await
        .map_err(|_| {
            anyhow::anyhow!(
                "Connection to {}:{} timed out after {:?}",
                self.host,
                port,
                self.connect_timeout
            )
        })??;

        let stream = connect_tls(stream, &self.tls, &self.host).await?;
        info!(
            "Connected to {}{}",
            addr,
            if stream.is_tls() { " (TLS)" } else { "" }
        );
        Ok((stream, addr))
    }

    /// Connect to an already resolved address, such as the control
    /// connection's peer. TLS still verifies against `host`.
    pub async fn dial_addr(&self, remote: SocketAddr) -> anyhow::Result<MaybeTlsStream> {
        let stream = tokio::time::timeout(
            self.connect_timeout,
            connect_tcp_with_bind(remote, self.bind_ip),
        )
        .await
        .map_err(|_| {
            anyhow::anyhow!(
                "Connection to {} timed out after {:?}",
                remote,
                self.connect_timeout
            )
        })??;

        let stream = connect_tls(stream, &self.tls, &self.host).await?;
        debug!(
            "Connected to {}{}",
            remote,
            if stream.is_tls() { " (TLS)" } else { "" }
        );
        Ok(stream)
    }
}
