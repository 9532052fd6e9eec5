use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::endpoint::Endpoint;
use crate::error::{Result, TransportError};

/// Default time allowed for a TCP connect to complete.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Dial a controller endpoint.
///
/// Nagle is disabled on the returned stream: the control link carries small
/// command frames where latency matters more than packet count.
pub async fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<TcpStream> {
    let addr = endpoint.authority();
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr.as_str())).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => return Err(TransportError::Connect { addr, source }),
        Err(_) => return Err(TransportError::ConnectTimeout { addr, timeout }),
    };
    stream.set_nodelay(true)?;
    debug!(%endpoint, "connected");
    Ok(stream)
}

/// Open and immediately drop a connection, returning how long the connect took.
///
/// Used as a latency ping that is independent of the data channel.
pub async fn ping(endpoint: &Endpoint, timeout: Duration) -> Result<Duration> {
    let started = Instant::now();
    let stream = connect(endpoint, timeout).await?;
    let elapsed = started.elapsed();
    drop(stream);
    Ok(elapsed)
}

/// Controller-side TCP listener.
pub struct TcpLinkListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpLinkListener {
    /// Bind to `addr` (for example `0.0.0.0:9000` or `127.0.0.1:0`).
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "listening for devices");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Accept the next device connection.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.listener.accept().await.map_err(TransportError::Accept)?;
        stream.set_nodelay(true)?;
        debug!(%peer, "accepted connection");
        Ok((stream, peer))
    }

    /// The address actually bound (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Endpoint a device on this host would dial.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.local_addr.ip().to_string(), self.local_addr.port())
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        "tcp"
    }
}
