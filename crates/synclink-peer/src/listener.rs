use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use synclink_frame::{FrameConfig, FrameReader, FrameWriter};
use synclink_proto::{Auth, Hello, Message};
use synclink_transport::{Endpoint, TcpLinkListener};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, info};

use crate::error::Result;
use crate::handshake::{
    auth_response, handshake_controller, recv_message, send_message, ControllerHandshakeConfig,
    HandshakeResult,
};

/// Accepts device connections on the controller side.
pub struct ControllerListener {
    listener: TcpLinkListener,
    handshake_config: ControllerHandshakeConfig,
    frame_config: FrameConfig,
    next_session_id: AtomicU64,
}

impl ControllerListener {
    /// Bind to `addr` (`host:port`, port 0 for ephemeral).
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpLinkListener::bind(addr).await?;
        Ok(Self {
            listener,
            handshake_config: ControllerHandshakeConfig::default(),
            frame_config: FrameConfig::default(),
            next_session_id: AtomicU64::new(1),
        })
    }

    /// Override handshake config.
    pub fn with_handshake_config(mut self, config: ControllerHandshakeConfig) -> Self {
        self.handshake_config = config;
        self
    }

    pub fn with_frame_config(mut self, config: FrameConfig) -> Self {
        self.frame_config = config;
        self
    }

    /// Accept the next device and run the controller handshake.
    pub async fn accept(&self) -> Result<ControllerSession> {
        let (stream, peer_addr) = self.listener.accept().await?;
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::with_config(read_half, self.frame_config.clone());
        let mut writer = FrameWriter::with_config(write_half, self.frame_config.clone());

        let handshake =
            handshake_controller(&mut reader, &mut writer, &self.handshake_config).await?;
        info!(
            session = id,
            %peer_addr,
            device_id = %handshake.hello.device_id,
            authenticated = handshake.authenticated,
            "device connected"
        );

        Ok(ControllerSession {
            id,
            peer_addr,
            handshake,
            reader,
            writer,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Endpoint devices should dial to reach this listener.
    pub fn endpoint(&self) -> Endpoint {
        self.listener.endpoint()
    }
}

/// One accepted device connection.
pub struct ControllerSession {
    id: u64,
    peer_addr: SocketAddr,
    handshake: HandshakeResult,
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
}

impl ControllerSession {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// The device's `hello`.
    pub fn device(&self) -> &Hello {
        &self.handshake.hello
    }

    pub fn is_authenticated(&self) -> bool {
        self.handshake.authenticated
    }

    pub async fn send(&mut self, message: &Message) -> Result<()> {
        send_message(&mut self.writer, message).await?;
        Ok(())
    }

    /// Next message from the device.
    ///
    /// An `authenticate` arriving when the listener expects no token is
    /// answered with a successful `auth_response` and not returned.
    pub async fn recv(&mut self) -> Result<Message> {
        loop {
            let frame = self.reader.read_frame().await?;
            let message = synclink_proto::decode(&frame)?;
            if let Message::Auth(Auth::Authenticate { .. }) = &message {
                debug!(session = self.id, "accepting unsolicited authenticate");
                send_message(&mut self.writer, &auth_response(true, None)).await?;
                continue;
            }
            return Ok(message);
        }
    }

    /// [`recv`](Self::recv) bounded by `timeout`.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Message> {
        loop {
            let message = recv_message(&mut self.reader, timeout).await?;
            if let Message::Auth(Auth::Authenticate { .. }) = &message {
                debug!(session = self.id, "accepting unsolicited authenticate");
                send_message(&mut self.writer, &auth_response(true, None)).await?;
                continue;
            }
            return Ok(message);
        }
    }

    /// Flush and close the write half.
    pub async fn close(mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
