//! One framed, optionally authenticated connection to the controller.
//!
//! Each connection runs a reader task and a writer task fed by a bounded
//! outbound queue, plus an auth-deadline task when a token is configured.
//! All three share one cancellation token. Whatever ends the connection
//! first (I/O error, protocol violation, auth failure, local disconnect)
//! produces exactly one [`ChannelEvent::Disconnected`].

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use synclink_frame::{FrameConfig, FrameError, FrameReader, FrameWriter};
use synclink_proto::{Auth, Message};
use synclink_transport::{Endpoint, DEFAULT_CONNECT_TIMEOUT};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{PeerError, Result};
use crate::handshake::{send_message, CapabilityProfile, HandshakeConfig};
use crate::quality::QualityMonitor;
use crate::sink::{BoxFuture, MessageSink};
use crate::tls::LinkTls;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Default depth of the per-connection outbound queue.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 64;

/// Settings for opening a connection.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub endpoint: Endpoint,
    pub connect_timeout: Duration,
    pub handshake: HandshakeConfig,
    pub frame: FrameConfig,
    pub outbound_capacity: usize,
    /// Wrap the TCP stream in TLS before `hello`.
    pub tls: Option<LinkTls>,
}

impl ChannelConfig {
    pub fn new(endpoint: Endpoint, handshake: HandshakeConfig) -> Self {
        Self {
            endpoint,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake,
            frame: FrameConfig::default(),
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            tls: None,
        }
    }
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Authenticating,
    Authenticated,
}

impl ChannelState {
    /// True once non-auth messages may be sent.
    pub fn is_ready(self) -> bool {
        matches!(self, ChannelState::Connected | ChannelState::Authenticated)
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Closed by this side.
    Local,
    /// The controller closed the stream.
    PeerClosed,
    Transport(String),
    Protocol(String),
    AuthRejected(String),
    AuthTimeout,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Local => f.write_str("closed locally"),
            DisconnectReason::PeerClosed => f.write_str("closed by peer"),
            DisconnectReason::Transport(detail) => write!(f, "transport error: {detail}"),
            DisconnectReason::Protocol(detail) => write!(f, "protocol error: {detail}"),
            DisconnectReason::AuthRejected(detail) => write!(f, "authentication rejected: {detail}"),
            DisconnectReason::AuthTimeout => f.write_str("authentication timed out"),
        }
    }
}

/// Link-wide notifications, tagged with the connection they came from.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Message {
        connection_id: u64,
        message: Message,
    },
    Disconnected {
        connection_id: u64,
        reason: DisconnectReason,
    },
}

impl ChannelEvent {
    pub fn connection_id(&self) -> u64 {
        match self {
            ChannelEvent::Message { connection_id, .. }
            | ChannelEvent::Disconnected { connection_id, .. } => *connection_id,
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<ChannelEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ChannelEvent>;

/// Create the link-wide event queue. Reception never blocks on it.
pub fn event_queue() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

struct Shared {
    id: u64,
    state: watch::Sender<ChannelState>,
    cancel: CancellationToken,
    events: EventSender,
    closed: AtomicBool,
}

impl Shared {
    fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    fn close(&self, reason: DisconnectReason) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.send_replace(ChannelState::Disconnected);
        self.cancel.cancel();
        match &reason {
            DisconnectReason::Local => debug!(connection_id = self.id, "connection closed"),
            other => warn!(connection_id = self.id, reason = %other, "connection lost"),
        }
        let _ = self.events.send(ChannelEvent::Disconnected {
            connection_id: self.id,
            reason,
        });
    }

    fn on_auth_response(&self, success: bool, message: Option<String>) {
        if self.state() != ChannelState::Authenticating {
            debug!(connection_id = self.id, "ignoring unsolicited auth_response");
            return;
        }
        if success {
            self.state.send_replace(ChannelState::Authenticated);
            info!(connection_id = self.id, "authenticated");
        } else {
            let detail = message.unwrap_or_else(|| "rejected by controller".to_string());
            self.close(DisconnectReason::AuthRejected(detail));
        }
    }
}

/// Cloneable sending handle for one live connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Vec<u8>>,
    max_payload: usize,
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.shared.state.subscribe()
    }

    pub fn is_open(&self) -> bool {
        !self.shared.closed.load(Ordering::SeqCst)
    }

    /// Queue a message for the writer task.
    ///
    /// Only `authenticate`/`auth_response` may be sent while authentication
    /// is pending.
    pub async fn send(&self, message: &Message) -> Result<()> {
        match self.state() {
            ChannelState::Disconnected => {
                return Err(PeerError::Disconnected(format!(
                    "connection {} is closed",
                    self.id()
                )))
            }
            ChannelState::Connecting | ChannelState::Authenticating if !message.is_auth() => {
                return Err(PeerError::NotAuthenticated)
            }
            _ => {}
        }

        let payload = synclink_proto::encode(message)?;
        if payload.len() > self.max_payload {
            return Err(PeerError::Frame(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_payload,
            }));
        }

        self.outbound.send(payload).await.map_err(|_| {
            PeerError::Disconnected(format!("connection {} is closed", self.shared.id))
        })
    }

    /// Close the connection. Idempotent.
    pub fn disconnect(&self) {
        self.shared.close(DisconnectReason::Local);
    }

    /// Resolves once the connection has ended for any reason.
    pub async fn closed(&self) {
        self.shared.cancel.cancelled().await
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

impl MessageSink for ConnectionHandle {
    fn send(&self, message: Message) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { ConnectionHandle::send(self, &message).await })
    }
}

/// Entry points for building connections.
pub struct Connection;

impl Connection {
    /// Dial the configured endpoint, run the TLS handshake when configured,
    /// then the link handshake.
    pub async fn open(
        config: &ChannelConfig,
        profile: CapabilityProfile,
        events: EventSender,
        quality: Option<QualityMonitor>,
    ) -> Result<ConnectionHandle> {
        let stream = synclink_transport::connect(&config.endpoint, config.connect_timeout).await?;
        match &config.tls {
            Some(tls) => {
                let stream = tls.connect(stream, config.connect_timeout).await?;
                Self::establish(stream, config, profile, events, quality).await
            }
            None => Self::establish(stream, config, profile, events, quality).await,
        }
    }

    /// Run the device side of the link over an already-open byte stream.
    ///
    /// `hello` is always the first frame written. With a token configured,
    /// `authenticate` follows and the connection stays in
    /// [`ChannelState::Authenticating`] until the controller answers.
    pub async fn establish<S>(
        stream: S,
        config: &ChannelConfig,
        profile: CapabilityProfile,
        events: EventSender,
        quality: Option<QualityMonitor>,
    ) -> Result<ConnectionHandle>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let hello = config.handshake.hello(profile)?;
        let authenticate = config.handshake.authenticate()?;
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);

        let (read_half, write_half) = tokio::io::split(stream);
        let reader = FrameReader::with_config(read_half, config.frame.clone());
        let mut writer = FrameWriter::with_config(write_half, config.frame.clone());

        let (state, _) = watch::channel(ChannelState::Connecting);

        send_message(&mut writer, &Message::Hello(hello)).await?;
        state.send_replace(ChannelState::Connected);

        let requires_auth = authenticate.is_some();
        if let Some(auth) = authenticate {
            send_message(&mut writer, &auth).await?;
            state.send_replace(ChannelState::Authenticating);
        }

        info!(
            connection_id = id,
            endpoint = %config.endpoint,
            ?profile,
            requires_auth,
            tls = config.tls.is_some(),
            "link established"
        );

        let shared = Arc::new(Shared {
            id,
            state,
            cancel: CancellationToken::new(),
            events,
            closed: AtomicBool::new(false),
        });
        let (outbound, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));

        tokio::spawn(read_loop(reader, Arc::clone(&shared)));
        tokio::spawn(write_loop(writer, outbound_rx, Arc::clone(&shared), quality));
        if requires_auth {
            tokio::spawn(auth_deadline(
                Arc::clone(&shared),
                config.handshake.auth_timeout,
            ));
        }

        Ok(ConnectionHandle {
            shared,
            outbound,
            max_payload: config.frame.max_payload_size,
        })
    }
}

fn classify(err: &FrameError) -> DisconnectReason {
    match err {
        FrameError::ConnectionClosed => DisconnectReason::PeerClosed,
        err if err.is_protocol_violation() => DisconnectReason::Protocol(err.to_string()),
        err => DisconnectReason::Transport(err.to_string()),
    }
}

async fn read_loop<R>(mut reader: FrameReader<R>, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            frame = reader.read_frame() => frame,
        };

        let payload = match frame {
            Ok(payload) => payload,
            Err(err) => {
                shared.close(classify(&err));
                break;
            }
        };

        let message = match synclink_proto::decode(&payload) {
            Ok(message) => message,
            Err(err) => {
                shared.close(DisconnectReason::Protocol(err.to_string()));
                break;
            }
        };
        trace!(connection_id = shared.id, kind = %message.kind(), "message received");

        match message {
            Message::Auth(Auth::AuthResponse { success, message }) => {
                shared.on_auth_response(success, message);
            }
            message if shared.state() == ChannelState::Authenticating => {
                warn!(
                    connection_id = shared.id,
                    kind = %message.kind(),
                    "dropping message received before authentication"
                );
            }
            message => {
                let event = ChannelEvent::Message {
                    connection_id: shared.id,
                    message,
                };
                if shared.events.send(event).is_err() {
                    shared.close(DisconnectReason::Local);
                    break;
                }
            }
        }
    }
}

async fn write_loop<W>(
    mut writer: FrameWriter<W>,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    shared: Arc<Shared>,
    quality: Option<QualityMonitor>,
) where
    W: AsyncWrite + Unpin,
{
    let mut last = Instant::now();
    loop {
        let payload = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            next = outbound.recv() => match next {
                Some(payload) => payload,
                None => {
                    shared.close(DisconnectReason::Local);
                    break;
                }
            },
        };

        let result = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            result = writer.send(&payload) => result,
        };

        match result {
            Ok(written) => {
                let now = Instant::now();
                if let Some(quality) = &quality {
                    quality.record_transmission(written, now.duration_since(last));
                }
                last = now;
            }
            Err(err) => {
                shared.close(classify(&err));
                break;
            }
        }
    }
}

async fn auth_deadline(shared: Arc<Shared>, timeout: Duration) {
    let mut state = shared.state.subscribe();
    let settled = async move {
        loop {
            let current = *state.borrow_and_update();
            if current != ChannelState::Authenticating || state.changed().await.is_err() {
                break;
            }
        }
    };
    tokio::select! {
        _ = shared.cancel.cancelled() => {}
        _ = settled => {}
        _ = tokio::time::sleep(timeout) => {
            if shared.state() == ChannelState::Authenticating {
                shared.close(DisconnectReason::AuthTimeout);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use synclink_proto::{Ack, AuthToken, Command};
    use synclink_transport::TcpLinkListener;
    use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

    use super::*;
    use crate::handshake::recv_message;

    struct Controller {
        reader: FrameReader<ReadHalf<DuplexStream>>,
        writer: FrameWriter<WriteHalf<DuplexStream>>,
    }

    impl Controller {
        async fn recv(&mut self) -> Message {
            recv_message(&mut self.reader, Duration::from_secs(5))
                .await
                .unwrap()
        }

        async fn send(&mut self, message: Message) {
            send_message(&mut self.writer, &message).await.unwrap();
        }
    }

    fn config(token: Option<&str>) -> ChannelConfig {
        let mut handshake = HandshakeConfig::new("phone-1");
        handshake.auth_token = token.map(AuthToken::new);
        ChannelConfig::new(Endpoint::new("127.0.0.1", 9000), handshake)
    }

    async fn connect(token: Option<&str>) -> (ConnectionHandle, EventReceiver, Controller) {
        let (device, controller) = tokio::io::duplex(256 * 1024);
        let (events, rx) = event_queue();
        let handle = Connection::establish(
            device,
            &config(token),
            CapabilityProfile::Full,
            events,
            None,
        )
        .await
        .unwrap();
        let (reader, writer) = tokio::io::split(controller);
        let controller = Controller {
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
        };
        (handle, rx, controller)
    }

    #[tokio::test]
    async fn hello_is_the_first_frame() {
        let (handle, _rx, mut controller) = connect(None).await;
        assert_eq!(handle.state(), ChannelState::Connected);

        match controller.recv().await {
            Message::Hello(hello) => {
                assert_eq!(hello.device_id, "phone-1");
                assert_eq!(hello.capabilities, vec!["rgb_video", "thermal", "shimmer"]);
            }
            other => panic!("expected hello, got {other:?}"),
        }

        handle.send(&Command::StopRecord.into()).await.unwrap();
        assert_eq!(controller.recv().await, Message::from(Command::StopRecord));
    }

    #[tokio::test]
    async fn auth_gate_holds_until_success() {
        let (handle, _rx, mut controller) = connect(Some("token-1")).await;
        assert_eq!(handle.state(), ChannelState::Authenticating);

        assert!(matches!(controller.recv().await, Message::Hello(_)));
        match controller.recv().await {
            Message::Auth(Auth::Authenticate { token }) => assert_eq!(token.expose(), "token-1"),
            other => panic!("expected authenticate, got {other:?}"),
        }

        let ack: Message = Ack::ok("stop_record", "done").into();
        assert!(matches!(
            handle.send(&ack).await,
            Err(PeerError::NotAuthenticated)
        ));

        controller
            .send(Message::Auth(Auth::AuthResponse {
                success: true,
                message: None,
            }))
            .await;
        handle
            .watch_state()
            .wait_for(|s| *s == ChannelState::Authenticated)
            .await
            .unwrap();

        handle.send(&ack).await.unwrap();
        assert_eq!(controller.recv().await, ack);
    }

    #[tokio::test]
    async fn auth_rejection_closes_the_connection() {
        let (handle, mut rx, mut controller) = connect(Some("bad")).await;
        controller.recv().await;
        controller.recv().await;
        controller
            .send(Message::Auth(Auth::AuthResponse {
                success: false,
                message: Some("invalid token".to_string()),
            }))
            .await;

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            ChannelEvent::Disconnected {
                connection_id: handle.id(),
                reason: DisconnectReason::AuthRejected("invalid token".to_string()),
            }
        );
        assert_eq!(handle.state(), ChannelState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_timeout_closes_the_connection() {
        let (handle, mut rx, _controller) = connect(Some("token")).await;
        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            ChannelEvent::Disconnected {
                connection_id: handle.id(),
                reason: DisconnectReason::AuthTimeout,
            }
        );
        assert!(!handle.is_open());
    }

    #[tokio::test]
    async fn inbound_messages_arrive_in_order() {
        let (handle, mut rx, mut controller) = connect(None).await;
        let commands: Vec<Message> = vec![
            Command::StartRecord {
                session_id: "s1".to_string(),
                record_video: true,
                record_thermal: true,
                record_shimmer: false,
            }
            .into(),
            Command::SetStimulusTime { time: 42 }.into(),
            Command::StopRecord.into(),
        ];
        for command in &commands {
            controller.send(command.clone()).await;
        }

        for expected in commands {
            assert_eq!(
                rx.recv().await.unwrap(),
                ChannelEvent::Message {
                    connection_id: handle.id(),
                    message: expected,
                }
            );
        }
    }

    #[tokio::test]
    async fn protocol_violation_yields_exactly_one_disconnect() {
        let (handle, mut rx, mut controller) = connect(None).await;
        controller
            .writer
            .get_mut()
            .write_all(&[0, 0, 0, 0])
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            ChannelEvent::Disconnected {
                reason: DisconnectReason::Protocol(_),
                ..
            } => {}
            other => panic!("unexpected event: {other:?}"),
        }

        handle.disconnect();
        handle.disconnect();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn undecodable_payload_is_a_protocol_error() {
        let (_handle, mut rx, mut controller) = connect(None).await;
        let mut frame = BytesMut::new();
        synclink_frame::encode_frame(br#"{"type":"warp_drive"}"#, 1024, &mut frame).unwrap();
        controller.writer.get_mut().write_all(&frame).await.unwrap();

        assert!(matches!(
            rx.recv().await.unwrap(),
            ChannelEvent::Disconnected {
                reason: DisconnectReason::Protocol(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn peer_close_is_reported_and_sends_fail() {
        let (handle, mut rx, controller) = connect(None).await;
        drop(controller);

        assert!(matches!(
            rx.recv().await.unwrap(),
            ChannelEvent::Disconnected {
                reason: DisconnectReason::PeerClosed,
                ..
            }
        ));
        handle.closed().await;
        assert!(matches!(
            handle.send(&Command::StopRecord.into()).await,
            Err(PeerError::Disconnected(_))
        ));
    }

    #[tokio::test]
    async fn local_disconnect_reports_local_reason() {
        let (handle, mut rx, _controller) = connect(None).await;
        handle.disconnect();
        assert_eq!(
            rx.recv().await.unwrap(),
            ChannelEvent::Disconnected {
                connection_id: handle.id(),
                reason: DisconnectReason::Local,
            }
        );
    }

    #[tokio::test]
    async fn oversized_outbound_message_is_refused_without_closing() {
        let (device, _controller) = tokio::io::duplex(64 * 1024);
        let (events, _rx) = event_queue();
        let mut config = config(None);
        config.frame.max_payload_size = 256;
        let handle = Connection::establish(device, &config, CapabilityProfile::Full, events, None)
            .await
            .unwrap();

        let big: Message = Ack::ok("send_file", "x".repeat(1000)).into();
        assert!(matches!(
            handle.send(&big).await,
            Err(PeerError::Frame(FrameError::PayloadTooLarge { .. }))
        ));
        assert!(handle.is_open());
    }

    #[tokio::test]
    async fn concurrent_senders_never_interleave_frames() {
        let (handle, _rx, mut controller) = connect(None).await;
        controller.recv().await;

        let mut tasks = Vec::new();
        for task in 0..8 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                for n in 0..25 {
                    let msg: Message = Ack::ok(format!("task-{task}"), n.to_string()).into();
                    handle.send(&msg).await.unwrap();
                }
            }));
        }

        let mut per_task = [0usize; 8];
        for _ in 0..200 {
            match controller.recv().await {
                Message::Ack(ack) => {
                    let task: usize = ack.cmd.trim_start_matches("task-").parse().unwrap();
                    let n: usize = ack.message.unwrap().parse().unwrap();
                    assert_eq!(n, per_task[task], "per-sender order preserved");
                    per_task[task] += 1;
                }
                other => panic!("unexpected message: {other:?}"),
            }
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(per_task.iter().all(|count| *count == 25));
    }

    #[tokio::test]
    async fn writer_feeds_quality_monitor() {
        let (device, controller) = tokio::io::duplex(64 * 1024);
        let (events, _rx) = event_queue();
        let quality = QualityMonitor::new(Default::default());
        let handle = Connection::establish(
            device,
            &config(None),
            CapabilityProfile::Full,
            events,
            Some(quality.clone()),
        )
        .await
        .unwrap();

        let (reader, _writer) = tokio::io::split(controller);
        let mut reader = FrameReader::new(reader);
        reader.read_frame().await.unwrap();

        let mut score = quality.subscribe();
        tokio::time::sleep(Duration::from_millis(5)).await;
        handle.send(&Command::StopRecord.into()).await.unwrap();
        reader.read_frame().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), score.changed())
            .await
            .unwrap()
            .unwrap();

        // a tiny frame after a pause is a slow sample, below the default
        assert!(quality.sample().bandwidth_kbps < 1000.0);
    }

    #[tokio::test]
    async fn open_dials_a_tcp_controller() {
        let listener = TcpLinkListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = config(None);
        config.endpoint = listener.endpoint();

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, _writer) = tokio::io::split(stream);
            let mut reader = FrameReader::new(reader);
            recv_message(&mut reader, Duration::from_secs(5)).await.unwrap()
        });

        let (events, _rx) = event_queue();
        let handle = Connection::open(&config, CapabilityProfile::Reduced, events, None)
            .await
            .unwrap();

        match accept.await.unwrap() {
            Message::Hello(hello) => assert_eq!(hello.capabilities, vec!["rgb_video", "thermal"]),
            other => panic!("expected hello, got {other:?}"),
        }
        handle.disconnect();
    }

    #[test]
    fn ready_states() {
        assert!(ChannelState::Connected.is_ready());
        assert!(ChannelState::Authenticated.is_ready());
        assert!(!ChannelState::Authenticating.is_ready());
        assert!(!ChannelState::Disconnected.is_ready());
    }
}
