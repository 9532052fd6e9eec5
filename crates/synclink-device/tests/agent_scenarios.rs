use std::time::Duration;

use synclink_device::{
    AgentConfig, AssemblyStep, ChunkAssembler, Collaborators, DeviceAgent, DeviceError,
    DEFAULT_MAX_FILE_SIZE,
};
use synclink_peer::{ControllerListener, ControllerSession, LinkSettings, PeerError};
use synclink_proto::{Ack, Command, DeviceStatus, Message};

const WAIT: Duration = Duration::from_secs(5);

fn settings(listener: &ControllerListener) -> LinkSettings {
    let addr = listener.local_addr();
    LinkSettings {
        host: addr.ip().to_string(),
        port: addr.port(),
        device_id: "phone-test".to_string(),
        ..Default::default()
    }
}

async fn start_agent(listener: &ControllerListener, root: &std::path::Path) -> DeviceAgent {
    let config = AgentConfig {
        link: settings(listener),
        ..Default::default()
    };
    DeviceAgent::start(config, Collaborators::host(root))
        .await
        .expect("agent starts")
}

async fn next_ack(session: &mut ControllerSession) -> Ack {
    loop {
        match session.recv_timeout(WAIT).await.expect("message from device") {
            Message::Ack(ack) => return ack,
            Message::Status(_) => continue,
            other => panic!("unexpected message: {other:?}"),
        }
    }
}

async fn next_status(session: &mut ControllerSession) -> DeviceStatus {
    loop {
        match session.recv_timeout(WAIT).await.expect("message from device") {
            Message::Status(status) => return status,
            Message::Ack(_) => continue,
            other => panic!("unexpected message: {other:?}"),
        }
    }
}

fn start_record(session_id: &str) -> Message {
    Command::StartRecord {
        session_id: session_id.to_string(),
        record_video: true,
        record_thermal: false,
        record_shimmer: false,
    }
    .into()
}

#[tokio::test]
async fn recording_round_trip() {
    let root = tempfile::tempdir().unwrap();
    let listener = ControllerListener::bind("127.0.0.1:0").await.unwrap();
    let agent = start_agent(&listener, root.path()).await;
    let mut session = listener.accept().await.unwrap();
    assert_eq!(session.device().device_id, "phone-test");

    session.send(&start_record("abc123")).await.unwrap();
    assert_eq!(next_ack(&mut session).await, Ack::success("start_record"));
    assert!(next_status(&mut session).await.recording);
    assert!(agent.processor().snapshot().recording);

    session.send(&start_record("abc123")).await.unwrap();
    assert_eq!(
        next_ack(&mut session).await,
        Ack::error("start_record", "Already recording")
    );

    session.send(&Command::StopRecord.into()).await.unwrap();
    assert_eq!(next_ack(&mut session).await, Ack::success("stop_record"));
    assert!(!agent.processor().snapshot().recording);

    agent.shutdown().await;
}

#[tokio::test]
async fn stimulus_marker_lands_under_root() {
    let root = tempfile::tempdir().unwrap();
    let listener = ControllerListener::bind("127.0.0.1:0").await.unwrap();
    let agent = start_agent(&listener, root.path()).await;
    let mut session = listener.accept().await.unwrap();

    session
        .send(&Command::SetStimulusTime { time: 1_000 }.into())
        .await
        .unwrap();
    let ack = next_ack(&mut session).await;
    assert!(ack.is_ok());
    assert!(ack
        .message
        .unwrap()
        .starts_with("Stimulus time processed (offset: -"));

    let marker = root.path().join("sync_markers").join("stimulus_sync.jsonl");
    let contents = std::fs::read_to_string(marker).unwrap();
    assert_eq!(contents.lines().count(), 1);
    assert!(contents.contains("\"stimulus_time\":1000"));

    agent.shutdown().await;
}

#[tokio::test]
async fn send_file_streams_in_sequence() {
    let root = tempfile::tempdir().unwrap();
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let path = root.path().join("session.mp4");
    std::fs::write(&path, &payload).unwrap();

    let listener = ControllerListener::bind("127.0.0.1:0").await.unwrap();
    let agent = start_agent(&listener, root.path()).await;
    let mut session = listener.accept().await.unwrap();

    session
        .send(
            &Command::SendFile {
                filepath: path.display().to_string(),
                filetype: Some("video".to_string()),
            }
            .into(),
        )
        .await
        .unwrap();

    let mut assembler = ChunkAssembler::new(DEFAULT_MAX_FILE_SIZE);
    let mut received = Vec::new();
    loop {
        match session.recv_timeout(WAIT).await.unwrap() {
            Message::FileTransfer(transfer) => {
                if let synclink_proto::FileTransfer::FileChunk { data, .. } = &transfer {
                    received.extend_from_slice(data);
                }
                if matches!(
                    assembler.accept(&transfer).unwrap(),
                    AssemblyStep::Finished { .. }
                ) {
                    break;
                }
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
    assert_eq!(received, payload);

    let ack = next_ack(&mut session).await;
    assert_eq!(ack.cmd, "send_file");
    assert!(ack.is_ok());

    agent.shutdown().await;
}

#[tokio::test]
async fn reconnect_restores_recording_session() {
    let root = tempfile::tempdir().unwrap();
    let listener = ControllerListener::bind("127.0.0.1:0").await.unwrap();
    let agent = start_agent(&listener, root.path()).await;

    let mut session = listener.accept().await.unwrap();
    session.send(&start_record("sess-7")).await.unwrap();
    assert!(next_ack(&mut session).await.is_ok());
    next_status(&mut session).await;
    session.close().await.unwrap();

    let mut session = tokio::time::timeout(WAIT, listener.accept())
        .await
        .expect("device reconnects")
        .unwrap();
    assert!(next_status(&mut session).await.recording);
    assert_eq!(
        agent.processor().snapshot().session_id.as_deref(),
        Some("sess-7")
    );

    session.send(&Command::StopRecord.into()).await.unwrap();
    assert_eq!(next_ack(&mut session).await, Ack::success("stop_record"));

    let stats = agent.manager().stats();
    assert_eq!(stats.connection_losses, 1);
    assert_eq!(stats.successful_recoveries, 1);

    agent.shutdown().await;
}

#[tokio::test]
async fn unreachable_controller_without_reconnect_fails_start() {
    let listener = ControllerListener::bind("127.0.0.1:0").await.unwrap();
    let mut link = settings(&listener);
    link.legacy_port = link.port;
    link.auto_reconnect = false;
    link.connect_timeout_ms = 1_000;
    drop(listener);

    let root = tempfile::tempdir().unwrap();
    let config = AgentConfig {
        link,
        ..Default::default()
    };
    let result = DeviceAgent::start(config, Collaborators::host(root.path())).await;
    assert!(matches!(result, Err(DeviceError::Peer(_))));
}

#[tokio::test]
async fn tls_link_never_talks_to_a_plaintext_controller() {
    let listener = ControllerListener::bind("127.0.0.1:0").await.unwrap();
    let mut link = settings(&listener);
    link.use_tls = true;
    link.tls_server_name = Some("localhost".to_string());
    link.legacy_port = link.port;
    link.auto_reconnect = false;
    link.connect_timeout_ms = 1_000;
    let controller = tokio::spawn(async move { listener.accept().await.is_ok() });

    let root = tempfile::tempdir().unwrap();
    let config = AgentConfig {
        link,
        ..Default::default()
    };
    let result = DeviceAgent::start(config, Collaborators::host(root.path())).await;
    assert!(
        matches!(
            result,
            Err(DeviceError::Peer(PeerError::Tls(_) | PeerError::Timeout(_)))
        ),
        "{:?}",
        result.err()
    );
    // the controller never sees a hello
    let accepted = tokio::time::timeout(WAIT, controller).await;
    assert!(!matches!(accepted, Ok(Ok(true))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn controller_hanging_up_at_once_never_leaves_a_dead_link() {
    let root = tempfile::tempdir().unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            drop(stream);
        }
    });

    for _ in 0..20 {
        let link = LinkSettings {
            host: addr.ip().to_string(),
            port: addr.port(),
            legacy_port: addr.port(),
            device_id: "phone-test".to_string(),
            auto_reconnect: false,
            ..Default::default()
        };
        let config = AgentConfig {
            link,
            ..Default::default()
        };
        // closing before the link is adopted fails start outright
        let Ok(agent) = DeviceAgent::start(config, Collaborators::host(root.path())).await else {
            continue;
        };
        let mut status = agent.status();
        tokio::time::timeout(WAIT, status.wait_for(|s| !s.connected))
            .await
            .expect("loss is noticed")
            .expect("status channel open");
        assert_eq!(agent.manager().current_connection_id(), None);
        agent.shutdown().await;
    }
}
