#![cfg(all(unix, feature = "cli"))]

use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};

fn synclink() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_synclink"));
    command
        .env_remove("SYNCLINK_HOST")
        .env_remove("SYNCLINK_PORT")
        .env_remove("SYNCLINK_TOKEN")
        .env_remove("SYNCLINK_BIND")
        .args(["--log-level", "error", "--format", "json"]);
    command
}

/// Spawn a controller command and return it with the port it bound.
fn spawn_controller(args: &[&str]) -> (Child, BufReader<ChildStdout>, u16) {
    let mut child = synclink()
        .args(args)
        .args(["--bind", "127.0.0.1:0"])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("controller should start");
    let mut stdout = BufReader::new(child.stdout.take().expect("piped stdout"));
    let mut line = String::new();
    stdout.read_line(&mut line).expect("listening line");
    let event: serde_json::Value = serde_json::from_str(&line).expect("listening line is json");
    assert_eq!(event["event"], "listening");
    let addr = event["addr"].as_str().expect("addr string");
    let port = addr
        .rsplit(':')
        .next()
        .and_then(|p| p.parse().ok())
        .expect("port in addr");
    (child, stdout, port)
}

fn spawn_device(port: u16, data_dir: &Path) -> Child {
    synclink()
        .args(["device", "--host", "127.0.0.1", "--port"])
        .arg(port.to_string())
        .args(["--device-id", "cli-device", "--no-reconnect", "--run-for", "15s"])
        .arg("--data-dir")
        .arg(data_dir)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("device should start")
}

fn stop(mut child: Child) {
    let _ = child.kill();
    let _ = child.wait();
}

#[test]
fn listen_prints_device_hello() {
    let data = tempfile::tempdir().unwrap();
    let (controller, mut stdout, port) = spawn_controller(&["listen"]);
    let device = spawn_device(port, data.path());

    let mut line = String::new();
    stdout.read_line(&mut line).expect("hello line");
    let event: serde_json::Value = serde_json::from_str(&line).expect("hello line is json");
    assert_eq!(event["event"], "message_received");
    assert_eq!(event["kind"], "hello");
    assert_eq!(event["device_id"], "cli-device");

    stop(device);
    stop(controller);
}

#[test]
fn send_waits_for_error_ack() {
    let data = tempfile::tempdir().unwrap();
    let (mut controller, mut stdout, port) =
        spawn_controller(&["send", "--json", r#"{"type":"stop_record"}"#, "--wait"]);
    let device = spawn_device(port, data.path());

    let status = controller.wait().expect("send should finish");
    let mut rest = String::new();
    std::io::Read::read_to_string(&mut stdout, &mut rest).unwrap();

    assert_eq!(status.code(), Some(1));
    assert!(rest.contains("Not currently recording"), "{rest}");

    stop(device);
}

#[test]
fn send_file_is_saved_to_out_dir() {
    let data = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let source = data.path().join("clip.bin");
    let payload: Vec<u8> = (0..150_000u32).map(|i| (i % 199) as u8).collect();
    std::fs::write(&source, &payload).unwrap();

    let json = serde_json::json!({
        "type": "send_file",
        "filepath": source.display().to_string(),
    })
    .to_string();
    let out_dir = out.path().display().to_string();
    let (mut controller, mut stdout, port) =
        spawn_controller(&["send", "--json", &json, "--wait", "--out-dir", &out_dir]);
    let device = spawn_device(port, data.path());

    let status = controller.wait().expect("send should finish");
    let mut rest = String::new();
    std::io::Read::read_to_string(&mut stdout, &mut rest).unwrap();

    assert!(status.success(), "{rest}");
    assert!(rest.contains("file_saved"), "{rest}");
    assert_eq!(std::fs::read(out.path().join("clip.bin")).unwrap(), payload);

    stop(device);
}

#[test]
fn send_rejects_non_command_json() {
    let output = synclink()
        .args(["send", "--bind", "127.0.0.1:0", "--json"])
        .arg(r#"{"type":"ack","cmd":"x","status":"ok"}"#)
        .output()
        .expect("send should run");
    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn version_reports_package_version() {
    let output = synclink().arg("version").output().expect("version should run");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(
        stdout.trim(),
        format!("synclink {}", env!("CARGO_PKG_VERSION"))
    );
}
