use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use synclink_device::{AssemblyStep, ChunkAssembler, DEFAULT_MAX_FILE_SIZE};
use synclink_peer::ControllerSession;
use synclink_proto::{Command, FileTransfer, Message};
use tracing::{info, warn};

use crate::cmd::{bind_controller, parse_duration, SendArgs};
use crate::exit::{
    decode_error, io_error, peer_error, CliError, CliResult, DATA_INVALID, FAILURE, SUCCESS, USAGE,
};
use crate::output::{print_listening, print_message, print_saved_file, OutputFormat};

pub async fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let command = parse_command(&args.json)?;
    let wait_timeout = parse_duration(&args.wait_timeout)?;

    let listener = bind_controller(&args.bind, args.token.as_deref()).await?;
    print_listening(listener.local_addr(), format);
    let mut session = listener
        .accept()
        .await
        .map_err(|err| peer_error("accept failed", err))?;
    let device_id = session.device().device_id.clone();
    info!(%device_id, cmd = command.name(), "sending command");

    session
        .send(&command.clone().into())
        .await
        .map_err(|err| peer_error("send failed", err))?;

    if !args.wait {
        return Ok(SUCCESS);
    }

    let mut files = FileReceiver::new(args.out_dir);
    loop {
        let message = session
            .recv_timeout(wait_timeout)
            .await
            .map_err(|err| peer_error("waiting for ack failed", err))?;

        match &message {
            Message::Ack(ack) if ack.cmd == command.name() => {
                print_message(&message, &device_id, format);
                return Ok(if ack.is_ok() { SUCCESS } else { FAILURE });
            }
            Message::FileTransfer(transfer) => {
                if let Some((path, size)) = files.accept(transfer)? {
                    print_saved_file(&path, size, &device_id, format);
                    confirm_receipt(&mut session, &path).await;
                }
            }
            _ => print_message(&message, &device_id, format),
        }
    }
}

/// Decode `json` and require it to be a command.
fn parse_command(json: &str) -> CliResult<Command> {
    match synclink_proto::decode(json.as_bytes()) {
        Ok(Message::Command(command)) => Ok(command),
        Ok(other) => Err(CliError::new(
            USAGE,
            format!("--json must be a command, got {}", other.kind()),
        )),
        Err(err) => Err(decode_error("--json is not a valid message", err)),
    }
}

async fn confirm_receipt(session: &mut ControllerSession, path: &Path) {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let receipt = Command::FileReceived {
        name,
        status: "ok".to_string(),
    };
    if let Err(err) = session.send(&receipt.into()).await {
        warn!(%err, "could not confirm file receipt");
    }
}

/// Writes incoming transfers into a directory, checking the sequencing.
struct FileReceiver {
    out_dir: PathBuf,
    assembler: ChunkAssembler,
    current: Option<(PathBuf, File)>,
}

impl FileReceiver {
    fn new(out_dir: PathBuf) -> Self {
        Self {
            out_dir,
            assembler: ChunkAssembler::new(DEFAULT_MAX_FILE_SIZE),
            current: None,
        }
    }

    /// Returns the saved path and size once a file is complete.
    fn accept(&mut self, transfer: &FileTransfer) -> CliResult<Option<(PathBuf, u64)>> {
        let step = match self.assembler.accept(transfer) {
            Ok(step) => step,
            Err(err) => {
                self.discard();
                return Err(CliError::new(
                    DATA_INVALID,
                    format!("file transfer rejected: {err}"),
                ));
            }
        };

        match step {
            AssemblyStep::Started { name, .. } => {
                let path = self.out_dir.join(safe_file_name(&name)?);
                let file = File::create(&path).map_err(|err| {
                    io_error(&format!("failed to create {}", path.display()), err)
                })?;
                self.current = Some((path, file));
                Ok(None)
            }
            AssemblyStep::Chunk { .. } => {
                if let (Some((path, file)), FileTransfer::FileChunk { data, .. }) =
                    (self.current.as_mut(), transfer)
                {
                    file.write_all(data).map_err(|err| {
                        io_error(&format!("failed to write {}", path.display()), err)
                    })?;
                }
                Ok(None)
            }
            AssemblyStep::Finished { size, .. } => match self.current.take() {
                Some((path, mut file)) => {
                    file.flush().map_err(|err| {
                        io_error(&format!("failed to write {}", path.display()), err)
                    })?;
                    Ok(Some((path, size)))
                }
                None => Ok(None),
            },
        }
    }

    fn discard(&mut self) {
        self.assembler.reset();
        if let Some((path, file)) = self.current.take() {
            drop(file);
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Last path component of a device-supplied name.
fn safe_file_name(name: &str) -> CliResult<PathBuf> {
    Path::new(name)
        .file_name()
        .map(PathBuf::from)
        .ok_or_else(|| CliError::new(DATA_INVALID, format!("unusable file name: {name:?}")))
}
