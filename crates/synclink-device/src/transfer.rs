//! Chunked file transfer over the control link.
//!
//! A transfer is `file_info`, then `file_chunk` with `seq` counting up from 1,
//! then `file_end`, then an ok ack for `send_file`. Any failure ends the
//! transfer with an error ack instead, and `file_end` is never sent for a
//! file that was not fully read.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use synclink_peer::MessageSink;
use synclink_proto::{Ack, FileTransfer, Message};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AssemblyError, TransferError};

/// Raw bytes per chunk before base64.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Largest file accepted for transfer.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

const SEND_FILE: &str = "send_file";

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub chunk_size: usize,
    pub max_file_size: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

/// Progress of the file currently being sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFileTransfer {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    /// Bytes read so far.
    pub cursor: u64,
    /// Sequence number of the last chunk sent.
    pub seq: u64,
}

impl PendingFileTransfer {
    /// Number of chunks a file of `size` bytes is split into.
    pub fn chunk_count(size: u64, chunk_size: usize) -> u64 {
        size.div_ceil(chunk_size.max(1) as u64)
    }
}

/// What a completed transfer sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSummary {
    pub size: u64,
    pub chunks: u64,
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Fill `buf` from `file`, stopping early only at end of file.
async fn read_full(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Check preconditions and open `path`. Nothing is sent on failure.
pub async fn prepare(
    config: &TransferConfig,
    path: &Path,
) -> Result<(File, PendingFileTransfer), TransferError> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(TransferError::NotFound(path.to_path_buf()))
        }
        Err(source) => {
            return Err(TransferError::Open {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if !metadata.is_file() {
        return Err(TransferError::NotAFile(path.to_path_buf()));
    }
    if metadata.len() > config.max_file_size {
        return Err(TransferError::TooLarge {
            size: metadata.len(),
            max: config.max_file_size,
        });
    }
    let file = File::open(path).await.map_err(|source| TransferError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    Ok((
        file,
        PendingFileTransfer {
            path: path.to_path_buf(),
            name: file_name(path),
            size: metadata.len(),
            cursor: 0,
            seq: 0,
        },
    ))
}

/// Send one file: `file_info`, chunks, `file_end`, ok ack.
///
/// Errors are returned to the caller; no error ack is sent here.
pub async fn send_file(
    config: &TransferConfig,
    sink: &dyn MessageSink,
    path: &Path,
) -> Result<TransferSummary, TransferError> {
    let (mut file, mut pending) = prepare(config, path).await?;
    // every frame of one file goes to the connection that got file_info
    let pinned = sink.pinned()?;
    let sink: &dyn MessageSink = match &pinned {
        Some(pinned) => &**pinned,
        None => sink,
    };
    info!(path = %pending.path.display(), size = pending.size, "file transfer started");

    sink.send(
        FileTransfer::FileInfo {
            name: pending.name.clone(),
            size: pending.size,
        }
        .into(),
    )
    .await?;

    let mut buf = vec![0u8; config.chunk_size.max(1)];
    while pending.cursor < pending.size {
        let n = read_full(&mut file, &mut buf)
            .await
            .map_err(|source| TransferError::Read {
                offset: pending.cursor,
                source,
            })?;
        if n == 0 {
            return Err(TransferError::SizeMismatch {
                declared: pending.size,
                actual: pending.cursor,
            });
        }
        if pending.cursor + n as u64 > pending.size {
            return Err(TransferError::SizeMismatch {
                declared: pending.size,
                actual: pending.cursor + n as u64,
            });
        }

        pending.cursor += n as u64;
        pending.seq += 1;
        sink.send(
            FileTransfer::FileChunk {
                seq: pending.seq,
                data: buf[..n].to_vec(),
            }
            .into(),
        )
        .await?;
        debug!(seq = pending.seq, cursor = pending.cursor, "chunk sent");
    }

    let mut trailing = [0u8; 1];
    let extra = read_full(&mut file, &mut trailing)
        .await
        .map_err(|source| TransferError::Read {
            offset: pending.cursor,
            source,
        })?;
    if extra > 0 {
        return Err(TransferError::SizeMismatch {
            declared: pending.size,
            actual: pending.cursor + extra as u64,
        });
    }

    sink.send(
        FileTransfer::FileEnd {
            name: pending.name.clone(),
        }
        .into(),
    )
    .await?;

    let summary = TransferSummary {
        size: pending.size,
        chunks: pending.seq,
    };
    sink.send(
        Ack::ok(
            SEND_FILE,
            format!(
                "File sent: {} ({} bytes, {} chunks)",
                pending.name, summary.size, summary.chunks
            ),
        )
        .into(),
    )
    .await?;
    info!(name = %pending.name, size = summary.size, chunks = summary.chunks, "file transfer complete");
    Ok(summary)
}

/// Queue of transfers executed one at a time by a worker task.
#[derive(Clone)]
pub struct FileTransferEngine {
    queue: mpsc::UnboundedSender<PathBuf>,
}

impl FileTransferEngine {
    /// Spawn the worker. It runs until `cancel` fires or every engine
    /// handle is dropped.
    pub fn start(
        config: TransferConfig,
        sink: Arc<dyn MessageSink>,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (queue, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(config, sink, rx, cancel));
        (Self { queue }, worker)
    }

    /// Queue `path` for sending. Returns immediately.
    pub fn enqueue(&self, path: impl Into<PathBuf>) -> Result<(), TransferError> {
        self.queue
            .send(path.into())
            .map_err(|_| TransferError::QueueClosed)
    }
}

async fn run_worker(
    config: TransferConfig,
    sink: Arc<dyn MessageSink>,
    mut queue: mpsc::UnboundedReceiver<PathBuf>,
    cancel: CancellationToken,
) {
    loop {
        let path = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = queue.recv() => match next {
                Some(path) => path,
                None => break,
            },
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = send_file(&config, sink.as_ref(), &path) => result,
        };

        let Err(err) = result else {
            continue;
        };
        match &err {
            TransferError::Link(link) => {
                warn!(path = %path.display(), err = %link, "file transfer interrupted by link failure");
            }
            other => warn!(path = %path.display(), err = %other, "file transfer failed"),
        }
        // reaches whichever connection is current, if any
        if let Err(send_err) = sink.send(Ack::error(SEND_FILE, err.to_string()).into()).await {
            warn!(%send_err, "could not report transfer failure");
        }
    }
    debug!("file transfer worker stopped");
}

/// Receiver-side checker for the chunk sequencing contract.
#[derive(Debug)]
pub struct ChunkAssembler {
    max_file_size: u64,
    active: Option<Incoming>,
}

#[derive(Debug)]
struct Incoming {
    name: String,
    size: u64,
    received: u64,
    next_seq: u64,
}

/// What a transfer message meant to the assembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblyStep {
    Started { name: String, size: u64 },
    /// Chunk accepted; the bytes are the caller's to store.
    Chunk { seq: u64, len: usize },
    Finished { name: String, size: u64 },
}

impl ChunkAssembler {
    pub fn new(max_file_size: u64) -> Self {
        Self {
            max_file_size,
            active: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn accept(&mut self, message: &FileTransfer) -> Result<AssemblyStep, AssemblyError> {
        match message {
            FileTransfer::FileInfo { name, size } => self.begin(name, *size),
            FileTransfer::FileChunk { seq, data } => self.chunk(*seq, data),
            FileTransfer::FileEnd { name } => self.finish(name),
        }
    }

    pub fn begin(&mut self, name: &str, size: u64) -> Result<AssemblyStep, AssemblyError> {
        if let Some(active) = &self.active {
            return Err(AssemblyError::AlreadyStarted {
                active: active.name.clone(),
                incoming: name.to_string(),
            });
        }
        if size > self.max_file_size {
            return Err(AssemblyError::TooLarge {
                size,
                max: self.max_file_size,
            });
        }
        self.active = Some(Incoming {
            name: name.to_string(),
            size,
            received: 0,
            next_seq: 1,
        });
        Ok(AssemblyStep::Started {
            name: name.to_string(),
            size,
        })
    }

    pub fn chunk(&mut self, seq: u64, data: &[u8]) -> Result<AssemblyStep, AssemblyError> {
        let active = self.active.as_mut().ok_or(AssemblyError::NotStarted)?;
        if seq < active.next_seq {
            return Err(AssemblyError::Duplicate(seq));
        }
        if seq > active.next_seq {
            return Err(AssemblyError::Gap {
                expected: active.next_seq,
                got: seq,
            });
        }
        let received = active.received + data.len() as u64;
        if received > active.size {
            return Err(AssemblyError::Overflow {
                declared: active.size,
                received,
            });
        }
        active.received = received;
        active.next_seq += 1;
        Ok(AssemblyStep::Chunk {
            seq,
            len: data.len(),
        })
    }

    pub fn finish(&mut self, name: &str) -> Result<AssemblyStep, AssemblyError> {
        let active = self.active.as_ref().ok_or(AssemblyError::NotStarted)?;
        if active.name != name {
            return Err(AssemblyError::NameMismatch {
                expected: active.name.clone(),
                got: name.to_string(),
            });
        }
        if active.received < active.size {
            return Err(AssemblyError::EarlyEnd {
                declared: active.size,
                received: active.received,
            });
        }
        let size = active.size;
        self.active = None;
        Ok(AssemblyStep::Finished {
            name: name.to_string(),
            size,
        })
    }

    /// Drop the active transfer, if any.
    pub fn reset(&mut self) {
        self.active = None;
    }
}

impl Default for ChunkAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FILE_SIZE)
    }
}

/// Pull out the transfer message, if `message` is one.
pub fn as_transfer(message: &Message) -> Option<&FileTransfer> {
    match message {
        Message::FileTransfer(transfer) => Some(transfer),
        _ => None,
    }
}
