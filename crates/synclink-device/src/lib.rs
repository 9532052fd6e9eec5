//! Device side of the synclink control protocol.
//!
//! A [`DeviceAgent`] keeps a link to the controller alive and feeds every
//! inbound command to a single [`CommandProcessor`] task, which drives the
//! recording hardware through the traits in [`collaborators`] and answers
//! each command with an ack. Files are streamed back by the
//! [`FileTransferEngine`]. [`host`] has implementations of the
//! collaborators for a plain host without capture hardware.

pub mod agent;
pub mod collaborators;
pub mod error;
pub mod host;
pub mod processor;
pub mod stimulus;
pub mod transfer;

pub use agent::{AgentConfig, DeviceAgent};
pub use collaborators::{
    is_path_component, CalibrationFlags, CalibrationOutcome, CalibrationService, CameraKind, ClockSource, ClockSync,
    MarkerRecord, MarkerWriter, RecordingController, RecordingFlags, StatusProvider,
    StimulusOutput, SYNC_MARKER_DIR,
};
pub use error::{
    AssemblyError, CommandError, DelegateError, DelegateResult, DeviceError, Result, TransferError,
};
pub use host::{
    FileMarkerWriter, HostStatus, LoggingRecorder, LoggingStimulus, RecorderCalibration,
    SystemClock,
};
pub use processor::{
    Collaborators, CommandProcessor, ProcessorHandle, ProcessorInput, IMMEDIATE_WINDOW_MS,
};
pub use stimulus::StimulusScheduler;
pub use transfer::{
    as_transfer, prepare, send_file, AssemblyStep, ChunkAssembler, FileTransferEngine,
    PendingFileTransfer, TransferConfig, TransferSummary, DEFAULT_CHUNK_SIZE,
    DEFAULT_MAX_FILE_SIZE,
};
