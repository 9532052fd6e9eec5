//! Command dispatch and recording state.
//!
//! One task owns all recording state and consumes a FIFO input queue, so
//! handlers never overlap and commands are answered in arrival order. Every
//! command yields an ack (the `send_file` ack comes from the transfer
//! worker); collaborator failures become error acks and never end the task.

use std::sync::Arc;
use std::time::Duration;

use synclink_peer::{MessageSink, SessionPreservationRecord, SessionSnapshot};
use synclink_proto::{Ack, AckStatus, Command, DeviceStatus, Message};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collaborators::{
    is_path_component, CalibrationFlags, CalibrationService, ClockSource, MarkerRecord, MarkerWriter,
    RecordingController, RecordingFlags, StatusProvider, StimulusOutput, SYNC_MARKER_DIR,
};
use crate::error::{CommandError, DelegateError};
use crate::stimulus::StimulusScheduler;
use crate::transfer::FileTransferEngine;

/// A stimulus time within this many milliseconds of now runs immediately.
pub const IMMEDIATE_WINDOW_MS: i64 = 1000;

const STIMULUS_FLASH_MS: u64 = 200;
const STIMULUS_BEEP_HZ: u32 = 1000;
const STIMULUS_BEEP_MS: u64 = 200;
const STIMULUS_BEEP_VOLUME: f32 = 0.8;

/// Everything outside the protocol the processor talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub recorder: Arc<dyn RecordingController>,
    pub calibration: Arc<dyn CalibrationService>,
    pub clock: Arc<dyn ClockSource>,
    pub markers: Arc<dyn MarkerWriter>,
    pub stimulus: Arc<dyn StimulusOutput>,
    pub status: Arc<dyn StatusProvider>,
}

/// Work for the processor task, handled strictly in order.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessorInput {
    Message(Message),
    /// Re-adopt session state after a reconnect.
    Restore(SessionPreservationRecord),
    /// Cancel deferred stimulus actions.
    ConnectionLost,
}

enum Input {
    External(ProcessorInput),
    StimulusDue(i64),
}

/// Cloneable handle for feeding the processor.
#[derive(Clone)]
pub struct ProcessorHandle {
    inputs: mpsc::UnboundedSender<Input>,
    session: watch::Receiver<SessionSnapshot>,
}

impl ProcessorHandle {
    /// Queue an input. False once the processor has stopped.
    pub fn submit(&self, input: ProcessorInput) -> bool {
        self.inputs.send(Input::External(input)).is_ok()
    }

    pub fn message(&self, message: Message) -> bool {
        self.submit(ProcessorInput::Message(message))
    }

    pub fn restore(&self, record: SessionPreservationRecord) -> bool {
        self.submit(ProcessorInput::Restore(record))
    }

    pub fn connection_lost(&self) -> bool {
        self.submit(ProcessorInput::ConnectionLost)
    }

    /// Published session state.
    pub fn session(&self) -> watch::Receiver<SessionSnapshot> {
        self.session.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.session.borrow().clone()
    }
}

enum Reply {
    Ack(Option<String>),
    AckThenStatus(Option<String>),
    /// Another component sends the ack.
    Deferred,
}

/// The command processor task state.
pub struct CommandProcessor {
    collaborators: Collaborators,
    sink: Arc<dyn MessageSink>,
    transfers: FileTransferEngine,
    recording: bool,
    session_id: Option<String>,
    stimulus_time: Option<i64>,
    scheduler: StimulusScheduler,
    session: watch::Sender<SessionSnapshot>,
    loopback: mpsc::WeakUnboundedSender<Input>,
}

impl CommandProcessor {
    /// Spawn the processor task. Session changes are published on
    /// `session`.
    ///
    /// It stops when `cancel` fires or every [`ProcessorHandle`] is dropped.
    pub fn spawn(
        collaborators: Collaborators,
        sink: Arc<dyn MessageSink>,
        transfers: FileTransferEngine,
        session: watch::Sender<SessionSnapshot>,
        cancel: CancellationToken,
    ) -> (ProcessorHandle, JoinHandle<()>) {
        let (inputs, rx) = mpsc::unbounded_channel();
        let session_rx = session.subscribe();
        let processor = CommandProcessor {
            collaborators,
            sink,
            transfers,
            recording: false,
            session_id: None,
            stimulus_time: None,
            scheduler: StimulusScheduler::new(),
            session,
            loopback: inputs.downgrade(),
        };
        let task = tokio::spawn(processor.run(rx, cancel));
        (
            ProcessorHandle {
                inputs,
                session: session_rx,
            },
            task,
        )
    }

    async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<Input>, cancel: CancellationToken) {
        loop {
            let input = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = inputs.recv() => match next {
                    Some(input) => input,
                    None => break,
                },
            };

            match input {
                Input::External(ProcessorInput::Message(Message::Command(command))) => {
                    self.handle_command(command).await
                }
                Input::External(ProcessorInput::Message(other)) => {
                    debug!(kind = %other.kind(), "ignoring non-command message");
                }
                Input::External(ProcessorInput::Restore(record)) => self.restore(record).await,
                Input::External(ProcessorInput::ConnectionLost) => {
                    self.scheduler.cancel_all();
                }
                Input::StimulusDue(time) => self.execute_stimulus(time).await,
            }
        }
        self.scheduler.cancel_all();
        debug!("command processor stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        let name = command.name();
        info!(cmd = name, "processing command");

        let outcome = match command {
            Command::StartRecord {
                session_id,
                record_video,
                record_thermal,
                record_shimmer,
            } => {
                let flags = RecordingFlags {
                    video: record_video,
                    thermal: record_thermal,
                    shimmer: record_shimmer,
                };
                self.start_record(session_id, flags).await
            }
            Command::StopRecord => self.stop_record().await,
            Command::CaptureCalibration {
                calibration_id,
                capture_rgb,
                capture_thermal,
                high_resolution,
            } => {
                let flags = CalibrationFlags {
                    rgb: capture_rgb,
                    thermal: capture_thermal,
                    high_resolution,
                };
                self.capture_calibration(calibration_id, flags).await
            }
            Command::SetStimulusTime { time } => self.set_stimulus_time(time).await,
            Command::FlashSync {
                duration_ms,
                sync_id,
            } => self.flash_sync(duration_ms, sync_id),
            Command::BeepSync {
                frequency_hz,
                duration_ms,
                volume,
                sync_id,
            } => self.beep_sync(frequency_hz, duration_ms, volume, sync_id),
            Command::SyncTime {
                pc_timestamp,
                sync_id,
            } => self.sync_time(pc_timestamp, sync_id),
            Command::SendFile { filepath, filetype } => self.send_file(filepath, filetype),
            Command::FileReceived { name, status } => {
                info!(%name, %status, "controller confirmed file receipt");
                Ok(Reply::Ack(Some(format!("File receipt recorded: {name} ({status})"))))
            }
        };

        match outcome {
            Ok(Reply::Ack(message)) => self.ack(name, AckStatus::Ok, message).await,
            Ok(Reply::AckThenStatus(message)) => {
                self.ack(name, AckStatus::Ok, message).await;
                self.send_status().await;
            }
            Ok(Reply::Deferred) => {}
            Err(err) => {
                warn!(cmd = name, %err, "command failed");
                self.ack(name, AckStatus::Error, Some(err.to_string())).await;
            }
        }
    }

    async fn start_record(
        &mut self,
        session_id: String,
        flags: RecordingFlags,
    ) -> Result<Reply, CommandError> {
        if self.recording {
            return Err(CommandError::AlreadyRecording);
        }
        if !is_path_component(&session_id) {
            return Err(DelegateError::InvalidState(format!("invalid session id {session_id:?}")).into());
        }
        self.collaborators.recorder.start(&session_id, flags).await?;
        info!(%session_id, "recording started");
        self.recording = true;
        self.session_id = Some(session_id);
        self.publish();
        Ok(Reply::AckThenStatus(None))
    }

    async fn stop_record(&mut self) -> Result<Reply, CommandError> {
        if !self.recording {
            return Err(CommandError::NotRecording);
        }
        self.collaborators.recorder.stop().await?;
        info!(session_id = ?self.session_id, "recording stopped");
        self.recording = false;
        self.session_id = None;
        self.publish();
        Ok(Reply::AckThenStatus(None))
    }

    async fn capture_calibration(
        &mut self,
        calibration_id: Option<String>,
        flags: CalibrationFlags,
    ) -> Result<Reply, CommandError> {
        let outcome = self
            .collaborators
            .calibration
            .capture(calibration_id.as_deref(), flags)
            .await?;

        if !outcome.success {
            let detail = outcome
                .error
                .unwrap_or_else(|| "Unknown calibration capture error".to_string());
            return Err(CommandError::Failed(format!(
                "Calibration capture failed: {detail}"
            )));
        }

        let mut message = format!("Calibration capture successful: {}", outcome.calibration_id);
        if let Some(path) = &outcome.rgb_path {
            message.push_str(&format!(", RGB: {}", path.display()));
        }
        if let Some(path) = &outcome.thermal_path {
            message.push_str(&format!(", Thermal: {}", path.display()));
        }
        message.push_str(&format!(", Synced timestamp: {}", outcome.synced_timestamp));
        Ok(Reply::Ack(Some(message)))
    }

    async fn set_stimulus_time(&mut self, time: i64) -> Result<Reply, CommandError> {
        self.stimulus_time = Some(time);
        // saturates on extreme wire values: far future or far past
        let offset = time.saturating_sub(self.collaborators.clock.now_ms());

        if offset > 0 {
            let loopback = self.loopback.clone();
            self.scheduler
                .schedule(Duration::from_millis(offset as u64), async move {
                    if let Some(inputs) = loopback.upgrade() {
                        let _ = inputs.send(Input::StimulusDue(time));
                    }
                });
            info!(time, offset_ms = offset, "stimulus scheduled");
        } else if offset.unsigned_abs() < IMMEDIATE_WINDOW_MS.unsigned_abs() {
            self.execute_stimulus(time).await;
        } else {
            info!(time, offset_ms = offset, "stimulus time in the past, recorded for alignment");
        }

        self.write_marker(
            &MarkerRecord::StimulusSync {
                stimulus_time: time,
                device_time: self.collaborators.clock.now_ms(),
                session_id: self.session_id.clone(),
                recording_active: self.recording,
            },
            SYNC_MARKER_DIR,
        );

        Ok(Reply::Ack(Some(format!(
            "Stimulus time processed (offset: {offset}ms)"
        ))))
    }

    async fn execute_stimulus(&mut self, time: i64) {
        let device_time = self.collaborators.clock.now_ms();
        info!(time, device_time, "executing stimulus");

        self.send_status().await;

        let stimulus = &self.collaborators.stimulus;
        if let Err(err) = stimulus.flash(STIMULUS_FLASH_MS).await {
            warn!(%err, "visual stimulus failed");
        }
        if let Err(err) = stimulus
            .beep(STIMULUS_BEEP_HZ, STIMULUS_BEEP_MS, STIMULUS_BEEP_VOLUME)
            .await
        {
            warn!(%err, "audio stimulus failed");
        }

        if self.recording {
            let session_id = self
                .session_id
                .clone()
                .unwrap_or_else(|| "unknown_session".to_string());
            let directory = format!("sessions/{session_id}");
            self.write_marker(
                &MarkerRecord::StimulusEvent {
                    session_id,
                    timestamp_ms: time,
                    device_timestamp: device_time,
                    event_type: "stimulus".to_string(),
                },
                &directory,
            );
        }
    }

    fn flash_sync(&mut self, duration_ms: u64, sync_id: Option<String>) -> Result<Reply, CommandError> {
        let stimulus = Arc::clone(&self.collaborators.stimulus);
        tokio::spawn(async move {
            if let Err(err) = stimulus.flash(duration_ms).await {
                warn!(%err, "flash sync could not be triggered");
            }
        });

        if let Some(sync_id) = sync_id {
            let device_time = self.collaborators.clock.now_ms();
            self.write_marker(
                &MarkerRecord::FlashSync {
                    sync_id,
                    duration_ms,
                    device_time,
                    synced_time: self.collaborators.clock.synced_timestamp(device_time),
                    session_id: self.session_id.clone(),
                    recording_active: self.recording,
                },
                SYNC_MARKER_DIR,
            );
        }
        Ok(Reply::Ack(Some(format!("Flash sync triggered ({duration_ms}ms)"))))
    }

    fn beep_sync(
        &mut self,
        frequency_hz: u32,
        duration_ms: u64,
        volume: f32,
        sync_id: Option<String>,
    ) -> Result<Reply, CommandError> {
        let stimulus = Arc::clone(&self.collaborators.stimulus);
        tokio::spawn(async move {
            if let Err(err) = stimulus.beep(frequency_hz, duration_ms, volume).await {
                warn!(%err, "beep sync could not be triggered");
            }
        });

        if let Some(sync_id) = sync_id {
            let device_time = self.collaborators.clock.now_ms();
            self.write_marker(
                &MarkerRecord::BeepSync {
                    sync_id,
                    frequency_hz,
                    duration_ms,
                    volume,
                    device_time,
                    synced_time: self.collaborators.clock.synced_timestamp(device_time),
                    session_id: self.session_id.clone(),
                    recording_active: self.recording,
                },
                SYNC_MARKER_DIR,
            );
        }
        Ok(Reply::Ack(Some(format!(
            "Beep sync triggered ({frequency_hz}Hz, {duration_ms}ms, vol={volume})"
        ))))
    }

    fn sync_time(&mut self, pc_timestamp: i64, sync_id: Option<String>) -> Result<Reply, CommandError> {
        let sync = self
            .collaborators
            .clock
            .synchronize(pc_timestamp, sync_id.as_deref())
            .map_err(|err| CommandError::Failed(format!("Clock sync failed: {err}")))?;

        let mut message = format!("Clock sync successful: offset={}ms", sync.offset_ms);
        if let Some(sync_id) = &sync_id {
            message.push_str(&format!(", sync_id={sync_id}"));
        }
        message.push_str(&format!(", age={}ms", sync.age_ms));
        Ok(Reply::Ack(Some(message)))
    }

    fn send_file(&mut self, filepath: String, filetype: Option<String>) -> Result<Reply, CommandError> {
        info!(%filepath, filetype = ?filetype, "file transfer requested");
        self.transfers
            .enqueue(filepath)
            .map_err(|err| CommandError::Failed(format!("Failed to process file transfer: {err}")))?;
        Ok(Reply::Deferred)
    }

    async fn restore(&mut self, record: SessionPreservationRecord) {
        info!(
            session_id = %record.session_id,
            recording = record.recording_active,
            "restoring preserved session"
        );
        self.session_id = Some(record.session_id);
        self.recording = record.recording_active;
        self.publish();
        self.send_status().await;
    }

    fn publish(&self) {
        self.session.send_replace(SessionSnapshot {
            session_id: self.session_id.clone(),
            recording: self.recording,
        });
    }

    fn write_marker(&self, record: &MarkerRecord, directory: &str) {
        if let Err(err) = self.collaborators.markers.append(record, directory) {
            error!(kind = record.kind(), directory, %err, "failed to write sync marker");
        }
    }

    fn status(&self) -> DeviceStatus {
        let status = &self.collaborators.status;
        DeviceStatus {
            battery: status.battery(),
            storage: status.storage(),
            temperature: status.temperature(),
            recording: self.recording,
            connected: true,
        }
    }

    async fn send_status(&self) {
        self.deliver(Message::Status(self.status())).await;
    }

    async fn ack(&self, cmd: &str, status: AckStatus, message: Option<String>) {
        self.deliver(Message::Ack(Ack {
            cmd: cmd.to_string(),
            status,
            message,
        }))
        .await;
    }

    async fn deliver(&self, message: Message) {
        if let Err(err) = self.sink.send(message).await {
            warn!(%err, "reply not delivered");
        }
    }
}
