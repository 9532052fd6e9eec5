//! Host implementations of the collaborator traits, used by the CLI agent
//! when no device hardware is attached.

use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use synclink_peer::BoxFuture;
use tracing::{debug, info};

use crate::collaborators::{
    is_path_component, CalibrationFlags, CalibrationOutcome, CalibrationService, CameraKind, ClockSource, ClockSync,
    MarkerRecord, MarkerWriter, RecordingController, RecordingFlags, StatusProvider,
    StimulusOutput,
};
use crate::error::{DelegateError, DelegateResult};
use crate::processor::Collaborators;

const MIN_SYNC_SAMPLES: usize = 3;
const MAX_SYNC_SAMPLES: usize = 8;

fn wall_clock_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

struct SyncHistory {
    offsets: VecDeque<i64>,
    synced_at: Option<Instant>,
}

/// Wall clock plus a controller offset.
///
/// The offset is the latest measurement until three exist, then the median
/// of the most recent eight.
pub struct SystemClock {
    offset_ms: AtomicI64,
    history: Mutex<SyncHistory>,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            offset_ms: AtomicI64::new(0),
            history: Mutex::new(SyncHistory {
                offsets: VecDeque::with_capacity(MAX_SYNC_SAMPLES),
                synced_at: None,
            }),
        }
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::SeqCst)
    }

    pub fn is_synchronized(&self) -> bool {
        self.lock().synced_at.is_some()
    }

    /// Milliseconds since the last successful sync.
    pub fn age_ms(&self) -> Option<u64> {
        self.lock()
            .synced_at
            .map(|at| at.elapsed().as_millis() as u64)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SyncHistory> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSource for SystemClock {
    fn now_ms(&self) -> i64 {
        wall_clock_ms()
    }

    fn synchronize(&self, pc_timestamp: i64, sync_id: Option<&str>) -> DelegateResult<ClockSync> {
        if pc_timestamp <= 0 {
            return Err(DelegateError::InvalidState(format!(
                "invalid PC timestamp {pc_timestamp}"
            )));
        }
        let measured = pc_timestamp.saturating_sub(self.now_ms());

        let mut history = self.lock();
        history.offsets.push_back(measured);
        while history.offsets.len() > MAX_SYNC_SAMPLES {
            history.offsets.pop_front();
        }
        let offset = if history.offsets.len() < MIN_SYNC_SAMPLES {
            measured
        } else {
            let mut sorted: Vec<i64> = history.offsets.iter().copied().collect();
            sorted.sort_unstable();
            sorted[sorted.len() / 2]
        };
        history.synced_at = Some(Instant::now());
        drop(history);

        self.offset_ms.store(offset, Ordering::SeqCst);
        info!(offset_ms = offset, measured_ms = measured, sync_id, "clock synchronized");
        Ok(ClockSync {
            offset_ms: offset,
            age_ms: 0,
        })
    }

    fn synced_timestamp(&self, device_ms: i64) -> i64 {
        if self.is_synchronized() {
            device_ms.saturating_add(self.offset_ms())
        } else {
            device_ms
        }
    }
}

/// Appends markers as JSON lines to `<root>/<directory>/<kind>.jsonl`.
#[derive(Debug, Clone)]
pub struct FileMarkerWriter {
    root: PathBuf,
}

impl FileMarkerWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, record: &MarkerRecord, directory: &str) -> PathBuf {
        self.root
            .join(directory)
            .join(format!("{}.jsonl", record.kind()))
    }
}

impl MarkerWriter for FileMarkerWriter {
    fn append(&self, record: &MarkerRecord, directory: &str) -> DelegateResult<()> {
        if !directory.split('/').all(is_path_component) {
            return Err(DelegateError::InvalidState(format!(
                "marker directory {directory:?} escapes the data root"
            )));
        }
        let path = self.path_for(record, directory);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut line =
            serde_json::to_vec(record).map_err(|err| DelegateError::Other(err.to_string()))?;
        line.push(b'\n');

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(&line)?;
        debug!(path = %path.display(), kind = record.kind(), "marker written");
        Ok(())
    }
}

/// Recording controller that only logs. Calibration images are written as
/// empty placeholder files.
#[derive(Debug, Default)]
pub struct LoggingRecorder {
    recording: AtomicBool,
}

impl LoggingRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }
}

impl RecordingController for LoggingRecorder {
    fn start<'a>(
        &'a self,
        session_id: &'a str,
        flags: RecordingFlags,
    ) -> BoxFuture<'a, DelegateResult<()>> {
        Box::pin(async move {
            if self.recording.swap(true, Ordering::SeqCst) {
                return Err(DelegateError::InvalidState(
                    "recorder already running".to_string(),
                ));
            }
            info!(
                session_id,
                video = flags.video,
                thermal = flags.thermal,
                shimmer = flags.shimmer,
                "recording started"
            );
            Ok(())
        })
    }

    fn stop(&self) -> BoxFuture<'_, DelegateResult<()>> {
        Box::pin(async move {
            if !self.recording.swap(false, Ordering::SeqCst) {
                return Err(DelegateError::InvalidState("recorder is idle".to_string()));
            }
            info!("recording stopped");
            Ok(())
        })
    }

    fn capture_calibration_image<'a>(
        &'a self,
        camera: CameraKind,
        path: &'a Path,
    ) -> BoxFuture<'a, DelegateResult<()>> {
        Box::pin(async move {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(path, b"").await?;
            info!(camera = camera.as_str(), path = %path.display(), "calibration image captured");
            Ok(())
        })
    }
}

/// Calibration through the recording controller's still capture.
///
/// Images land in `<root>/calibration/<camera>_calibration_<id>.jpg`.
pub struct RecorderCalibration {
    recorder: Arc<dyn RecordingController>,
    clock: Arc<dyn ClockSource>,
    root: PathBuf,
}

impl RecorderCalibration {
    pub fn new(
        recorder: Arc<dyn RecordingController>,
        clock: Arc<dyn ClockSource>,
        root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            recorder,
            clock,
            root: root.into(),
        }
    }

    async fn capture_one(
        &self,
        camera: CameraKind,
        calibration_id: &str,
    ) -> Result<PathBuf, String> {
        let path = self
            .root
            .join("calibration")
            .join(format!("{}_calibration_{calibration_id}.jpg", camera.as_str()));
        self.recorder
            .capture_calibration_image(camera, &path)
            .await
            .map(|()| path)
            .map_err(|err| format!("{} capture failed: {err}", camera.as_str()))
    }
}

impl CalibrationService for RecorderCalibration {
    fn capture<'a>(
        &'a self,
        calibration_id: Option<&'a str>,
        flags: CalibrationFlags,
    ) -> BoxFuture<'a, DelegateResult<CalibrationOutcome>> {
        Box::pin(async move {
            let now = self.clock.now_ms();
            let calibration_id = calibration_id
                .map(str::to_string)
                .unwrap_or_else(|| format!("calib_{now}"));
            if !is_path_component(&calibration_id) {
                return Err(DelegateError::InvalidState(format!(
                    "invalid calibration id {calibration_id:?}"
                )));
            }

            let mut errors = Vec::new();
            let mut rgb_path = None;
            let mut thermal_path = None;
            if flags.rgb {
                match self.capture_one(CameraKind::Rgb, &calibration_id).await {
                    Ok(path) => rgb_path = Some(path),
                    Err(err) => errors.push(err),
                }
            }
            if flags.thermal {
                match self.capture_one(CameraKind::Thermal, &calibration_id).await {
                    Ok(path) => thermal_path = Some(path),
                    Err(err) => errors.push(err),
                }
            }
            if !flags.rgb && !flags.thermal {
                errors.push("no camera selected".to_string());
            }

            Ok(CalibrationOutcome {
                success: errors.is_empty(),
                calibration_id,
                rgb_path,
                thermal_path,
                synced_timestamp: self.clock.synced_timestamp(now),
                error: (!errors.is_empty()).then(|| errors.join("; ")),
            })
        })
    }
}

/// Stimulus output that logs each trigger.
#[derive(Debug, Default)]
pub struct LoggingStimulus;

impl StimulusOutput for LoggingStimulus {
    fn flash(&self, duration_ms: u64) -> BoxFuture<'_, DelegateResult<()>> {
        Box::pin(async move {
            info!(duration_ms, "flash stimulus");
            Ok(())
        })
    }

    fn beep(
        &self,
        frequency_hz: u32,
        duration_ms: u64,
        volume: f32,
    ) -> BoxFuture<'_, DelegateResult<()>> {
        Box::pin(async move {
            let volume_percent = (volume * 100.0).clamp(0.0, 100.0) as u8;
            info!(frequency_hz, duration_ms, volume_percent, "beep stimulus");
            Ok(())
        })
    }
}

/// Battery and temperature from Linux sysfs where available.
#[derive(Debug, Clone)]
pub struct HostStatus {
    sysfs: PathBuf,
}

impl HostStatus {
    pub fn new() -> Self {
        Self::with_sysfs_root("/sys/class")
    }

    /// Read from an alternate sysfs tree.
    pub fn with_sysfs_root(root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs: root.into(),
        }
    }

    fn read_number(&self, relative: &str) -> Option<i64> {
        fs::read_to_string(self.sysfs.join(relative))
            .ok()?
            .trim()
            .parse()
            .ok()
    }
}

impl Default for HostStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusProvider for HostStatus {
    fn battery(&self) -> Option<u8> {
        self.read_number("power_supply/BAT0/capacity")
            .map(|pct| pct.clamp(0, 100) as u8)
    }

    fn storage(&self) -> Option<String> {
        None
    }

    fn temperature(&self) -> Option<f64> {
        // millidegrees Celsius
        self.read_number("thermal/thermal_zone0/temp")
            .map(|milli| milli as f64 / 1000.0)
    }
}

impl Collaborators {
    /// Host implementations for everything, with markers and calibration
    /// images stored under `root`.
    pub fn host(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let recorder: Arc<dyn RecordingController> = Arc::new(LoggingRecorder::new());
        let clock: Arc<dyn ClockSource> = Arc::new(SystemClock::new());
        Collaborators {
            calibration: Arc::new(RecorderCalibration::new(
                Arc::clone(&recorder),
                Arc::clone(&clock),
                root.clone(),
            )),
            markers: Arc::new(FileMarkerWriter::new(root)),
            stimulus: Arc::new(LoggingStimulus),
            status: Arc::new(HostStatus::new()),
            recorder,
            clock,
        }
    }
}
