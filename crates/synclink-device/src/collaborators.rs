//! Interfaces to the device hardware and storage the processor drives.
//!
//! Calls that may wait on hardware return a [`BoxFuture`]; cheap local
//! calls are synchronous.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use synclink_peer::BoxFuture;

use crate::error::DelegateResult;

/// Directory, relative to the marker root, that holds every sync marker.
pub const SYNC_MARKER_DIR: &str = "sync_markers";

/// True when `name` is usable as one file or directory name under a
/// storage root: not empty, not `.` or `..`, no separators.
pub fn is_path_component(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\', '\0'])
}

/// Streams to enable for a recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordingFlags {
    pub video: bool,
    pub thermal: bool,
    pub shimmer: bool,
}

/// Which camera a calibration image comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CameraKind {
    Rgb,
    Thermal,
}

impl CameraKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CameraKind::Rgb => "rgb",
            CameraKind::Thermal => "thermal",
        }
    }
}

pub trait RecordingController: Send + Sync {
    fn start<'a>(
        &'a self,
        session_id: &'a str,
        flags: RecordingFlags,
    ) -> BoxFuture<'a, DelegateResult<()>>;

    fn stop(&self) -> BoxFuture<'_, DelegateResult<()>>;

    /// Capture one still image from `camera` into `path`.
    fn capture_calibration_image<'a>(
        &'a self,
        camera: CameraKind,
        path: &'a Path,
    ) -> BoxFuture<'a, DelegateResult<()>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationFlags {
    pub rgb: bool,
    pub thermal: bool,
    pub high_resolution: bool,
}

/// Result of a calibration capture, relayed to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibrationOutcome {
    pub success: bool,
    pub calibration_id: String,
    pub rgb_path: Option<PathBuf>,
    pub thermal_path: Option<PathBuf>,
    /// Controller-aligned epoch milliseconds of the capture.
    pub synced_timestamp: i64,
    pub error: Option<String>,
}

pub trait CalibrationService: Send + Sync {
    fn capture<'a>(
        &'a self,
        calibration_id: Option<&'a str>,
        flags: CalibrationFlags,
    ) -> BoxFuture<'a, DelegateResult<CalibrationOutcome>>;
}

/// Outcome of a clock synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSync {
    /// Controller clock minus device clock.
    pub offset_ms: i64,
    /// Milliseconds since the offset was established.
    pub age_ms: u64,
}

pub trait ClockSource: Send + Sync {
    /// Device wall clock, epoch milliseconds.
    fn now_ms(&self) -> i64;

    /// Establish a new offset against the controller clock. On error the
    /// previous offset is kept.
    fn synchronize(&self, pc_timestamp: i64, sync_id: Option<&str>) -> DelegateResult<ClockSync>;

    /// `device_ms` translated to the controller timeline.
    fn synced_timestamp(&self, device_ms: i64) -> i64;
}

/// One persisted synchronization record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "marker", rename_all = "snake_case")]
pub enum MarkerRecord {
    StimulusSync {
        stimulus_time: i64,
        device_time: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        recording_active: bool,
    },
    FlashSync {
        sync_id: String,
        duration_ms: u64,
        device_time: i64,
        synced_time: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        recording_active: bool,
    },
    BeepSync {
        sync_id: String,
        frequency_hz: u32,
        duration_ms: u64,
        volume: f32,
        device_time: i64,
        synced_time: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        recording_active: bool,
    },
    /// Stimulus executed while recording, kept with the session.
    StimulusEvent {
        session_id: String,
        timestamp_ms: i64,
        device_timestamp: i64,
        event_type: String,
    },
}

impl MarkerRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            MarkerRecord::StimulusSync { .. } => "stimulus_sync",
            MarkerRecord::FlashSync { .. } => "flash_sync",
            MarkerRecord::BeepSync { .. } => "beep_sync",
            MarkerRecord::StimulusEvent { .. } => "stimulus_event",
        }
    }
}

pub trait MarkerWriter: Send + Sync {
    /// Append `record` under `directory`, relative to the writer's root.
    fn append(&self, record: &MarkerRecord, directory: &str) -> DelegateResult<()>;
}

pub trait StimulusOutput: Send + Sync {
    fn flash(&self, duration_ms: u64) -> BoxFuture<'_, DelegateResult<()>>;
    fn beep(&self, frequency_hz: u32, duration_ms: u64, volume: f32)
        -> BoxFuture<'_, DelegateResult<()>>;
}

/// Point-in-time device health. `None` where the host cannot tell.
pub trait StatusProvider: Send + Sync {
    fn battery(&self) -> Option<u8>;
    fn storage(&self) -> Option<String>;
    fn temperature(&self) -> Option<f64>;
}
