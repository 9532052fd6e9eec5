//! Connection loss detection, reconnection and session preservation.
//!
//! The manager owns the current connection and is the only writer of
//! [`LinkStatus`]. Everything else sends through a [`LinkSender`], which
//! resolves the live connection at send time.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use synclink_proto::Message;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelConfig, Connection, ConnectionHandle, DisconnectReason, EventSender};
use crate::error::{PeerError, Result};
use crate::handshake::CapabilityProfile;
use crate::quality::QualityMonitor;
use crate::sink::{BoxFuture, MessageSink};

/// Reconnection limits and timings.
#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    /// Hard cap on attempts per recovery run.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Preserved sessions younger than this are restored on reconnect.
    pub session_ttl: Duration,
    /// Start the recovery loop when the connection is lost.
    pub auto_reconnect: bool,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            session_ttl: Duration::from_millis(300_000),
            auto_reconnect: true,
        }
    }
}

/// What a given attempt does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryStrategy {
    ImmediateRetry,
    BackoffRetry,
    DegradedRetry,
    ManualIntervention,
}

impl RecoveryStrategy {
    /// Strategy for the 1-based `attempt`.
    pub fn for_attempt(attempt: u32) -> Self {
        match attempt {
            0..=2 => RecoveryStrategy::ImmediateRetry,
            3..=5 => RecoveryStrategy::BackoffRetry,
            6..=8 => RecoveryStrategy::DegradedRetry,
            _ => RecoveryStrategy::ManualIntervention,
        }
    }

    /// Capability profile to dial with, or `None` when no dial happens.
    pub fn profile(self) -> Option<CapabilityProfile> {
        match self {
            RecoveryStrategy::ImmediateRetry | RecoveryStrategy::BackoffRetry => {
                Some(CapabilityProfile::Full)
            }
            RecoveryStrategy::DegradedRetry => Some(CapabilityProfile::Reduced),
            RecoveryStrategy::ManualIntervention => None,
        }
    }

    pub fn waits_before_dial(self) -> bool {
        matches!(
            self,
            RecoveryStrategy::BackoffRetry | RecoveryStrategy::DegradedRetry
        )
    }
}

/// Delay before `attempt`, jittered by a pure function of `at`.
///
/// `min(max_delay, base * 2^min(attempt-1, 5) + jitter)`, where the jitter is
/// at most a tenth of the exponential term and mixes the millisecond within
/// the second, a slow sine of wall-clock time and the attempt count.
pub fn retry_delay(policy: &RecoveryPolicy, attempt: u32, at: SystemTime) -> Duration {
    let base_ms = policy.base_delay.as_millis() as u64;
    let exponent = attempt.saturating_sub(1).min(5);
    let exponential_ms = base_ms.saturating_mul(1u64 << exponent);

    let now_ms = at
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let time_factor = (now_ms % 1000) as f64 / 1000.0;
    let wave_factor = (now_ms as f64 * 0.001).sin() * 0.5 + 0.5;
    let attempt_factor = (attempt as f64 / 10.0).min(1.0);
    let jitter_factor = (time_factor * 0.4 + wave_factor * 0.4 + attempt_factor * 0.2) * 0.1;
    let jitter_ms = (exponential_ms as f64 * jitter_factor) as u64;

    let max_ms = policy.max_delay.as_millis() as u64;
    Duration::from_millis(exponential_ms.saturating_add(jitter_ms).min(max_ms))
}

/// Recording session as published by the command processor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub session_id: Option<String>,
    pub recording: bool,
}

/// Session state kept across a connection loss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPreservationRecord {
    pub session_id: String,
    pub recording_active: bool,
    pub file_count: u32,
    pub pending_data: Vec<String>,
    pub last_sync_time: SystemTime,
    pub connection_lost_time: SystemTime,
}

impl SessionPreservationRecord {
    pub fn new(session_id: impl Into<String>, recording_active: bool, at: SystemTime) -> Self {
        Self {
            session_id: session_id.into(),
            recording_active,
            file_count: 0,
            pending_data: Vec::new(),
            last_sync_time: at,
            connection_lost_time: at,
        }
    }
}

/// Where the recovery loop stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryPhase {
    Idle,
    Recovering,
    ManualInterventionRequired,
}

/// Observable link state. Only the manager writes it.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkStatus {
    pub connected: bool,
    pub connection_id: Option<u64>,
    pub transport: &'static str,
    pub quality: u8,
    pub attempts: u32,
    pub phase: RecoveryPhase,
    pub last_connected: Option<SystemTime>,
    pub last_disconnected: Option<SystemTime>,
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self {
            connected: false,
            connection_id: None,
            transport: "tcp",
            quality: 0,
            attempts: 0,
            phase: RecoveryPhase::Idle,
            last_connected: None,
            last_disconnected: None,
        }
    }
}

/// Outcomes of the recovery loop.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryEvent {
    Reconnected {
        connection_id: u64,
        restored: Option<SessionPreservationRecord>,
    },
    ManualInterventionRequired {
        attempts: u32,
    },
}

/// Counters since the manager was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub connection_losses: u64,
    pub recovery_attempts: u64,
    pub successful_recoveries: u64,
    pub current_attempts: u32,
    pub recovering: bool,
    pub preserved_sessions: usize,
}

impl RecoveryStats {
    /// Successful recoveries per attempt, as a whole percentage.
    pub fn success_rate_percent(&self) -> u32 {
        if self.recovery_attempts == 0 {
            0
        } else {
            (self.successful_recoveries * 100 / self.recovery_attempts) as u32
        }
    }
}

/// Produces new connections for the recovery loop.
pub trait Dialer: Send + Sync {
    fn dial(
        &self,
        profile: CapabilityProfile,
        events: EventSender,
    ) -> BoxFuture<'_, Result<ConnectionHandle>>;
}

/// Dials the configured TCP endpoint, optionally falling back to the
/// legacy control port when the primary port refuses.
pub struct TcpDialer {
    config: ChannelConfig,
    quality: Option<QualityMonitor>,
    legacy_fallback: bool,
}

impl TcpDialer {
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            config,
            quality: None,
            legacy_fallback: false,
        }
    }

    pub fn with_quality(mut self, quality: QualityMonitor) -> Self {
        self.quality = Some(quality);
        self
    }

    pub fn with_legacy_fallback(mut self, enabled: bool) -> Self {
        self.legacy_fallback = enabled;
        self
    }
}

impl Dialer for TcpDialer {
    fn dial(
        &self,
        profile: CapabilityProfile,
        events: EventSender,
    ) -> BoxFuture<'_, Result<ConnectionHandle>> {
        Box::pin(async move {
            let primary =
                Connection::open(&self.config, profile, events.clone(), self.quality.clone()).await;
            match primary {
                Err(PeerError::Transport(err))
                    if self.legacy_fallback && self.config.endpoint.port != self.config.endpoint.legacy().port =>
                {
                    let mut legacy = self.config.clone();
                    legacy.endpoint = self.config.endpoint.legacy();
                    warn!(%err, endpoint = %legacy.endpoint, "primary port failed, trying legacy port");
                    Connection::open(&legacy, profile, events, self.quality.clone()).await
                }
                other => other,
            }
        })
    }
}

type Slot = Arc<RwLock<Option<ConnectionHandle>>>;

fn read_slot(slot: &Slot) -> Option<ConnectionHandle> {
    slot.read().unwrap_or_else(PoisonError::into_inner).clone()
}

fn write_slot(slot: &Slot, handle: Option<ConnectionHandle>) -> Option<ConnectionHandle> {
    let mut guard = slot.write().unwrap_or_else(PoisonError::into_inner);
    std::mem::replace(&mut *guard, handle)
}

/// Sending handle that follows the current connection across reconnects.
#[derive(Clone)]
pub struct LinkSender {
    slot: Slot,
}

impl LinkSender {
    pub fn current(&self) -> Option<ConnectionHandle> {
        read_slot(&self.slot)
    }

    pub async fn send(&self, message: &Message) -> Result<()> {
        let handle = self
            .current()
            .ok_or_else(|| PeerError::Disconnected("no active connection".to_string()))?;
        handle.send(message).await
    }
}

impl fmt::Debug for LinkSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkSender")
            .field("current", &self.current().map(|h| h.id()))
            .finish()
    }
}

impl MessageSink for LinkSender {
    fn send(&self, message: Message) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { LinkSender::send(self, &message).await })
    }

    fn pinned(&self) -> Result<Option<Arc<dyn MessageSink>>> {
        let handle = self
            .current()
            .ok_or_else(|| PeerError::Disconnected("no active connection".to_string()))?;
        Ok(Some(Arc::new(handle)))
    }
}

#[derive(Default)]
struct Counters {
    connection_losses: AtomicU64,
    recovery_attempts: AtomicU64,
    successful_recoveries: AtomicU64,
}

struct Inner {
    policy: RecoveryPolicy,
    dialer: Arc<dyn Dialer>,
    events: EventSender,
    slot: Slot,
    status: watch::Sender<LinkStatus>,
    outcomes: mpsc::UnboundedSender<RecoveryEvent>,
    session: watch::Receiver<SessionSnapshot>,
    attempts: AtomicU32,
    recovering: AtomicBool,
    sessions: Mutex<HashMap<String, SessionPreservationRecord>>,
    pending_restore: Mutex<Option<String>>,
    counters: Counters,
    shutdown: CancellationToken,
}

/// Owns the current connection and drives reconnection.
#[derive(Clone)]
pub struct RecoveryManager {
    inner: Arc<Inner>,
}

impl RecoveryManager {
    /// `events` is handed to every new connection; `session` is the
    /// processor's published session state.
    pub fn new(
        policy: RecoveryPolicy,
        dialer: Arc<dyn Dialer>,
        events: EventSender,
        session: watch::Receiver<SessionSnapshot>,
    ) -> (Self, mpsc::UnboundedReceiver<RecoveryEvent>) {
        let (status, _) = watch::channel(LinkStatus::default());
        let (outcomes, outcomes_rx) = mpsc::unbounded_channel();
        let manager = Self {
            inner: Arc::new(Inner {
                policy,
                dialer,
                events,
                slot: Arc::new(RwLock::new(None)),
                status,
                outcomes,
                session,
                attempts: AtomicU32::new(0),
                recovering: AtomicBool::new(false),
                sessions: Mutex::new(HashMap::new()),
                pending_restore: Mutex::new(None),
                counters: Counters::default(),
                shutdown: CancellationToken::new(),
            }),
        };
        (manager, outcomes_rx)
    }

    pub fn policy(&self) -> &RecoveryPolicy {
        &self.inner.policy
    }

    pub fn sender(&self) -> LinkSender {
        LinkSender {
            slot: Arc::clone(&self.inner.slot),
        }
    }

    pub fn status(&self) -> watch::Receiver<LinkStatus> {
        self.inner.status.subscribe()
    }

    pub fn current_connection_id(&self) -> Option<u64> {
        read_slot(&self.inner.slot).map(|h| h.id())
    }

    /// Dial once with the full capability set and install the connection.
    pub async fn connect(&self) -> Result<u64> {
        let handle = self
            .inner
            .dialer
            .dial(CapabilityProfile::Full, self.inner.events.clone())
            .await?;
        let id = handle.id();
        if !self.install(handle) {
            return Err(PeerError::Disconnected(
                "connection closed during setup".to_string(),
            ));
        }
        Ok(id)
    }

    /// Start the recovery loop without a prior connection (for example
    /// after the first dial failed).
    pub fn begin_recovery(&self) {
        self.spawn_recovery();
    }

    /// React to a `Disconnected` event. Returns false for stale ids.
    pub fn handle_connection_loss(&self, connection_id: u64, reason: &DisconnectReason) -> bool {
        if self.inner.shutdown.is_cancelled() {
            return false;
        }
        let now = SystemTime::now();
        {
            let mut slot = self
                .inner
                .slot
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(handle) if handle.id() == connection_id => {
                    *slot = None;
                }
                _ => {
                    debug!(connection_id, "ignoring loss of a stale connection");
                    return false;
                }
            }
            self.inner.status.send_modify(|status| {
                status.connected = false;
                status.connection_id = None;
                status.last_disconnected = Some(now);
            });
        }

        self.inner.counters.connection_losses.fetch_add(1, Ordering::Relaxed);
        warn!(connection_id, %reason, "connection lost");

        let snapshot = self.inner.session.borrow().clone();
        if let Some(session_id) = snapshot.session_id {
            self.preserve_session(SessionPreservationRecord::new(
                session_id.clone(),
                snapshot.recording,
                now,
            ));
            *lock(&self.inner.pending_restore) = Some(session_id);
        }

        if self.inner.policy.auto_reconnect {
            self.spawn_recovery();
        } else {
            info!(connection_id, "automatic reconnect disabled");
        }
        true
    }

    /// Reset the attempt counter and restart recovery after a terminal stop.
    pub fn force_retry(&self) -> bool {
        if read_slot(&self.inner.slot).is_some() {
            debug!("force_retry ignored: already connected");
            return false;
        }
        info!("manual recovery forced");
        self.inner.attempts.store(0, Ordering::SeqCst);
        self.spawn_recovery()
    }

    pub fn preserve_session(&self, record: SessionPreservationRecord) {
        info!(session_id = %record.session_id, recording = record.recording_active, "session preserved");
        lock(&self.inner.sessions).insert(record.session_id.clone(), record);
    }

    pub fn restore_session(&self, session_id: &str) -> Option<SessionPreservationRecord> {
        self.restore_session_at(session_id, SystemTime::now())
    }

    /// Look up a preserved session as of `now`. Entries at or past the TTL
    /// are purged instead of returned.
    pub fn restore_session_at(
        &self,
        session_id: &str,
        now: SystemTime,
    ) -> Option<SessionPreservationRecord> {
        let mut sessions = lock(&self.inner.sessions);
        let record = sessions.get(session_id)?;
        let offline = now
            .duration_since(record.connection_lost_time)
            .unwrap_or_default();
        if offline < self.inner.policy.session_ttl {
            info!(session_id, offline_ms = offline.as_millis() as u64, "session restored");
            Some(record.clone())
        } else {
            sessions.remove(session_id);
            info!(session_id, "preserved session expired");
            None
        }
    }

    /// Drop every preserved session at or past the TTL. Returns how many went.
    pub fn purge_expired_sessions(&self, now: SystemTime) -> usize {
        let ttl = self.inner.policy.session_ttl;
        let mut sessions = lock(&self.inner.sessions);
        let before = sessions.len();
        sessions.retain(|_, record| {
            now.duration_since(record.connection_lost_time)
                .unwrap_or_default()
                < ttl
        });
        before - sessions.len()
    }

    pub fn stats(&self) -> RecoveryStats {
        let counters = &self.inner.counters;
        RecoveryStats {
            connection_losses: counters.connection_losses.load(Ordering::Relaxed),
            recovery_attempts: counters.recovery_attempts.load(Ordering::Relaxed),
            successful_recoveries: counters.successful_recoveries.load(Ordering::Relaxed),
            current_attempts: self.inner.attempts.load(Ordering::SeqCst),
            recovering: self.inner.recovering.load(Ordering::SeqCst),
            preserved_sessions: lock(&self.inner.sessions).len(),
        }
    }

    pub fn update_quality(&self, score: u8) {
        self.inner.status.send_if_modified(|status| {
            if status.quality == score {
                false
            } else {
                status.quality = score;
                true
            }
        });
    }

    /// Mirror a quality monitor's score into [`LinkStatus`] until shutdown.
    pub fn follow_quality(&self, mut scores: watch::Receiver<u8>) {
        let manager = self.clone();
        self.update_quality(*scores.borrow_and_update());
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = manager.inner.shutdown.cancelled() => break,
                    changed = scores.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let score = *scores.borrow_and_update();
                        manager.update_quality(score);
                    }
                }
            }
        });
    }

    /// Stop recovering and close the current connection.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        if let Some(handle) = write_slot(&self.inner.slot, None) {
            handle.disconnect();
        }
        self.inner.status.send_modify(|status| {
            status.connected = false;
            status.connection_id = None;
            status.phase = RecoveryPhase::Idle;
        });
    }

    /// Make `handle` the current connection. Returns false, leaving the
    /// slot untouched, if it already closed.
    ///
    /// The open check and the status update happen under the slot lock, so
    /// a loss either lands before this (and is seen here) or after it (and
    /// finds this connection current).
    fn install(&self, handle: ConnectionHandle) -> bool {
        let id = handle.id();
        let mut slot = self
            .inner
            .slot
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if !handle.is_open() {
            drop(slot);
            warn!(connection_id = id, "connection closed before it was installed");
            return false;
        }
        let old = slot.replace(handle);
        self.inner.attempts.store(0, Ordering::SeqCst);
        self.inner.status.send_modify(|status| {
            status.connected = true;
            status.connection_id = Some(id);
            status.attempts = 0;
            status.phase = RecoveryPhase::Idle;
            status.last_connected = Some(SystemTime::now());
        });
        drop(slot);

        if let Some(old) = old {
            old.disconnect();
        }
        info!(connection_id = id, "connection installed");
        true
    }

    fn spawn_recovery(&self) -> bool {
        if self.inner.shutdown.is_cancelled() || self.inner.recovering.swap(true, Ordering::SeqCst)
        {
            return false;
        }
        self.inner.status.send_modify(|status| {
            status.phase = RecoveryPhase::Recovering;
        });
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = manager.inner.shutdown.cancelled() => {}
                _ = manager.run_recovery() => {}
            }
            manager.inner.recovering.store(false, Ordering::SeqCst);
        });
        true
    }

    async fn run_recovery(&self) {
        let inner = &self.inner;
        loop {
            let attempt = inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            inner.status.send_modify(|status| status.attempts = attempt);

            let strategy = RecoveryStrategy::for_attempt(attempt);
            let profile = match strategy.profile() {
                Some(profile) if attempt <= inner.policy.max_attempts => profile,
                _ => {
                    error!(attempt, "automatic recovery exhausted, manual intervention required");
                    inner.status.send_modify(|status| {
                        status.phase = RecoveryPhase::ManualInterventionRequired;
                    });
                    let _ = inner
                        .outcomes
                        .send(RecoveryEvent::ManualInterventionRequired { attempts: attempt });
                    return;
                }
            };

            if strategy.waits_before_dial() {
                let delay = retry_delay(&inner.policy, attempt, SystemTime::now());
                debug!(attempt, ?strategy, delay_ms = delay.as_millis() as u64, "waiting before retry");
                tokio::time::sleep(delay).await;
            }

            inner.counters.recovery_attempts.fetch_add(1, Ordering::Relaxed);
            info!(attempt, ?strategy, ?profile, "reconnecting");
            match inner.dialer.dial(profile, inner.events.clone()).await {
                Ok(handle) => {
                    let connection_id = handle.id();
                    if !self.install(handle) {
                        continue;
                    }
                    inner.counters.successful_recoveries.fetch_add(1, Ordering::Relaxed);

                    let pending = lock(&inner.pending_restore).take();
                    let restored = pending.and_then(|id| self.restore_session(&id));
                    info!(connection_id, attempt, restored = restored.is_some(), "reconnected");
                    let _ = inner.outcomes.send(RecoveryEvent::Reconnected {
                        connection_id,
                        restored,
                    });
                    return;
                }
                Err(err) => {
                    warn!(attempt, %err, "reconnect attempt failed");
                }
            }
        }
    }
}

impl fmt::Debug for RecoveryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryManager")
            .field("policy", &self.inner.policy)
            .field("stats", &self.stats())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
