//! Link quality scoring.
//!
//! Latency comes from short-lived connect pings that never touch the data
//! channel; bandwidth comes from the channel writer reporting each frame it
//! puts on the wire. Both feed bounded FIFO windows, and the composite score
//! is the lower of the two sub-scores.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use synclink_transport::Endpoint;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::sink::BoxFuture;

/// Quality monitor settings.
#[derive(Debug, Clone)]
pub struct QualityConfig {
    /// Time between assessments.
    pub interval: Duration,
    /// Connect pings per assessment.
    pub ping_count: usize,
    pub ping_spacing: Duration,
    /// A failed ping counts as this much latency.
    pub ping_timeout: Duration,
    pub bandwidth_window: usize,
    pub latency_window: usize,
    /// Assumed throughput before any frame has been sent.
    pub default_bandwidth_kbps: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            ping_count: 3,
            ping_spacing: Duration::from_millis(100),
            ping_timeout: Duration::from_secs(3),
            bandwidth_window: 5,
            latency_window: 5,
            default_bandwidth_kbps: 1000.0,
        }
    }
}

/// One latency measurement against the peer.
pub trait LatencyPing: Send + Sync {
    /// Round-trip time of one ping, or `None` if it failed or timed out.
    fn ping(&self, timeout: Duration) -> BoxFuture<'_, Option<Duration>>;
}

/// Pings by opening and dropping a TCP connection to the controller.
#[derive(Debug, Clone)]
pub struct TcpLatencyPing {
    endpoint: Endpoint,
}

impl TcpLatencyPing {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }
}

impl LatencyPing for TcpLatencyPing {
    fn ping(&self, timeout: Duration) -> BoxFuture<'_, Option<Duration>> {
        Box::pin(async move {
            match synclink_transport::ping(&self.endpoint, timeout).await {
                Ok(rtt) => Some(rtt),
                Err(err) => {
                    debug!(endpoint = %self.endpoint, %err, "latency ping failed");
                    None
                }
            }
        })
    }
}

/// Named quality bands for the composite score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QualityLevel {
    Bad = 1,
    Poor = 2,
    Fair = 3,
    Good = 4,
    Excellent = 5,
}

impl QualityLevel {
    pub fn from_score(score: u8) -> Self {
        match score {
            5..=u8::MAX => QualityLevel::Excellent,
            4 => QualityLevel::Good,
            3 => QualityLevel::Fair,
            2 => QualityLevel::Poor,
            _ => QualityLevel::Bad,
        }
    }

    pub fn score(self) -> u8 {
        self as u8
    }

    pub fn label(self) -> &'static str {
        match self {
            QualityLevel::Excellent => "excellent",
            QualityLevel::Good => "good",
            QualityLevel::Fair => "fair",
            QualityLevel::Poor => "poor",
            QualityLevel::Bad => "bad",
        }
    }
}

impl fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

pub fn latency_score(latency_ms: f64) -> u8 {
    if latency_ms <= 50.0 {
        5
    } else if latency_ms <= 100.0 {
        4
    } else if latency_ms <= 200.0 {
        3
    } else if latency_ms <= 500.0 {
        2
    } else {
        1
    }
}

pub fn bandwidth_score(kbps: f64) -> u8 {
    if kbps >= 2000.0 {
        5
    } else if kbps >= 1000.0 {
        4
    } else if kbps >= 500.0 {
        3
    } else if kbps >= 100.0 {
        2
    } else {
        1
    }
}

/// Composite score. With no latency measured yet only bandwidth counts.
pub fn quality_score(latency_ms: Option<f64>, bandwidth_kbps: f64) -> u8 {
    let bandwidth = bandwidth_score(bandwidth_kbps);
    match latency_ms {
        Some(ms) => latency_score(ms).min(bandwidth),
        None => bandwidth,
    }
}

/// Point-in-time view of the windows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualitySample {
    /// Average of the most recent round.
    pub latency_ms: Option<f64>,
    pub bandwidth_kbps: f64,
    pub score: u8,
    pub at: SystemTime,
}

struct Windows {
    bandwidth: VecDeque<f64>,
    /// Recent round averages, kept for diagnostics.
    latency: VecDeque<f64>,
    /// Average of the most recent round; this is what gets scored.
    last_latency: Option<f64>,
}

impl Windows {
    fn bandwidth_or(&self, default_kbps: f64) -> f64 {
        average(&self.bandwidth).unwrap_or(default_kbps)
    }
}

fn push_bounded(window: &mut VecDeque<f64>, cap: usize, value: f64) {
    window.push_back(value);
    while window.len() > cap.max(1) {
        window.pop_front();
    }
}

fn average(window: &VecDeque<f64>) -> Option<f64> {
    if window.is_empty() {
        None
    } else {
        Some(window.iter().sum::<f64>() / window.len() as f64)
    }
}

struct Inner {
    config: QualityConfig,
    windows: Mutex<Windows>,
    score: watch::Sender<u8>,
}

/// Shared quality state. Clones observe and feed the same windows.
#[derive(Clone)]
pub struct QualityMonitor {
    inner: Arc<Inner>,
}

impl QualityMonitor {
    pub fn new(config: QualityConfig) -> Self {
        let initial = quality_score(None, config.default_bandwidth_kbps);
        let (score, _) = watch::channel(initial);
        Self {
            inner: Arc::new(Inner {
                windows: Mutex::new(Windows {
                    bandwidth: VecDeque::with_capacity(config.bandwidth_window),
                    latency: VecDeque::with_capacity(config.latency_window),
                    last_latency: None,
                }),
                config,
                score,
            }),
        }
    }

    /// Receiver that observes a new value only when the composite score changes.
    pub fn subscribe(&self) -> watch::Receiver<u8> {
        self.inner.score.subscribe()
    }

    pub fn score(&self) -> u8 {
        *self.inner.score.borrow()
    }

    pub fn level(&self) -> QualityLevel {
        QualityLevel::from_score(self.score())
    }

    pub fn config(&self) -> &QualityConfig {
        &self.inner.config
    }

    /// Record one frame of `bytes` sent `elapsed` after the previous one.
    pub fn record_transmission(&self, bytes: usize, elapsed: Duration) {
        let micros = elapsed.as_micros();
        if bytes == 0 || micros == 0 {
            return;
        }
        // bits per millisecond == kilobits per second
        let kbps = bytes as f64 * 8.0 * 1000.0 / micros as f64;
        self.update(|windows, config| {
            push_bounded(&mut windows.bandwidth, config.bandwidth_window, kbps)
        });
    }

    /// Record one averaged latency measurement.
    pub fn record_latency(&self, latency: Duration) {
        let ms = latency.as_micros() as f64 / 1000.0;
        self.update(|windows, config| {
            push_bounded(&mut windows.latency, config.latency_window, ms);
            windows.last_latency = Some(ms);
        });
    }

    /// Recent round averages, oldest first.
    pub fn latency_history(&self) -> Vec<f64> {
        self.lock().latency.iter().copied().collect()
    }

    pub fn sample(&self) -> QualitySample {
        let windows = self.lock();
        let latency_ms = windows.last_latency;
        let bandwidth_kbps = windows.bandwidth_or(self.inner.config.default_bandwidth_kbps);
        QualitySample {
            latency_ms,
            bandwidth_kbps,
            score: quality_score(latency_ms, bandwidth_kbps),
            at: SystemTime::now(),
        }
    }

    /// Run one ping round and fold its average into the latency window.
    pub async fn assess_once(&self, ping: &dyn LatencyPing) -> u8 {
        let config = &self.inner.config;
        let count = config.ping_count.max(1);
        let mut total = Duration::ZERO;
        for i in 0..count {
            if i > 0 {
                tokio::time::sleep(config.ping_spacing).await;
            }
            total += ping
                .ping(config.ping_timeout)
                .await
                .unwrap_or(config.ping_timeout);
        }
        self.record_latency(total / count as u32);
        self.score()
    }

    /// Spawn the periodic assessment loop.
    pub fn start(&self, ping: Arc<dyn LatencyPing>, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.inner.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        // a round can take seconds when the controller is unreachable
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            score = monitor.assess_once(ping.as_ref()) => {
                                debug!(score, "quality assessed");
                            }
                        }
                    }
                }
            }
            debug!("quality monitor stopped");
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Windows> {
        self.inner
            .windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, apply: impl FnOnce(&mut Windows, &QualityConfig)) {
        let new_score = {
            let mut windows = self.lock();
            apply(&mut windows, &self.inner.config);
            quality_score(
                windows.last_latency,
                windows.bandwidth_or(self.inner.config.default_bandwidth_kbps),
            )
        };
        let changed = self.inner.score.send_if_modified(|current| {
            if *current == new_score {
                false
            } else {
                *current = new_score;
                true
            }
        });
        if changed {
            info!(
                score = new_score,
                level = %QualityLevel::from_score(new_score),
                "link quality changed"
            );
        }
    }
}

impl fmt::Debug for QualityMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QualityMonitor")
            .field("score", &self.score())
            .field("config", &self.inner.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Replays a fixed sequence of ping results.
    struct ScriptedPing {
        results: Vec<Option<Duration>>,
        calls: AtomicUsize,
    }

    impl ScriptedPing {
        fn new(results: Vec<Option<Duration>>) -> Self {
            Self {
                results,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl LatencyPing for ScriptedPing {
        fn ping(&self, _timeout: Duration) -> BoxFuture<'_, Option<Duration>> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            let result = self.results[i % self.results.len()];
            Box::pin(async move { result })
        }
    }

    #[test]
    fn latency_thresholds() {
        assert_eq!(latency_score(10.0), 5);
        assert_eq!(latency_score(50.0), 5);
        assert_eq!(latency_score(50.1), 4);
        assert_eq!(latency_score(100.0), 4);
        assert_eq!(latency_score(200.0), 3);
        assert_eq!(latency_score(500.0), 2);
        assert_eq!(latency_score(501.0), 1);
    }

    #[test]
    fn bandwidth_thresholds() {
        assert_eq!(bandwidth_score(5000.0), 5);
        assert_eq!(bandwidth_score(2000.0), 5);
        assert_eq!(bandwidth_score(1999.0), 4);
        assert_eq!(bandwidth_score(1000.0), 4);
        assert_eq!(bandwidth_score(500.0), 3);
        assert_eq!(bandwidth_score(100.0), 2);
        assert_eq!(bandwidth_score(99.0), 1);
    }

    #[test]
    fn composite_is_the_minimum() {
        assert_eq!(quality_score(Some(20.0), 50.0), 1);
        assert_eq!(quality_score(Some(600.0), 5000.0), 1);
        assert_eq!(quality_score(Some(80.0), 700.0), 3);
        assert_eq!(quality_score(None, 1000.0), 4);
    }

    #[test]
    fn default_bandwidth_before_any_traffic() {
        let monitor = QualityMonitor::new(QualityConfig::default());
        let sample = monitor.sample();
        assert_eq!(sample.bandwidth_kbps, 1000.0);
        assert_eq!(sample.latency_ms, None);
        assert_eq!(monitor.score(), 4);
        assert_eq!(monitor.level(), QualityLevel::Good);
    }

    #[test]
    fn windows_evict_oldest_first() {
        let monitor = QualityMonitor::new(QualityConfig::default());
        monitor.record_latency(Duration::from_millis(1000));
        for i in 1..=5 {
            monitor.record_latency(Duration::from_millis(10 * i));
        }
        assert_eq!(
            monitor.latency_history(),
            vec![10.0, 20.0, 30.0, 40.0, 50.0]
        );
        assert_eq!(monitor.sample().latency_ms, Some(50.0));

        // 12.5 KB in 100 ms = 1000 kbps
        for _ in 0..3 {
            monitor.record_transmission(12_500, Duration::from_millis(100));
        }
        for _ in 0..5 {
            monitor.record_transmission(25_000, Duration::from_millis(100));
        }
        assert_eq!(monitor.sample().bandwidth_kbps, 2000.0);
        assert_eq!(monitor.score(), 5);
    }

    #[test]
    fn listeners_notified_only_on_score_change() {
        let monitor = QualityMonitor::new(QualityConfig::default());
        let mut rx = monitor.subscribe();
        assert!(!rx.has_changed().unwrap());

        // Stays at 4: no notification.
        monitor.record_latency(Duration::from_millis(20));
        assert!(!rx.has_changed().unwrap());

        monitor.record_latency(Duration::from_millis(900));
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 1);

        monitor.record_latency(Duration::from_millis(700));
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn rising_latency_lowers_the_score_round_by_round() {
        let monitor = QualityMonitor::new(QualityConfig::default());
        // 500 bytes in 1 ms = 4000 kbps
        for _ in 0..5 {
            monitor.record_transmission(500, Duration::from_millis(1));
        }
        assert_eq!(monitor.sample().bandwidth_kbps, 4000.0);

        let mut scores = Vec::new();
        for ms in [40, 150, 600] {
            monitor.record_latency(Duration::from_millis(ms));
            scores.push(monitor.score());
        }
        assert_eq!(scores, vec![5, 3, 1]);
        assert_eq!(monitor.latency_history(), vec![40.0, 150.0, 600.0]);
    }

    #[test]
    fn zero_elapsed_transmissions_are_ignored() {
        let monitor = QualityMonitor::new(QualityConfig::default());
        monitor.record_transmission(1000, Duration::ZERO);
        monitor.record_transmission(0, Duration::from_millis(5));
        assert_eq!(monitor.sample().bandwidth_kbps, 1000.0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_pings_count_as_timeout() {
        let monitor = QualityMonitor::new(QualityConfig::default());
        let ping = ScriptedPing::new(vec![
            Some(Duration::from_millis(30)),
            None,
            Some(Duration::from_millis(30)),
        ]);

        let score = monitor.assess_once(&ping).await;
        // (30 + 3000 + 30) / 3 = 1020 ms
        assert_eq!(monitor.sample().latency_ms, Some(1020.0));
        assert_eq!(score, 1);
        assert_eq!(ping.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_loop_runs_until_cancelled() {
        let monitor = QualityMonitor::new(QualityConfig::default());
        let ping = Arc::new(ScriptedPing::new(vec![Some(Duration::from_millis(10))]));
        let cancel = CancellationToken::new();

        let handle = monitor.start(ping.clone(), cancel.clone());
        tokio::time::sleep(Duration::from_secs(11)).await;
        cancel.cancel();
        handle.await.unwrap();

        // Immediate first tick, then at 5 s and 10 s.
        assert_eq!(ping.calls.load(Ordering::SeqCst), 9);
        assert_eq!(monitor.sample().latency_ms, Some(10.0));
    }

    /// Never answers; each ping waits out its timeout.
    struct SilentPing;

    impl LatencyPing for SilentPing {
        fn ping(&self, timeout: Duration) -> BoxFuture<'_, Option<Duration>> {
            Box::pin(async move {
                tokio::time::sleep(timeout).await;
                None
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_a_round_in_progress() {
        let monitor = QualityMonitor::new(QualityConfig::default());
        let cancel = CancellationToken::new();

        let handle = monitor.start(Arc::new(SilentPing), cancel.clone());
        // first ping of the immediate round is still waiting on its timeout
        tokio::time::sleep(Duration::from_secs(1)).await;
        let started = tokio::time::Instant::now();
        cancel.cancel();
        handle.await.unwrap();

        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(monitor.sample().latency_ms, None);
        assert!(monitor.latency_history().is_empty());
    }

    #[test]
    fn levels_and_labels() {
        assert_eq!(QualityLevel::from_score(5), QualityLevel::Excellent);
        assert_eq!(QualityLevel::from_score(0), QualityLevel::Bad);
        assert_eq!(QualityLevel::Fair.score(), 3);
        assert_eq!(QualityLevel::Poor.to_string(), "poor");
    }
}
