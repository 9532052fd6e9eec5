//! Device-side runtime: connection, recovery, quality and command handling
//! wired together.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use synclink_peer::{
    event_queue, ChannelEvent, DisconnectReason, EventReceiver, LinkSettings, LinkStatus,
    QualityConfig, QualityMonitor, RecoveryEvent, RecoveryManager, RecoveryPolicy,
    SessionSnapshot, TcpDialer, TcpLatencyPing,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{DeviceError, Result};
use crate::processor::{Collaborators, CommandProcessor, ProcessorHandle};
use crate::transfer::{FileTransferEngine, TransferConfig};

/// How often expired preserved sessions are dropped.
const SESSION_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Everything the agent needs besides its collaborators.
#[derive(Debug, Clone, Default)]
pub struct AgentConfig {
    pub link: LinkSettings,
    pub recovery: RecoveryPolicy,
    pub quality: QualityConfig,
    pub transfer: TransferConfig,
    /// Run periodic latency pings against the controller.
    pub ping_quality: bool,
}

/// A running device agent.
///
/// Owns every background task; [`DeviceAgent::shutdown`] stops them all.
pub struct DeviceAgent {
    manager: RecoveryManager,
    processor: ProcessorHandle,
    quality: QualityMonitor,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl DeviceAgent {
    /// Start the agent and make the first connection attempt.
    ///
    /// If that attempt fails and `auto_reconnect` is set, the recovery loop
    /// takes over; otherwise the error is returned.
    pub async fn start(config: AgentConfig, collaborators: Collaborators) -> Result<Self> {
        config.link.validate()?;
        if config.transfer.chunk_size == 0 {
            return Err(DeviceError::Config("chunk_size must be non-zero".to_string()));
        }

        let cancel = CancellationToken::new();
        let (events, events_rx) = event_queue();
        let (session, session_rx) = watch::channel(SessionSnapshot::default());

        let quality = QualityMonitor::new(config.quality.clone());
        let dialer = TcpDialer::new(config.link.channel_config()?)
            .with_quality(quality.clone())
            .with_legacy_fallback(!config.link.use_legacy_port);
        let policy = RecoveryPolicy {
            auto_reconnect: config.link.auto_reconnect,
            ..config.recovery.clone()
        };
        let (manager, outcomes) =
            RecoveryManager::new(policy, Arc::new(dialer), events, session_rx);
        manager.follow_quality(quality.subscribe());

        let mut tasks = Vec::new();
        let sink = Arc::new(manager.sender());
        let (transfers, worker) =
            FileTransferEngine::start(config.transfer.clone(), sink.clone(), cancel.child_token());
        tasks.push(worker);

        let (processor, task) =
            CommandProcessor::spawn(collaborators, sink, transfers, session, cancel.child_token());
        tasks.push(task);

        if config.ping_quality {
            let ping = Arc::new(TcpLatencyPing::new(config.link.endpoint()));
            tasks.push(quality.start(ping, cancel.child_token()));
        }

        tasks.push(tokio::spawn(pump(
            manager.clone(),
            processor.clone(),
            events_rx,
            outcomes,
            cancel.child_token(),
        )));

        let agent = Self {
            manager,
            processor,
            quality,
            cancel,
            tasks,
        };

        match agent.manager.connect().await {
            Ok(connection_id) => {
                info!(connection_id, device_id = %config.link.device_id, "device agent connected");
            }
            Err(err) if config.link.auto_reconnect => {
                warn!(%err, "initial connection failed, recovering");
                agent.manager.begin_recovery();
            }
            Err(err) => {
                agent.shutdown().await;
                return Err(err.into());
            }
        }
        Ok(agent)
    }

    pub fn processor(&self) -> &ProcessorHandle {
        &self.processor
    }

    pub fn manager(&self) -> &RecoveryManager {
        &self.manager
    }

    pub fn quality(&self) -> &QualityMonitor {
        &self.quality
    }

    pub fn status(&self) -> watch::Receiver<LinkStatus> {
        self.manager.status()
    }

    /// Restart recovery after it gave up.
    pub fn force_retry(&self) -> bool {
        self.manager.force_retry()
    }

    /// Close the link and stop every task.
    pub async fn shutdown(self) {
        info!("device agent shutting down");
        self.manager.shutdown();
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    error!(%err, "device agent task failed");
                }
            }
        }
    }
}

async fn pump(
    manager: RecoveryManager,
    processor: ProcessorHandle,
    mut events: EventReceiver,
    mut outcomes: mpsc::UnboundedReceiver<RecoveryEvent>,
    cancel: CancellationToken,
) {
    let mut purge = tokio::time::interval(SESSION_PURGE_INTERVAL);
    purge.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => on_channel_event(&manager, &processor, event),
                None => break,
            },
            outcome = outcomes.recv() => match outcome {
                Some(outcome) => on_recovery_event(&processor, outcome),
                None => break,
            },
            _ = purge.tick() => {
                let purged = manager.purge_expired_sessions(SystemTime::now());
                if purged > 0 {
                    debug!(purged, "expired sessions dropped");
                }
            }
        }
    }
    debug!("device agent event pump stopped");
}

fn on_channel_event(
    manager: &RecoveryManager,
    processor: &ProcessorHandle,
    event: ChannelEvent,
) {
    match event {
        ChannelEvent::Message { message, .. } => {
            processor.message(message);
        }
        ChannelEvent::Disconnected { connection_id, reason } => {
            if manager.current_connection_id() != Some(connection_id) {
                debug!(connection_id, "ignoring disconnect of a replaced connection");
                return;
            }
            processor.connection_lost();
            if reason == DisconnectReason::Local {
                info!(connection_id, "connection closed locally");
                return;
            }
            manager.handle_connection_loss(connection_id, &reason);
        }
    }
}

fn on_recovery_event(processor: &ProcessorHandle, outcome: RecoveryEvent) {
    match outcome {
        RecoveryEvent::Reconnected {
            connection_id,
            restored,
        } => {
            info!(connection_id, restored = restored.is_some(), "link recovered");
            if let Some(record) = restored {
                processor.restore(record);
            }
        }
        RecoveryEvent::ManualInterventionRequired { attempts } => {
            error!(attempts, "automatic recovery exhausted, manual intervention required");
        }
    }
}
