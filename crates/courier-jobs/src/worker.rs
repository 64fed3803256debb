//! Sweep worker running delivery and retention on a schedule.
//!
//! Delivery runs every `delivery_interval` and whenever the shared trigger is
//! notified (an emitted event committed). Retention runs every
//! `retention_interval`, and the optional upload cleanup every
//! `upload_cleanup_interval`. Sweeps run one at a time on the worker task.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument};

use courier_core::defaults::{
    SWEEP_DELIVERY_INTERVAL_SECS, SWEEP_RETENTION_INTERVAL_SECS,
    SWEEP_UPLOAD_CLEANUP_INTERVAL_SECS, WORKER_EVENT_CAPACITY,
};
use courier_core::{CleanupStats, DeliveryStats, Error, NotifyTrigger, Result};

use crate::delivery::DeliverySweep;
use crate::retention::{RetentionSweep, UploadRetentionSweep};

/// Configuration for the sweep worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Whether sweeps run at all.
    pub enabled: bool,
    /// Period of the backstop delivery sweep.
    pub delivery_interval: Duration,
    /// Period of the retention sweep.
    pub retention_interval: Duration,
    /// Period of the expired-upload sweep, when one is attached.
    pub upload_cleanup_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delivery_interval: Duration::from_secs(SWEEP_DELIVERY_INTERVAL_SECS),
            retention_interval: Duration::from_secs(SWEEP_RETENTION_INTERVAL_SECS),
            upload_cleanup_interval: Duration::from_secs(SWEEP_UPLOAD_CLEANUP_INTERVAL_SECS),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `SWEEP_WORKER_ENABLED` | `true` | Enable/disable sweeps |
    /// | `SWEEP_DELIVERY_INTERVAL_SECS` | `60` | Periodic delivery sweep |
    /// | `SWEEP_RETENTION_INTERVAL_SECS` | `3600` | Periodic retention sweep |
    /// | `SWEEP_UPLOAD_CLEANUP_INTERVAL_SECS` | `21600` | Periodic upload cleanup |
    pub fn from_env() -> Self {
        let enabled = std::env::var("SWEEP_WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        Self {
            enabled,
            delivery_interval: interval_from_env(
                "SWEEP_DELIVERY_INTERVAL_SECS",
                SWEEP_DELIVERY_INTERVAL_SECS,
            ),
            retention_interval: interval_from_env(
                "SWEEP_RETENTION_INTERVAL_SECS",
                SWEEP_RETENTION_INTERVAL_SECS,
            ),
            upload_cleanup_interval: interval_from_env(
                "SWEEP_UPLOAD_CLEANUP_INTERVAL_SECS",
                SWEEP_UPLOAD_CLEANUP_INTERVAL_SECS,
            ),
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_delivery_interval(mut self, interval: Duration) -> Self {
        self.delivery_interval = interval;
        self
    }

    pub fn with_retention_interval(mut self, interval: Duration) -> Self {
        self.retention_interval = interval;
        self
    }

    pub fn with_upload_cleanup_interval(mut self, interval: Duration) -> Self {
        self.upload_cleanup_interval = interval;
        self
    }
}

/// Whole seconds from `name`, at least one.
fn interval_from_env(name: &str, default_secs: u64) -> Duration {
    let secs = std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default_secs)
        .max(1);
    Duration::from_secs(secs)
}

/// Which sweep an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepKind {
    Delivery,
    Retention,
    UploadCleanup,
}

impl SweepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SweepKind::Delivery => "delivery",
            SweepKind::Retention => "retention",
            SweepKind::UploadCleanup => "upload_cleanup",
        }
    }
}

/// Event emitted by the sweep worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// Worker started.
    WorkerStarted,
    DeliveryCompleted(DeliveryStats),
    RetentionCompleted(CleanupStats),
    UploadCleanupCompleted(CleanupStats),
    /// A sweep returned an error; the next tick retries.
    SweepFailed { sweep: SweepKind, error: String },
    /// Worker stopped.
    WorkerStopped,
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<WorkerEvent>,
}

impl WorkerHandle {
    /// Signal the worker to shut down after the sweep in progress.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }
}

/// Runs delivery and retention sweeps until shut down.
pub struct SweepWorker {
    delivery: DeliverySweep,
    retention: RetentionSweep,
    uploads: Option<UploadRetentionSweep>,
    config: WorkerConfig,
    wake: Arc<Notify>,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl SweepWorker {
    pub fn new(delivery: DeliverySweep, retention: RetentionSweep, config: WorkerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(WORKER_EVENT_CAPACITY);
        Self {
            delivery,
            retention,
            uploads: None,
            config,
            wake: Arc::new(Notify::new()),
            event_tx,
        }
    }

    /// Also expire upload rows every `upload_cleanup_interval`.
    pub fn with_upload_cleanup(mut self, sweep: UploadRetentionSweep) -> Self {
        self.uploads = Some(sweep);
        self
    }

    /// Trigger to hand to the outbox repository; each schedule wakes a delivery sweep.
    pub fn trigger(&self) -> NotifyTrigger {
        NotifyTrigger::from_notify(self.wake.clone())
    }

    /// Get a receiver for worker events. Subscribe before `start` to see every event.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Start the worker and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();

        tokio::spawn(async move {
            self.run(&mut shutdown_rx).await;
        });

        WorkerHandle {
            shutdown_tx,
            event_rx,
        }
    }

    /// Worker loop. The first tick of each interval fires immediately, so
    /// every sweep runs once at startup.
    #[instrument(skip(self, shutdown_rx), fields(subsystem = "outbox", component = "worker"))]
    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!("Sweep worker is disabled, not starting");
            return;
        }

        info!(
            delivery_interval_secs = self.config.delivery_interval.as_secs(),
            retention_interval_secs = self.config.retention_interval.as_secs(),
            upload_cleanup = self.uploads.is_some(),
            "Sweep worker started"
        );
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted);

        let mut delivery_tick = interval(self.config.delivery_interval);
        delivery_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut retention_tick = interval(self.config.retention_interval);
        retention_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut upload_tick = interval(self.config.upload_cleanup_interval);
        upload_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Sweep worker received shutdown signal");
                    break;
                }
                _ = self.wake.notified() => {
                    debug!("Delivery sweep triggered");
                    self.deliver().await;
                }
                _ = delivery_tick.tick() => {
                    self.deliver().await;
                }
                _ = retention_tick.tick() => {
                    self.cleanup().await;
                }
                _ = upload_tick.tick(), if self.uploads.is_some() => {
                    self.cleanup_uploads().await;
                }
            }
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!("Sweep worker stopped");
    }

    async fn deliver(&self) {
        let start = Instant::now();
        let event = match self.delivery.run().await {
            Ok(stats) => {
                debug!(
                    processed = stats.processed,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Delivery tick finished"
                );
                WorkerEvent::DeliveryCompleted(stats)
            }
            Err(e) => self.failed(SweepKind::Delivery, e),
        };
        let _ = self.event_tx.send(event);
    }

    async fn cleanup(&self) {
        let event = match self.retention.run().await {
            Ok(stats) => WorkerEvent::RetentionCompleted(stats),
            Err(e) => self.failed(SweepKind::Retention, e),
        };
        let _ = self.event_tx.send(event);
    }

    async fn cleanup_uploads(&self) {
        let Some(uploads) = &self.uploads else {
            return;
        };
        let event = match uploads.run().await {
            Ok(stats) => WorkerEvent::UploadCleanupCompleted(stats),
            Err(e) => self.failed(SweepKind::UploadCleanup, e),
        };
        let _ = self.event_tx.send(event);
    }

    fn failed(&self, sweep: SweepKind, e: Error) -> WorkerEvent {
        error!(sweep = sweep.as_str(), error = %e, "Sweep failed");
        WorkerEvent::SweepFailed {
            sweep,
            error: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::tests::{pending_entry, MemoryOutbox, RecordingTransport, StaticEndpoints};
    use crate::delivery::DeliveryConfig;
    use crate::retention::tests::MemoryUploads;
    use crate::retention::{RetentionConfig, UploadRetentionConfig};
    use async_trait::async_trait;
    use courier_core::{EndpointRepository, SweepTrigger, WebhookEndpoint};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn worker_with(
        outbox: Arc<MemoryOutbox>,
        endpoints: Arc<dyn EndpointRepository>,
        config: WorkerConfig,
    ) -> SweepWorker {
        let delivery = DeliverySweep::new(
            outbox.clone(),
            endpoints,
            Arc::new(RecordingTransport::default()),
            DeliveryConfig::default(),
        );
        let retention = RetentionSweep::new(outbox, RetentionConfig::default());
        SweepWorker::new(delivery, retention, config)
    }

    fn slow_config() -> WorkerConfig {
        WorkerConfig::default()
            .with_delivery_interval(Duration::from_secs(3600))
            .with_retention_interval(Duration::from_secs(3600))
    }

    async fn next_delivery(rx: &mut broadcast::Receiver<WorkerEvent>) -> DeliveryStats {
        loop {
            match timeout(WAIT, rx.recv()).await.unwrap().unwrap() {
                WorkerEvent::DeliveryCompleted(stats) => return stats,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_trigger_wakes_delivery_sweep() {
        let outbox = Arc::new(MemoryOutbox::default());
        let worker = worker_with(outbox.clone(), Arc::new(StaticEndpoints(vec![])), slow_config());
        let trigger = worker.trigger();
        let mut rx = worker.events();
        let handle = worker.start();

        // Startup sweep finds nothing.
        assert_eq!(next_delivery(&mut rx).await.processed, 0);

        outbox
            .entries
            .lock()
            .unwrap()
            .push(pending_entry("file.stored", 0));
        trigger.schedule().unwrap();

        let stats = next_delivery(&mut rx).await;
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.delivered, 1);

        handle.shutdown().await.unwrap();
        loop {
            if let WorkerEvent::WorkerStopped = timeout(WAIT, rx.recv()).await.unwrap().unwrap() {
                break;
            }
        }
    }

    struct BrokenEndpoints;

    #[async_trait]
    impl EndpointRepository for BrokenEndpoints {
        async fn list_active(&self) -> courier_core::Result<Vec<WebhookEndpoint>> {
            Err(Error::Internal("endpoint registry unavailable".into()))
        }
    }

    #[tokio::test]
    async fn test_sweep_error_is_reported_and_worker_keeps_running() {
        let outbox = Arc::new(MemoryOutbox::with_entries(vec![pending_entry("file.stored", 0)]));
        let worker = worker_with(outbox.clone(), Arc::new(BrokenEndpoints), slow_config());
        let trigger = worker.trigger();
        let mut rx = worker.events();
        let handle = worker.start();

        let failure = loop {
            if let WorkerEvent::SweepFailed { sweep, error } =
                timeout(WAIT, rx.recv()).await.unwrap().unwrap()
            {
                break (sweep, error);
            }
        };
        assert_eq!(failure.0, SweepKind::Delivery);
        assert!(failure.1.contains("endpoint registry unavailable"));

        // Still alive: a trigger produces another attempt.
        trigger.schedule().unwrap();
        loop {
            if let WorkerEvent::SweepFailed { .. } = timeout(WAIT, rx.recv()).await.unwrap().unwrap()
            {
                break;
            }
        }

        handle.shutdown().await.unwrap();
        assert_eq!(outbox.entries.lock().unwrap()[0].attempts, 0);
    }

    #[tokio::test]
    async fn test_disabled_worker_exits_without_sweeping() {
        let outbox = Arc::new(MemoryOutbox::with_entries(vec![pending_entry("file.stored", 0)]));
        let worker = worker_with(
            outbox.clone(),
            Arc::new(StaticEndpoints(vec![])),
            WorkerConfig::default().with_enabled(false),
        );
        let mut rx = worker.events();
        let _handle = worker.start();

        let result = timeout(WAIT, rx.recv()).await.unwrap();
        assert!(matches!(result, Err(broadcast::error::RecvError::Closed)));
        assert_eq!(outbox.entries.lock().unwrap()[0].attempts, 0);
    }

    #[tokio::test]
    async fn test_upload_cleanup_runs_at_startup() {
        let outbox = Arc::new(MemoryOutbox::default());
        let uploads = Arc::new(MemoryUploads::default());
        *uploads.files.lock().unwrap() = vec![
            chrono::Utc::now() - chrono::Duration::hours(48),
            chrono::Utc::now(),
        ];
        let worker = worker_with(outbox, Arc::new(StaticEndpoints(vec![])), slow_config())
            .with_upload_cleanup(UploadRetentionSweep::new(
                uploads.clone(),
                UploadRetentionConfig::default(),
            ));
        let mut rx = worker.events();
        let handle = worker.start();

        let stats = loop {
            if let WorkerEvent::UploadCleanupCompleted(stats) =
                timeout(WAIT, rx.recv()).await.unwrap().unwrap()
            {
                break stats;
            }
        };
        assert_eq!(stats, CleanupStats { deleted: 1, remaining: 0 });
        assert_eq!(uploads.files.lock().unwrap().len(), 1);

        handle.shutdown().await.unwrap();
    }

    #[test]
    fn test_worker_config_defaults() {
        let config = WorkerConfig::default();
        assert!(config.enabled);
        assert_eq!(config.delivery_interval, Duration::from_secs(60));
        assert_eq!(config.retention_interval, Duration::from_secs(3600));
        assert_eq!(config.upload_cleanup_interval, Duration::from_secs(21_600));
        assert_eq!(SweepKind::UploadCleanup.as_str(), "upload_cleanup");
    }
}
