//! Outbox delivery sweep.
//!
//! A sweep runs in three phases so no row lock is held across network I/O:
//! claim a batch of due entries under a lease, POST each one to its matching
//! endpoints, then write all transitions in one short transaction guarded by
//! the attempt count seen at fetch. Entries left unattempted at the soft
//! limit are released back to their original schedule.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use courier_core::defaults::{
    DELIVERY_BATCH_SIZE, DELIVERY_CLAIM_LEASE_SECS, DELIVERY_SOFT_LIMIT_SECS, WEBHOOK_TIMEOUT_SECS,
};
use courier_core::{
    DeliveryStats, EndpointRepository, Error, OutboxEntry, OutboxRepository, OutboxStatus,
    OutboxTable, Result, RetryPolicy, WebhookEndpoint, WebhookTransport,
};

/// Delivery sweep settings.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Entries fetched per sweep.
    pub batch_size: i64,
    /// No new entry is started once this much time has elapsed.
    pub soft_limit: Duration,
    /// How long fetched entries stay invisible to other sweeps.
    pub claim_lease: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            batch_size: DELIVERY_BATCH_SIZE,
            soft_limit: Duration::from_secs(DELIVERY_SOFT_LIMIT_SECS),
            claim_lease: Duration::from_secs(DELIVERY_CLAIM_LEASE_SECS),
        }
    }
}

impl DeliveryConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `OUTBOX_DELIVERY_BATCH_SIZE` | `20` | Entries per sweep |
    /// | `OUTBOX_DELIVERY_SOFT_LIMIT_SECS` | `200` | Time budget per sweep |
    /// | `OUTBOX_DELIVERY_LEASE_SECS` | `300` | Claim held on fetched entries |
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let batch_size = std::env::var("OUTBOX_DELIVERY_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(defaults.batch_size)
            .max(1);

        let soft_limit = env_secs("OUTBOX_DELIVERY_SOFT_LIMIT_SECS").unwrap_or(defaults.soft_limit);
        let claim_lease = env_secs("OUTBOX_DELIVERY_LEASE_SECS").unwrap_or(defaults.claim_lease);

        Self {
            batch_size,
            soft_limit,
            claim_lease,
        }
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_soft_limit(mut self, soft_limit: Duration) -> Self {
        self.soft_limit = soft_limit;
        self
    }

    pub fn with_claim_lease(mut self, claim_lease: Duration) -> Self {
        self.claim_lease = claim_lease;
        self
    }

    /// Lease taken at fetch: the configured lease, but never shorter than the
    /// soft limit plus one request timeout.
    pub fn effective_lease(&self) -> Duration {
        self.claim_lease
            .max(self.soft_limit.saturating_add(Duration::from_secs(WEBHOOK_TIMEOUT_SECS)))
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Delivers due outbox entries to subscribed webhook endpoints.
#[derive(Clone)]
pub struct DeliverySweep {
    outbox: Arc<dyn OutboxRepository>,
    endpoints: Arc<dyn EndpointRepository>,
    transport: Arc<dyn WebhookTransport>,
    policy: RetryPolicy,
    config: DeliveryConfig,
}

impl DeliverySweep {
    pub fn new(
        outbox: Arc<dyn OutboxRepository>,
        endpoints: Arc<dyn EndpointRepository>,
        transport: Arc<dyn WebhookTransport>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            outbox,
            endpoints,
            transport,
            policy: RetryPolicy::default(),
            config,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Outbox table swept, as reported by the repository.
    pub fn table(&self) -> OutboxTable {
        self.outbox.table()
    }

    /// Run one sweep.
    #[instrument(
        skip(self),
        fields(subsystem = "outbox", component = "delivery", table = self.table().table_name())
    )]
    pub async fn run(&self) -> Result<DeliveryStats> {
        let start = Instant::now();
        let lease = chrono::Duration::from_std(self.config.effective_lease())
            .map_err(|e| Error::Config(format!("claim lease out of range: {}", e)))?;

        let entries = self
            .outbox
            .fetch_due(Utc::now(), self.config.batch_size, lease)
            .await?;

        if entries.is_empty() {
            debug!("No due outbox entries");
            return Ok(DeliveryStats {
                remaining: self.outbox.pending_count().await?,
                ..Default::default()
            });
        }

        let endpoints = match self.endpoints.list_active().await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                self.release(&entries).await;
                return Err(e);
            }
        };
        let mut transitions = Vec::with_capacity(entries.len());

        for entry in &entries {
            if start.elapsed() >= self.config.soft_limit {
                warn!(
                    attempted = transitions.len(),
                    fetched = entries.len(),
                    "Soft time limit reached, leaving remaining entries for the next sweep"
                );
                break;
            }

            let error = self.deliver_entry(&endpoints, entry).await;
            transitions.push(self.policy.transition(entry, error, Utc::now()));
        }

        let applied: HashSet<Uuid> = self
            .outbox
            .apply_transitions(&transitions)
            .await?
            .into_iter()
            .collect();

        let deferred = &entries[transitions.len()..];
        self.release(deferred).await;

        let mut stats = DeliveryStats {
            deferred: deferred.len(),
            ..Default::default()
        };
        for t in transitions.iter().filter(|t| applied.contains(&t.id)) {
            stats.processed += 1;
            match t.status {
                OutboxStatus::Delivered => stats.delivered += 1,
                OutboxStatus::Failed => stats.failed += 1,
                OutboxStatus::Pending => {}
            }
        }
        stats.skipped = transitions.len() - stats.processed;
        stats.remaining = self.outbox.pending_count().await?;

        info!(
            processed = stats.processed,
            delivered = stats.delivered,
            failed = stats.failed,
            skipped = stats.skipped,
            deferred = stats.deferred,
            remaining = stats.remaining,
            duration_ms = start.elapsed().as_millis() as u64,
            "Delivery sweep completed"
        );
        Ok(stats)
    }

    /// Hand unattempted entries back. On failure they stay claimed until the
    /// lease runs out.
    async fn release(&self, entries: &[OutboxEntry]) {
        if entries.is_empty() {
            return;
        }
        if let Err(e) = self.outbox.release(entries).await {
            warn!(
                error = %e,
                count = entries.len(),
                "Failed to release outbox entries, they stay claimed until the lease expires"
            );
        }
    }

    /// Deliver one entry to every matching endpoint.
    ///
    /// Returns `None` when all deliveries succeeded (or nothing matched),
    /// otherwise the per-endpoint errors joined.
    async fn deliver_entry(
        &self,
        endpoints: &[WebhookEndpoint],
        entry: &OutboxEntry,
    ) -> Option<String> {
        let mut errors = Vec::new();
        let mut matched = 0;

        for endpoint in endpoints.iter().filter(|e| e.matches(&entry.event_type)) {
            matched += 1;
            let result = self.transport.deliver(endpoint, entry).await;
            if !result.ok {
                errors.push(format!("{}: {}", endpoint.url, result.error));
            }
        }

        if matched == 0 {
            debug!(event_id = %entry.id, event_type = %entry.event_type, "No subscribed endpoints");
        }

        if errors.is_empty() {
            None
        } else {
            Some(errors.join("; "))
        }
    }
}
