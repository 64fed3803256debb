//! Core traits for courier abstractions.
//!
//! These traits define the seams between the sweeps and their collaborators
//! (outbox storage, upload storage, endpoint registry, HTTP transport, job
//! trigger), so the
//! sweep logic can be exercised without PostgreSQL or a network.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// OUTBOX REPOSITORY
// =============================================================================

/// Storage operations used by the delivery and retention sweeps.
///
/// Emission is not part of this trait: it needs the caller's transaction and
/// lives on the concrete PostgreSQL repository.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Physical table this repository reads and writes.
    fn table(&self) -> OutboxTable;

    /// Claim up to `limit` due pending entries.
    ///
    /// Rows locked by a concurrent fetch are skipped. Claimed rows get
    /// `next_attempt_at = now + lease` before the lock is released, so no
    /// other sweep sees them as due while this one delivers. The entries are
    /// returned as they were before the claim.
    async fn fetch_due(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        lease: Duration,
    ) -> Result<Vec<OutboxEntry>>;

    /// Give unattempted claimed entries back their pre-claim schedule.
    ///
    /// Guarded like [`apply_transitions`](Self::apply_transitions). Returns
    /// rows changed.
    async fn release(&self, entries: &[OutboxEntry]) -> Result<u64>;

    /// Write sweep transitions in one transaction.
    ///
    /// Each write only applies if the entry is still pending with the attempt
    /// count seen at fetch time. Returns the ids of the entries updated.
    async fn apply_transitions(&self, transitions: &[EntryTransition]) -> Result<Vec<Uuid>>;

    /// Count of pending entries (due or not).
    async fn pending_count(&self) -> Result<i64>;

    /// Delete up to `limit` terminal entries created before `cutoff`.
    async fn cleanup(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<CleanupStats>;

    /// Reset `failed` entries to `pending` with zero attempts. Returns rows changed.
    async fn requeue_failed(&self, ids: &[Uuid], now: DateTime<Utc>) -> Result<u64>;

    /// Get an entry by ID.
    async fn get(&self, id: Uuid) -> Result<Option<OutboxEntry>>;

    /// Most recent entries first, optionally filtered by status.
    async fn list_recent(&self, status: Option<OutboxStatus>, limit: i64)
        -> Result<Vec<OutboxEntry>>;

    /// Entry counts per status.
    async fn status_counts(&self) -> Result<OutboxStatusCounts>;
}

// =============================================================================
// UPLOAD CLEANUP
// =============================================================================

/// Expiry of upload tracking rows.
#[async_trait]
pub trait UploadCleanup: Send + Sync {
    /// Delete up to `limit` upload files created before `cutoff`, oldest id
    /// first. Their sessions and parts go with them.
    async fn cleanup_expired_files(&self, cutoff: DateTime<Utc>, limit: i64)
        -> Result<CleanupStats>;
}

// =============================================================================
// WEBHOOK TRAITS
// =============================================================================

/// Read access to webhook endpoints for the delivery sweep.
#[async_trait]
pub trait EndpointRepository: Send + Sync {
    /// All active endpoints, regardless of subscription.
    async fn list_active(&self) -> Result<Vec<WebhookEndpoint>>;
}

/// Sends one outbox entry to one endpoint.
///
/// Implementations never return transport failures as `Err`; they are
/// reported in the `DeliveryResult`.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn deliver(&self, endpoint: &WebhookEndpoint, entry: &OutboxEntry) -> DeliveryResult;
}

// =============================================================================
// JOB TRIGGER
// =============================================================================

/// Asks the job executor to run a delivery sweep soon.
///
/// Scheduling is best-effort; the periodic sweep delivers anything a missed
/// trigger leaves behind.
pub trait SweepTrigger: Send + Sync {
    fn schedule(&self) -> Result<()>;
}
