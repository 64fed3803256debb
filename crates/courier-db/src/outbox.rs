//! Outbox repository: durable event store and emission API.
//!
//! Events are appended inside the caller's [`UnitOfWork`], so an event exists
//! if and only if the business change it describes committed. Delivery and
//! retention sweeps use the [`OutboxRepository`] operations, each in its own
//! short transaction.
//!
//! A fetch claims its rows by pushing `next_attempt_at` out by a lease, so
//! the HTTP phase runs without row locks yet no concurrent sweep can fetch
//! the same entry. The attempt-guarded update then settles each entry.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{postgres::PgRow, Pool, Postgres, Row};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use courier_core::{
    CleanupStats, EntryTransition, Error, NewOutboxEvent, NoopTrigger, OutboxEntry,
    OutboxRepository, OutboxStatus, OutboxStatusCounts, OutboxTable, Result, SweepTrigger,
};

use crate::unit_of_work::UnitOfWork;

const ENTRY_COLUMNS: &str = "id, aggregate_type, aggregate_id, event_type, payload, status, \
     idempotency_key, attempts, max_attempts, next_attempt_at, delivered_at, error_message, \
     created_at, updated_at";

/// PostgreSQL outbox repository.
#[derive(Clone)]
pub struct PgOutboxRepository {
    pool: Pool<Postgres>,
    table: OutboxTable,
    max_attempts: i32,
    trigger: Arc<dyn SweepTrigger>,
}

impl PgOutboxRepository {
    /// Repository over the generic outbox with no post-commit trigger.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            pool,
            table: OutboxTable::default(),
            max_attempts: courier_core::defaults::OUTBOX_MAX_ATTEMPTS,
            trigger: Arc::new(NoopTrigger),
        }
    }

    pub fn with_table(mut self, table: OutboxTable) -> Self {
        self.table = table;
        self
    }

    /// Trigger fired after every committed emission.
    pub fn with_trigger(mut self, trigger: Arc<dyn SweepTrigger>) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Append an event to the outbox inside `uow`.
    ///
    /// The entry is `pending` and due immediately. Once `uow` commits, the
    /// configured trigger is asked to schedule a delivery sweep; trigger
    /// failures are logged and never surface here.
    ///
    /// Fails with [`Error::DuplicateEvent`] when `(event_type,
    /// idempotency_key)` already exists. The insert runs under a savepoint,
    /// so `uow` stays usable after a duplicate.
    pub async fn emit(&self, uow: &mut UnitOfWork<'_>, event: NewOutboxEvent) -> Result<OutboxEntry> {
        let id = courier_core::new_v7();
        let now = Utc::now();
        let idempotency_key = event.resolved_idempotency_key();
        let payload = event.resolved_payload();

        let sql = format!(
            "INSERT INTO {} (id, aggregate_type, aggregate_id, event_type, payload, status,
                             idempotency_key, attempts, max_attempts, next_attempt_at,
                             error_message, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, 'pending', $6, 0, $7, $8, '', $8, $8)
             RETURNING {}",
            self.table.table_name(),
            ENTRY_COLUMNS
        );

        let mut savepoint = uow.savepoint().await?;
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(&event.aggregate_type)
            .bind(&event.aggregate_id)
            .bind(&event.event_type)
            .bind(&payload)
            .bind(&idempotency_key)
            .bind(self.max_attempts)
            .bind(now)
            .fetch_one(&mut *savepoint)
            .await
            .map_err(|e| map_insert_error(e, &event.event_type, &idempotency_key))?;
        savepoint.commit().await.map_err(Error::Database)?;

        let entry = parse_entry(&row)?;

        let trigger = self.trigger.clone();
        uow.on_commit(move || {
            if let Err(e) = trigger.schedule() {
                error!(
                    subsystem = "outbox",
                    component = "emission",
                    op = "schedule_delivery",
                    error = %e,
                    "Failed to schedule outbox delivery"
                );
            }
        });

        info!(
            subsystem = "outbox",
            component = "emission",
            op = "emit",
            table = self.table.table_name(),
            event_id = %entry.id,
            event_type = %entry.event_type,
            aggregate = %format!("{}:{}", entry.aggregate_type, entry.aggregate_id),
            "Outbox event emitted"
        );

        Ok(entry)
    }

    fn select_sql(&self, tail: &str) -> String {
        format!(
            "SELECT {} FROM {} {}",
            ENTRY_COLUMNS,
            self.table.table_name(),
            tail
        )
    }
}

#[async_trait]
impl OutboxRepository for PgOutboxRepository {
    fn table(&self) -> OutboxTable {
        self.table
    }

    async fn fetch_due(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        lease: Duration,
    ) -> Result<Vec<OutboxEntry>> {
        let sql = self.select_sql(
            "WHERE status = 'pending' AND next_attempt_at <= $1
             ORDER BY next_attempt_at, id
             LIMIT $2
             FOR UPDATE SKIP LOCKED",
        );
        let claim_sql = format!(
            "UPDATE {} SET next_attempt_at = $2, updated_at = now() WHERE id = ANY($1)",
            self.table.table_name()
        );
        let claimed_until = now
            .checked_add_signed(lease)
            .ok_or_else(|| Error::Config(format!("claim lease out of range: {}", lease)))?;

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(limit)
            .fetch_all(&mut *tx)
            .await
            .map_err(Error::Database)?;
        let entries = rows.iter().map(parse_entry).collect::<Result<Vec<_>>>()?;

        if !entries.is_empty() {
            let ids: Vec<Uuid> = entries.iter().map(|e| e.id).collect();
            sqlx::query(&claim_sql)
                .bind(&ids)
                .bind(claimed_until)
                .execute(&mut *tx)
                .await
                .map_err(Error::Database)?;
        }
        tx.commit().await.map_err(Error::Database)?;

        debug!(
            subsystem = "outbox",
            component = "store",
            op = "fetch_due",
            table = self.table.table_name(),
            limit,
            fetched = entries.len(),
            %claimed_until,
            "Claimed due outbox entries"
        );

        Ok(entries)
    }

    async fn release(&self, entries: &[OutboxEntry]) -> Result<u64> {
        if entries.is_empty() {
            return Ok(0);
        }

        let sql = format!(
            "UPDATE {} SET next_attempt_at = $2, updated_at = now()
             WHERE id = $1 AND status = 'pending' AND attempts = $3",
            self.table.table_name()
        );

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let mut released = 0u64;
        for entry in entries {
            released += sqlx::query(&sql)
                .bind(entry.id)
                .bind(entry.next_attempt_at)
                .bind(entry.attempts)
                .execute(&mut *tx)
                .await
                .map_err(Error::Database)?
                .rows_affected();
        }
        tx.commit().await.map_err(Error::Database)?;

        debug!(
            subsystem = "outbox",
            component = "store",
            op = "release",
            table = self.table.table_name(),
            requested = entries.len(),
            released,
            "Released unattempted outbox entries"
        );

        Ok(released)
    }

    async fn apply_transitions(&self, transitions: &[EntryTransition]) -> Result<Vec<Uuid>> {
        if transitions.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "UPDATE {} SET
                status = $2,
                attempts = $3,
                next_attempt_at = $4,
                delivered_at = COALESCE($5, delivered_at),
                error_message = $6,
                updated_at = now()
             WHERE id = $1 AND status = 'pending' AND attempts = $7",
            self.table.table_name()
        );

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let mut applied = Vec::with_capacity(transitions.len());
        for t in transitions {
            let result = sqlx::query(&sql)
                .bind(t.id)
                .bind(t.status.as_str())
                .bind(t.attempts)
                .bind(t.next_attempt_at)
                .bind(t.delivered_at)
                .bind(&t.error_message)
                .bind(t.previous_attempts)
                .execute(&mut *tx)
                .await
                .map_err(Error::Database)?;

            if result.rows_affected() == 0 {
                warn!(
                    subsystem = "outbox",
                    component = "store",
                    op = "apply_transitions",
                    event_id = %t.id,
                    attempts = t.previous_attempts,
                    "Outbox entry changed since fetch, transition skipped"
                );
            } else {
                applied.push(t.id);
            }
        }
        tx.commit().await.map_err(Error::Database)?;

        Ok(applied)
    }

    async fn pending_count(&self) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE status = 'pending'",
            self.table.table_name()
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(count)
    }

    async fn cleanup(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<CleanupStats> {
        let table = self.table.table_name();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let total: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} WHERE status IN ('delivered', 'failed') AND created_at < $1",
            table
        ))
        .bind(cutoff)
        .fetch_one(&mut *tx)
        .await
        .map_err(Error::Database)?;

        if total == 0 {
            tx.commit().await.map_err(Error::Database)?;
            return Ok(CleanupStats::default());
        }

        let deleted = sqlx::query(&format!(
            "DELETE FROM {table} WHERE id IN (
                SELECT id FROM {table}
                WHERE status IN ('delivered', 'failed') AND created_at < $1
                ORDER BY id
                LIMIT $2
             )",
            table = table
        ))
        .bind(cutoff)
        .bind(limit)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?
        .rows_affected();
        tx.commit().await.map_err(Error::Database)?;

        let stats = CleanupStats {
            deleted,
            remaining: (total as u64).saturating_sub(deleted),
        };

        info!(
            subsystem = "outbox",
            component = "store",
            op = "cleanup",
            table,
            deleted = stats.deleted,
            remaining = stats.remaining,
            "Cleaned up terminal outbox entries"
        );

        Ok(stats)
    }

    async fn requeue_failed(&self, ids: &[Uuid], now: DateTime<Utc>) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let sql = format!(
            "UPDATE {} SET
                status = 'pending',
                attempts = 0,
                next_attempt_at = $2,
                error_message = '',
                updated_at = now()
             WHERE id = ANY($1) AND status = 'failed'",
            self.table.table_name()
        );
        let requeued = sqlx::query(&sql)
            .bind(ids)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?
            .rows_affected();

        info!(
            subsystem = "outbox",
            component = "store",
            op = "requeue_failed",
            requested = ids.len(),
            requeued,
            "Re-queued failed outbox entries"
        );

        Ok(requeued)
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxEntry>> {
        let row = sqlx::query(&self.select_sql("WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.as_ref().map(parse_entry).transpose()
    }

    async fn list_recent(
        &self,
        status: Option<OutboxStatus>,
        limit: i64,
    ) -> Result<Vec<OutboxEntry>> {
        let rows = sqlx::query(&self.select_sql(
            "WHERE ($1::text IS NULL OR status = $1) ORDER BY id DESC LIMIT $2",
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter().map(parse_entry).collect()
    }

    async fn status_counts(&self) -> Result<OutboxStatusCounts> {
        let sql = format!(
            "SELECT status, COUNT(*) AS count FROM {} GROUP BY status",
            self.table.table_name()
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        let mut counts = OutboxStatusCounts::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(Error::Database)?;
            let count: i64 = row.try_get("count").map_err(Error::Database)?;
            match status.parse::<OutboxStatus>()? {
                OutboxStatus::Pending => counts.pending = count,
                OutboxStatus::Delivered => counts.delivered = count,
                OutboxStatus::Failed => counts.failed = count,
            }
        }
        Ok(counts)
    }
}

/// Map an insert failure, turning a unique violation into `DuplicateEvent`.
fn map_insert_error(err: sqlx::Error, event_type: &str, idempotency_key: &str) -> Error {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            return Error::DuplicateEvent {
                event_type: event_type.to_string(),
                idempotency_key: idempotency_key.to_string(),
            };
        }
    }
    Error::Database(err)
}

fn parse_entry(r: &PgRow) -> Result<OutboxEntry> {
    let status: String = r.try_get("status").map_err(Error::Database)?;
    Ok(OutboxEntry {
        id: r.try_get("id").map_err(Error::Database)?,
        aggregate_type: r.try_get("aggregate_type").map_err(Error::Database)?,
        aggregate_id: r.try_get("aggregate_id").map_err(Error::Database)?,
        event_type: r.try_get("event_type").map_err(Error::Database)?,
        payload: r.try_get("payload").map_err(Error::Database)?,
        status: status.parse()?,
        idempotency_key: r.try_get("idempotency_key").map_err(Error::Database)?,
        attempts: r.try_get("attempts").map_err(Error::Database)?,
        max_attempts: r.try_get("max_attempts").map_err(Error::Database)?,
        next_attempt_at: r.try_get("next_attempt_at").map_err(Error::Database)?,
        delivered_at: r.try_get("delivered_at").map_err(Error::Database)?,
        error_message: r.try_get("error_message").map_err(Error::Database)?,
        created_at: r.try_get("created_at").map_err(Error::Database)?,
        updated_at: r.try_get("updated_at").map_err(Error::Database)?,
    })
}
