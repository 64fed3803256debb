//! Upload repository: batches, files, chunked sessions and parts.
//!
//! Every state change is a conditional `UPDATE ... WHERE status = <expected>`;
//! a miss is reported as [`Error::InvalidTransition`] (or `NotFound`), never
//! silently ignored. File lifecycle events are emitted through the outbox in
//! the same unit of work as the change they describe.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgConnection, Pool, Postgres, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use courier_core::{
    derive_batch_status, is_sha256_hex, total_parts, validate_upload, CleanupStats, Error,
    NewOutboxEvent, NewUploadFile, NewUploadPart, PayloadBuilder, Result, UploadBatch,
    UploadBatchStatus, UploadCleanup, UploadFile, UploadFileStatus, UploadPart, UploadPolicy,
    UploadSession, UploadSessionStatus,
};

use crate::outbox::PgOutboxRepository;
use crate::unit_of_work::UnitOfWork;

const BATCH_COLUMNS: &str = "id, created_by, status, idempotency_key, created_at, updated_at";

const FILE_COLUMNS: &str = "id, batch_id, uploaded_by, original_filename, content_type, \
     size_bytes, sha256, metadata, status, error_message, created_at, updated_at";

const SESSION_COLUMNS: &str = "id, file_id, status, chunk_size_bytes, total_size_bytes, \
     total_parts, bytes_received, completed_parts, idempotency_key, upload_token, \
     created_at, updated_at";

const PART_COLUMNS: &str = "id, session_id, part_number, offset_bytes, size_bytes, sha256, \
     status, temp_storage_key, created_at, updated_at";

/// Event types emitted by the upload tracker.
pub mod events {
    pub const FILE_STORED: &str = "file.stored";
    pub const FILE_PROCESSED: &str = "file.processed";
    pub const FILE_FAILED: &str = "file.failed";
    pub const BATCH_FINALIZED: &str = "batch.finalized";
}

/// PostgreSQL upload repository.
#[derive(Clone)]
pub struct PgUploadRepository {
    pool: Pool<Postgres>,
    outbox: PgOutboxRepository,
    policy: UploadPolicy,
}

impl PgUploadRepository {
    /// Repository emitting lifecycle events through `outbox`.
    pub fn new(pool: Pool<Postgres>, outbox: PgOutboxRepository) -> Self {
        Self {
            pool,
            outbox,
            policy: UploadPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: UploadPolicy) -> Self {
        self.policy = policy;
        self
    }

    // =========================================================================
    // BATCHES
    // =========================================================================

    /// Create a batch in `init`.
    pub async fn create_batch(
        &self,
        created_by: Option<Uuid>,
        idempotency_key: Option<String>,
    ) -> Result<UploadBatch> {
        let id = courier_core::new_v7();
        let row = sqlx::query(&format!(
            "INSERT INTO upload_batch (id, created_by, status, idempotency_key, created_at, updated_at)
             VALUES ($1, $2, 'init', $3, $4, $4)
             RETURNING {}",
            BATCH_COLUMNS
        ))
        .bind(id)
        .bind(created_by)
        .bind(idempotency_key.unwrap_or_default())
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        parse_batch(&row)
    }

    pub async fn get_batch(&self, id: Uuid) -> Result<Option<UploadBatch>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM upload_batch WHERE id = $1",
            BATCH_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.as_ref().map(parse_batch).transpose()
    }

    /// Move a batch from `init` to `in_progress`.
    pub async fn start_batch(&self, id: Uuid) -> Result<UploadBatch> {
        let row = sqlx::query(&format!(
            "UPDATE upload_batch SET status = 'in_progress', updated_at = now()
             WHERE id = $1 AND status = 'init'
             RETURNING {}",
            BATCH_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        match row {
            Some(row) => parse_batch(&row),
            None => Err(self
                .transition_miss("upload_batch", id, UploadBatchStatus::Init.as_str())
                .await),
        }
    }

    /// Files attached to a batch, oldest first.
    pub async fn list_batch_files(&self, batch_id: Uuid) -> Result<Vec<UploadFile>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM upload_file WHERE batch_id = $1 ORDER BY id",
            FILE_COLUMNS
        ))
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter().map(parse_file).collect()
    }

    /// Derive and persist a batch's status from its files.
    ///
    /// Emits `batch.finalized` only when the status changes. Calling it again
    /// with unchanged files is a no-op.
    pub async fn finalize_batch(&self, batch_id: Uuid) -> Result<UploadBatchStatus> {
        let mut uow = UnitOfWork::begin(&self.pool).await?;

        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM upload_batch WHERE id = $1 FOR UPDATE")
                .bind(batch_id)
                .fetch_optional(uow.conn())
                .await
                .map_err(Error::Database)?;
        let current: UploadBatchStatus = current
            .ok_or_else(|| Error::NotFound(format!("upload_batch {}", batch_id)))?
            .parse()?;

        let statuses: Vec<String> =
            sqlx::query_scalar("SELECT status FROM upload_file WHERE batch_id = $1 ORDER BY id")
                .bind(batch_id)
                .fetch_all(uow.conn())
                .await
                .map_err(Error::Database)?;
        let statuses = statuses
            .iter()
            .map(|s| s.parse::<UploadFileStatus>())
            .collect::<Result<Vec<_>>>()?;

        let derived = derive_batch_status(&statuses);
        if derived == current {
            uow.commit().await?;
            debug!(
                subsystem = "uploads",
                component = "batch",
                op = "finalize_batch",
                batch_id = %batch_id,
                status = derived.as_str(),
                "Batch status unchanged"
            );
            return Ok(derived);
        }

        sqlx::query("UPDATE upload_batch SET status = $2, updated_at = now() WHERE id = $1")
            .bind(batch_id)
            .bind(derived.as_str())
            .execute(uow.conn())
            .await
            .map_err(Error::Database)?;

        let succeeded = statuses.iter().filter(|s| s.is_success()).count();
        let failed = statuses
            .iter()
            .filter(|s| **s == UploadFileStatus::Failed)
            .count();
        let event = NewOutboxEvent::new("UploadBatch", batch_id.to_string(), events::BATCH_FINALIZED)
            .with_payload(
                PayloadBuilder::new()
                    .field("batch_id", batch_id)
                    .field("status", derived)
                    .field("previous_status", current)
                    .field("file_count", statuses.len())
                    .field("succeeded", succeeded)
                    .field("failed", failed)
                    .build(),
            )
            .with_idempotency_key(format!("UploadBatch:{}:{}", batch_id, derived.as_str()));

        match self.outbox.emit(&mut uow, event).await {
            Ok(_) => {}
            // The batch already reached this status once and was announced.
            Err(e) if e.is_duplicate_event() => {
                debug!(
                    subsystem = "uploads",
                    component = "batch",
                    op = "finalize_batch",
                    batch_id = %batch_id,
                    status = derived.as_str(),
                    "Batch finalization already announced"
                );
            }
            Err(e) => return Err(e),
        }

        uow.commit().await?;

        info!(
            subsystem = "uploads",
            component = "batch",
            op = "finalize_batch",
            batch_id = %batch_id,
            from = current.as_str(),
            to = derived.as_str(),
            file_count = statuses.len(),
            "Batch finalized"
        );
        Ok(derived)
    }

    // =========================================================================
    // FILES
    // =========================================================================

    /// Register a file after validating its name and size.
    ///
    /// Files failing validation are stored as `failed` with the reason and a
    /// `file.failed` event, rather than rejected. Accepted files start in
    /// `uploading`.
    pub async fn create_file(&self, req: NewUploadFile) -> Result<UploadFile> {
        if let Some(sha) = req.sha256.as_deref() {
            if !sha.is_empty() && !is_sha256_hex(sha) {
                return Err(Error::InvalidInput(format!("malformed sha256: {}", sha)));
            }
        }

        let validation = validate_upload(&req.original_filename, req.size_bytes, &self.policy);
        let (status, error_message, content_type) = match &validation.rejection {
            None => (
                UploadFileStatus::Uploading,
                String::new(),
                validation.content_type.clone(),
            ),
            Some(reason) => (
                UploadFileStatus::Failed,
                reason.clone(),
                req.content_type
                    .clone()
                    .unwrap_or_else(|| validation.content_type.clone()),
            ),
        };

        let mut uow = UnitOfWork::begin(&self.pool).await?;
        let row = sqlx::query(&format!(
            "INSERT INTO upload_file (id, batch_id, uploaded_by, original_filename, content_type,
                                      size_bytes, sha256, metadata, status, error_message,
                                      created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11)
             RETURNING {}",
            FILE_COLUMNS
        ))
        .bind(courier_core::new_v7())
        .bind(req.batch_id)
        .bind(req.uploaded_by)
        .bind(&req.original_filename)
        .bind(&content_type)
        .bind(req.size_bytes.max(0))
        .bind(req.sha256.clone().unwrap_or_default())
        .bind(req.metadata.clone().unwrap_or_else(|| serde_json::json!({})))
        .bind(status.as_str())
        .bind(&error_message)
        .bind(Utc::now())
        .fetch_one(uow.conn())
        .await
        .map_err(|e| map_reference_error(e, "upload_batch", req.batch_id))?;
        let file = parse_file(&row)?;

        if status == UploadFileStatus::Failed {
            self.outbox
                .emit(&mut uow, file_event(&file, events::FILE_FAILED, None))
                .await?;
            uow.commit().await?;
            warn!(
                subsystem = "uploads",
                component = "file",
                op = "create_file",
                file_id = %file.id,
                filename = %file.original_filename,
                error = %error_message,
                "Upload failed validation"
            );
        } else {
            uow.commit().await?;
            info!(
                subsystem = "uploads",
                component = "file",
                op = "create_file",
                file_id = %file.id,
                filename = %file.original_filename,
                size_bytes = file.size_bytes,
                content_type = %file.content_type,
                "Upload file created"
            );
        }

        Ok(file)
    }

    pub async fn get_file(&self, id: Uuid) -> Result<Option<UploadFile>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM upload_file WHERE id = $1",
            FILE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.as_ref().map(parse_file).transpose()
    }

    /// `uploading → stored` for single-shot uploads. Emits `file.stored`.
    pub async fn mark_file_stored(&self, file_id: Uuid) -> Result<UploadFile> {
        self.transition_file(
            file_id,
            &[UploadFileStatus::Uploading],
            UploadFileStatus::Stored,
            None,
            Some(events::FILE_STORED),
        )
        .await
    }

    /// `stored → processed`. Emits `file.processed`.
    pub async fn mark_file_processed(&self, file_id: Uuid) -> Result<UploadFile> {
        self.transition_file(
            file_id,
            &[UploadFileStatus::Stored],
            UploadFileStatus::Processed,
            None,
            Some(events::FILE_PROCESSED),
        )
        .await
    }

    /// `uploading → failed` with a reason. Emits `file.failed`.
    pub async fn mark_file_failed(&self, file_id: Uuid, error_message: &str) -> Result<UploadFile> {
        self.transition_file(
            file_id,
            &[UploadFileStatus::Uploading],
            UploadFileStatus::Failed,
            Some(error_message),
            Some(events::FILE_FAILED),
        )
        .await
    }

    /// Any non-deleted status → `deleted`.
    pub async fn mark_file_deleted(&self, file_id: Uuid) -> Result<UploadFile> {
        self.transition_file(
            file_id,
            &[
                UploadFileStatus::Uploading,
                UploadFileStatus::Stored,
                UploadFileStatus::Processed,
                UploadFileStatus::Failed,
            ],
            UploadFileStatus::Deleted,
            None,
            None,
        )
        .await
    }

    async fn transition_file(
        &self,
        file_id: Uuid,
        from: &[UploadFileStatus],
        to: UploadFileStatus,
        error_message: Option<&str>,
        event_type: Option<&str>,
    ) -> Result<UploadFile> {
        let mut uow = UnitOfWork::begin(&self.pool).await?;
        let file = update_file_status(uow.conn(), file_id, from, to, error_message).await?;

        let Some(file) = file else {
            drop(uow);
            let expected = from
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(" or ");
            return Err(self.transition_miss("upload_file", file_id, &expected).await);
        };

        if let Some(event_type) = event_type {
            self.outbox
                .emit(&mut uow, file_event(&file, event_type, None))
                .await?;
        }
        uow.commit().await?;

        info!(
            subsystem = "uploads",
            component = "file",
            op = "transition",
            file_id = %file_id,
            to = to.as_str(),
            "Upload file transitioned"
        );
        Ok(file)
    }

    // =========================================================================
    // SESSIONS
    // =========================================================================

    /// Open a chunked upload session for a file.
    ///
    /// `chunk_size_bytes` defaults to 5 MiB; `total_parts` is
    /// `ceil(total_size_bytes / chunk_size_bytes)`.
    pub async fn create_session(
        &self,
        file_id: Uuid,
        total_size_bytes: i64,
        chunk_size_bytes: Option<i64>,
    ) -> Result<UploadSession> {
        let chunk = chunk_size_bytes.unwrap_or(courier_core::defaults::UPLOAD_CHUNK_SIZE_BYTES);
        let parts = total_parts(total_size_bytes, Some(chunk))?;

        let row = sqlx::query(&format!(
            "INSERT INTO upload_session (id, file_id, status, chunk_size_bytes, total_size_bytes,
                                         total_parts, bytes_received, completed_parts,
                                         idempotency_key, upload_token, created_at, updated_at)
             VALUES ($1, $2, 'init', $3, $4, $5, 0, 0, $6, $7, $8, $8)
             RETURNING {}",
            SESSION_COLUMNS
        ))
        .bind(courier_core::new_v7())
        .bind(file_id)
        .bind(chunk)
        .bind(total_size_bytes)
        .bind(parts)
        .bind(format!("UploadFile:{}", file_id))
        .bind(Uuid::new_v4().simple().to_string())
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => Error::InvalidInput(
                format!("upload file {} already has a session", file_id),
            ),
            other => map_reference_error(other, "upload_file", Some(file_id)),
        })?;
        let session = parse_session(&row)?;

        info!(
            subsystem = "uploads",
            component = "session",
            op = "create_session",
            session_id = %session.id,
            file_id = %file_id,
            total_parts = parts,
            chunk_size_bytes = chunk,
            "Upload session created"
        );
        Ok(session)
    }

    pub async fn get_session(&self, id: Uuid) -> Result<Option<UploadSession>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM upload_session WHERE id = $1",
            SESSION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.as_ref().map(parse_session).transpose()
    }

    /// Parts recorded for a session, by part number.
    pub async fn list_parts(&self, session_id: Uuid) -> Result<Vec<UploadPart>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM upload_part WHERE session_id = $1 ORDER BY part_number",
            PART_COLUMNS
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter().map(parse_part).collect()
    }

    /// Record a received chunk and advance the session counters.
    ///
    /// Counters are bumped with an in-place increment so concurrent parts for
    /// the same session never lose an update.
    pub async fn record_part(&self, session_id: Uuid, part: NewUploadPart) -> Result<UploadPart> {
        if part.offset_bytes < 0 || part.size_bytes < 0 {
            return Err(Error::InvalidInput(format!(
                "part {} has negative offset or size",
                part.part_number
            )));
        }
        if let Some(sha) = part.sha256.as_deref() {
            if !sha.is_empty() && !is_sha256_hex(sha) {
                return Err(Error::InvalidInput(format!("malformed sha256: {}", sha)));
            }
        }

        let total: Option<i32> =
            sqlx::query_scalar("SELECT total_parts FROM upload_session WHERE id = $1")
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(Error::Database)?;
        let total = total.ok_or_else(|| Error::NotFound(format!("upload_session {}", session_id)))?;
        if part.part_number < 1 || part.part_number > total {
            return Err(Error::InvalidInput(format!(
                "part number {} out of range 1..={}",
                part.part_number, total
            )));
        }

        let mut uow = UnitOfWork::begin(&self.pool).await?;
        let row = sqlx::query(&format!(
            "INSERT INTO upload_part (id, session_id, part_number, offset_bytes, size_bytes,
                                      sha256, status, temp_storage_key, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, 'received', $7, $8, $8)
             RETURNING {}",
            PART_COLUMNS
        ))
        .bind(courier_core::new_v7())
        .bind(session_id)
        .bind(part.part_number)
        .bind(part.offset_bytes)
        .bind(part.size_bytes)
        .bind(part.sha256.clone().unwrap_or_default())
        .bind(part.temp_storage_key.clone().unwrap_or_default())
        .bind(Utc::now())
        .fetch_one(uow.conn())
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => Error::DuplicatePart {
                session_id,
                part_number: part.part_number,
            },
            other => Error::Database(other),
        })?;
        let recorded = parse_part(&row)?;

        let advanced = sqlx::query(
            "UPDATE upload_session SET
                completed_parts = completed_parts + 1,
                bytes_received = bytes_received + $2,
                status = 'in_progress',
                updated_at = now()
             WHERE id = $1 AND status IN ('init', 'in_progress')",
        )
        .bind(session_id)
        .bind(part.size_bytes)
        .execute(uow.conn())
        .await
        .map_err(Error::Database)?
        .rows_affected();

        if advanced == 0 {
            drop(uow);
            return Err(self
                .transition_miss("upload_session", session_id, "init or in_progress")
                .await);
        }
        uow.commit().await?;

        debug!(
            subsystem = "uploads",
            component = "session",
            op = "record_part",
            session_id = %session_id,
            part_number = recorded.part_number,
            size_bytes = recorded.size_bytes,
            "Upload part recorded"
        );
        Ok(recorded)
    }

    /// Complete a session once every part has been received.
    ///
    /// Flips the parent file from `uploading` to `stored` and emits
    /// `file.stored` in the same unit of work. A file that already left
    /// `uploading` is left untouched and no event is emitted.
    pub async fn complete_session(&self, session_id: Uuid) -> Result<UploadSession> {
        let mut uow = UnitOfWork::begin(&self.pool).await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM upload_session WHERE id = $1 FOR UPDATE",
            SESSION_COLUMNS
        ))
        .bind(session_id)
        .fetch_optional(uow.conn())
        .await
        .map_err(Error::Database)?
        .ok_or_else(|| Error::NotFound(format!("upload_session {}", session_id)))?;
        let session = parse_session(&row)?;

        match session.status {
            UploadSessionStatus::Failed | UploadSessionStatus::Aborted => {
                return Err(Error::InvalidTransition {
                    entity: "upload_session",
                    id: session_id,
                    expected: "init, in_progress or complete".to_string(),
                });
            }
            _ => {}
        }

        let received: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM upload_part WHERE session_id = $1 AND status = 'received'",
        )
        .bind(session_id)
        .fetch_one(uow.conn())
        .await
        .map_err(Error::Database)?;

        if received < i64::from(session.total_parts) {
            return Err(Error::IncompleteUpload {
                session_id,
                received,
                expected: session.total_parts,
            });
        }

        let row = sqlx::query(&format!(
            "UPDATE upload_session SET status = 'complete', updated_at = now()
             WHERE id = $1
             RETURNING {}",
            SESSION_COLUMNS
        ))
        .bind(session_id)
        .fetch_one(uow.conn())
        .await
        .map_err(Error::Database)?;
        let completed = parse_session(&row)?;

        let stored = update_file_status(
            uow.conn(),
            session.file_id,
            &[UploadFileStatus::Uploading],
            UploadFileStatus::Stored,
            None,
        )
        .await?;

        if let Some(file) = &stored {
            self.outbox
                .emit(&mut uow, file_event(file, events::FILE_STORED, Some(session_id)))
                .await?;
        }
        uow.commit().await?;

        info!(
            subsystem = "uploads",
            component = "session",
            op = "complete_session",
            session_id = %session_id,
            file_id = %session.file_id,
            parts = received,
            file_stored = stored.is_some(),
            "Upload session completed"
        );
        Ok(completed)
    }

    /// Abort a non-terminal session.
    pub async fn abort_session(&self, session_id: Uuid) -> Result<UploadSession> {
        self.terminate_session(session_id, UploadSessionStatus::Aborted)
            .await
    }

    /// Mark a non-terminal session as failed.
    pub async fn fail_session(&self, session_id: Uuid) -> Result<UploadSession> {
        self.terminate_session(session_id, UploadSessionStatus::Failed)
            .await
    }

    async fn terminate_session(
        &self,
        session_id: Uuid,
        to: UploadSessionStatus,
    ) -> Result<UploadSession> {
        let row = sqlx::query(&format!(
            "UPDATE upload_session SET status = $2, updated_at = now()
             WHERE id = $1 AND status IN ('init', 'in_progress')
             RETURNING {}",
            SESSION_COLUMNS
        ))
        .bind(session_id)
        .bind(to.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        match row {
            Some(row) => {
                info!(
                    subsystem = "uploads",
                    component = "session",
                    op = "terminate_session",
                    session_id = %session_id,
                    to = to.as_str(),
                    "Upload session terminated"
                );
                parse_session(&row)
            }
            None => Err(self
                .transition_miss("upload_session", session_id, "init or in_progress")
                .await),
        }
    }

    /// Error for a conditional update that matched no row: `NotFound` when the
    /// record is gone, `InvalidTransition` otherwise.
    async fn transition_miss(&self, entity: &'static str, id: Uuid, expected: &str) -> Error {
        let sql = format!("SELECT EXISTS (SELECT 1 FROM {} WHERE id = $1)", entity);
        match sqlx::query_scalar::<_, bool>(&sql)
            .bind(id)
            .fetch_one(&self.pool)
            .await
        {
            Ok(true) => Error::InvalidTransition {
                entity,
                id,
                expected: expected.to_string(),
            },
            Ok(false) => Error::NotFound(format!("{} {}", entity, id)),
            Err(e) => Error::Database(e),
        }
    }
}

#[async_trait]
impl UploadCleanup for PgUploadRepository {
    async fn cleanup_expired_files(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<CleanupStats> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM upload_file WHERE created_at < $1")
            .bind(cutoff)
            .fetch_one(&mut *tx)
            .await
            .map_err(Error::Database)?;

        if total == 0 {
            tx.commit().await.map_err(Error::Database)?;
            return Ok(CleanupStats::default());
        }

        // Sessions and parts cascade; batches keep their row with no files.
        let deleted = sqlx::query(
            "DELETE FROM upload_file WHERE id IN (
                SELECT id FROM upload_file
                WHERE created_at < $1
                ORDER BY id
                LIMIT $2
             )",
        )
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
            subsystem = "uploads",
            component = "store",
            op = "cleanup_expired_files",
            deleted = stats.deleted,
            remaining = stats.remaining,
            %cutoff,
            "Deleted expired upload files"
        );

        Ok(stats)
    }
}

async fn update_file_status(
    conn: &mut PgConnection,
    file_id: Uuid,
    from: &[UploadFileStatus],
    to: UploadFileStatus,
    error_message: Option<&str>,
) -> Result<Option<UploadFile>> {
    let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
    let row = sqlx::query(&format!(
        "UPDATE upload_file SET
            status = $2,
            error_message = COALESCE($3, error_message),
            updated_at = now()
         WHERE id = $1 AND status = ANY($4)
         RETURNING {}",
        FILE_COLUMNS
    ))
    .bind(file_id)
    .bind(to.as_str())
    .bind(error_message)
    .bind(&from)
    .fetch_optional(conn)
    .await
    .map_err(Error::Database)?;

    row.as_ref().map(parse_file).transpose()
}

fn file_event(file: &UploadFile, event_type: &str, session_id: Option<Uuid>) -> NewOutboxEvent {
    let error = (!file.error_message.is_empty()).then(|| file.error_message.clone());
    NewOutboxEvent::new("UploadFile", file.id.to_string(), event_type).with_payload(
        PayloadBuilder::new()
            .field("file_id", file.id)
            .optional("batch_id", file.batch_id)
            .optional("session_id", session_id)
            .field("original_filename", &file.original_filename)
            .field("content_type", &file.content_type)
            .field("size_bytes", file.size_bytes)
            .field("sha256", &file.sha256)
            .field("status", file.status)
            .optional("error", error)
            .field("updated_at", file.updated_at)
            .build(),
    )
}

fn map_reference_error(err: sqlx::Error, entity: &str, id: Option<Uuid>) -> Error {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_foreign_key_violation() {
            let id = id.map(|id| id.to_string()).unwrap_or_default();
            return Error::NotFound(format!("{} {}", entity, id));
        }
    }
    Error::Database(err)
}

fn parse_batch(r: &PgRow) -> Result<UploadBatch> {
    let status: String = r.try_get("status")?;
    Ok(UploadBatch {
        id: r.try_get("id")?,
        created_by: r.try_get("created_by")?,
        status: status.parse()?,
        idempotency_key: r.try_get("idempotency_key")?,
        created_at: r.try_get("created_at")?,
        updated_at: r.try_get("updated_at")?,
    })
}

fn parse_file(r: &PgRow) -> Result<UploadFile> {
    let status: String = r.try_get("status")?;
    Ok(UploadFile {
        id: r.try_get("id")?,
        batch_id: r.try_get("batch_id")?,
        uploaded_by: r.try_get("uploaded_by")?,
        original_filename: r.try_get("original_filename")?,
        content_type: r.try_get("content_type")?,
        size_bytes: r.try_get("size_bytes")?,
        sha256: r.try_get("sha256")?,
        metadata: r.try_get("metadata")?,
        status: status.parse()?,
        error_message: r.try_get("error_message")?,
        created_at: r.try_get("created_at")?,
        updated_at: r.try_get("updated_at")?,
    })
}

fn parse_session(r: &PgRow) -> Result<UploadSession> {
    let status: String = r.try_get("status")?;
    Ok(UploadSession {
        id: r.try_get("id")?,
        file_id: r.try_get("file_id")?,
        status: status.parse()?,
        chunk_size_bytes: r.try_get("chunk_size_bytes")?,
        total_size_bytes: r.try_get("total_size_bytes")?,
        total_parts: r.try_get("total_parts")?,
        bytes_received: r.try_get("bytes_received")?,
        completed_parts: r.try_get("completed_parts")?,
        idempotency_key: r.try_get("idempotency_key")?,
        upload_token: r.try_get("upload_token")?,
        created_at: r.try_get("created_at")?,
        updated_at: r.try_get("updated_at")?,
    })
}

fn parse_part(r: &PgRow) -> Result<UploadPart> {
    let status: String = r.try_get("status")?;
    Ok(UploadPart {
        id: r.try_get("id")?,
        session_id: r.try_get("session_id")?,
        part_number: r.try_get("part_number")?,
        offset_bytes: r.try_get("offset_bytes")?,
        size_bytes: r.try_get("size_bytes")?,
        sha256: r.try_get("sha256")?,
        status: status.parse()?,
        temp_storage_key: r.try_get("temp_storage_key")?,
        created_at: r.try_get("created_at")?,
        updated_at: r.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn file(status: UploadFileStatus, error_message: &str) -> UploadFile {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        UploadFile {
            id: Uuid::nil(),
            batch_id: None,
            uploaded_by: None,
            original_filename: "scan.pdf".to_string(),
            content_type: "application/pdf".to_string(),
            size_bytes: 1000,
            sha256: String::new(),
            metadata: serde_json::json!({}),
            status,
            error_message: error_message.to_string(),
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn test_file_event_uses_aggregate_key() {
        let event = file_event(&file(UploadFileStatus::Stored, ""), events::FILE_STORED, None);
        assert_eq!(event.aggregate_type, "UploadFile");
        assert_eq!(event.event_type, "file.stored");
        assert_eq!(
            event.resolved_idempotency_key(),
            format!("UploadFile:{}", Uuid::nil())
        );

        let payload = event.resolved_payload();
        assert_eq!(payload["status"], "stored");
        assert_eq!(payload["size_bytes"], 1000);
        assert_eq!(payload["updated_at"], "2026-03-01T12:00:00Z");
        assert!(payload.get("error").is_none());
        assert!(payload.get("batch_id").is_none());
    }

    #[test]
    fn test_file_event_carries_failure_reason() {
        let session_id = Uuid::from_u128(7);
        let event = file_event(
            &file(UploadFileStatus::Failed, "File extension .exe is not allowed."),
            events::FILE_FAILED,
            Some(session_id),
        );
        let payload = event.resolved_payload();
        assert_eq!(payload["error"], "File extension .exe is not allowed.");
        assert_eq!(payload["session_id"], session_id.to_string());
    }
}
