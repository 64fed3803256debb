//! Retention sweeps: terminal outbox entries and expired upload rows.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use courier_core::defaults::{
    CLEANUP_BATCH_SIZE, FILE_UPLOAD_TTL_HOURS, MAX_RETENTION_HOURS, OUTBOX_RETENTION_HOURS,
    UPLOAD_CLEANUP_BATCH_SIZE,
};
use courier_core::{CleanupStats, Error, OutboxRepository, OutboxTable, Result, UploadCleanup};

/// Retention sweep settings.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Delivered and failed entries older than this are deleted.
    pub retention_hours: i64,
    /// Maximum rows deleted per sweep.
    pub batch_size: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_hours: OUTBOX_RETENTION_HOURS,
            batch_size: CLEANUP_BATCH_SIZE,
        }
    }
}

impl RetentionConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `OUTBOX_RETENTION_HOURS` | `168` |
    /// | `OUTBOX_CLEANUP_BATCH_SIZE` | `1000` |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let retention_hours =
            env_i64("OUTBOX_RETENTION_HOURS").unwrap_or(defaults.retention_hours);
        let batch_size = env_i64("OUTBOX_CLEANUP_BATCH_SIZE").unwrap_or(defaults.batch_size);
        defaults
            .with_retention_hours(retention_hours)
            .with_batch_size(batch_size)
    }

    /// Clamped to `0..=MAX_RETENTION_HOURS`.
    pub fn with_retention_hours(mut self, hours: i64) -> Self {
        self.retention_hours = hours.clamp(0, MAX_RETENTION_HOURS);
        self
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

/// Expired-upload sweep settings.
#[derive(Debug, Clone)]
pub struct UploadRetentionConfig {
    /// Upload files created longer ago than this are deleted.
    pub ttl_hours: i64,
    /// Maximum files deleted per sweep.
    pub batch_size: i64,
}

impl Default for UploadRetentionConfig {
    fn default() -> Self {
        Self {
            ttl_hours: FILE_UPLOAD_TTL_HOURS,
            batch_size: UPLOAD_CLEANUP_BATCH_SIZE,
        }
    }
}

impl UploadRetentionConfig {
    /// | Variable | Default |
    /// |----------|---------|
    /// | `FILE_UPLOAD_TTL_HOURS` | `24` |
    /// | `UPLOAD_CLEANUP_BATCH_SIZE` | `1000` |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let ttl_hours = env_i64("FILE_UPLOAD_TTL_HOURS").unwrap_or(defaults.ttl_hours);
        let batch_size = env_i64("UPLOAD_CLEANUP_BATCH_SIZE").unwrap_or(defaults.batch_size);
        defaults.with_ttl_hours(ttl_hours).with_batch_size(batch_size)
    }

    /// Clamped to `0..=MAX_RETENTION_HOURS`.
    pub fn with_ttl_hours(mut self, hours: i64) -> Self {
        self.ttl_hours = hours.clamp(0, MAX_RETENTION_HOURS);
        self
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

fn env_i64(name: &str) -> Option<i64> {
    std::env::var(name).ok().and_then(|v| v.parse::<i64>().ok())
}

/// The instant `hours` before now.
///
/// Fails instead of panicking when the window does not fit a timestamp.
fn cutoff_before_now(hours: i64) -> Result<DateTime<Utc>> {
    chrono::Duration::try_hours(hours)
        .and_then(|window| Utc::now().checked_sub_signed(window))
        .ok_or_else(|| Error::Config(format!("retention window of {} hours is out of range", hours)))
}

/// Deletes expired terminal entries in bounded batches.
#[derive(Clone)]
pub struct RetentionSweep {
    outbox: Arc<dyn OutboxRepository>,
    config: RetentionConfig,
}

impl RetentionSweep {
    pub fn new(outbox: Arc<dyn OutboxRepository>, config: RetentionConfig) -> Self {
        Self { outbox, config }
    }

    pub fn config(&self) -> &RetentionConfig {
        &self.config
    }

    pub fn table(&self) -> OutboxTable {
        self.outbox.table()
    }

    #[instrument(
        skip(self),
        fields(subsystem = "outbox", component = "retention", table = self.table().table_name())
    )]
    pub async fn run(&self) -> Result<CleanupStats> {
        let cutoff = cutoff_before_now(self.config.retention_hours)?;
        let stats = self.outbox.cleanup(cutoff, self.config.batch_size).await?;

        if stats.deleted == 0 {
            debug!(%cutoff, "No expired outbox entries");
        } else {
            info!(
                deleted = stats.deleted,
                remaining = stats.remaining,
                %cutoff,
                "Retention sweep completed"
            );
        }
        Ok(stats)
    }
}

/// Deletes upload files past their TTL, with their sessions and parts.
///
/// Stored blobs are not touched; only the tracking rows go.
#[derive(Clone)]
pub struct UploadRetentionSweep {
    uploads: Arc<dyn UploadCleanup>,
    config: UploadRetentionConfig,
}

impl UploadRetentionSweep {
    pub fn new(uploads: Arc<dyn UploadCleanup>, config: UploadRetentionConfig) -> Self {
        Self { uploads, config }
    }

    pub fn config(&self) -> &UploadRetentionConfig {
        &self.config
    }

    #[instrument(skip(self), fields(subsystem = "uploads", component = "retention"))]
    pub async fn run(&self) -> Result<CleanupStats> {
        let cutoff = cutoff_before_now(self.config.ttl_hours)?;
        let stats = self
            .uploads
            .cleanup_expired_files(cutoff, self.config.batch_size)
            .await?;

        if stats.deleted == 0 {
            debug!(%cutoff, "No expired upload files");
        } else {
            info!(
                deleted = stats.deleted,
                remaining = stats.remaining,
                %cutoff,
                "Upload cleanup completed"
            );
        }
        Ok(stats)
    }
}
