//! Centralized default constants for courier.
//!
//! These values only seed the `Default` impls of the configuration structs
//! (`DeliveryConfig`, `RetentionConfig`, `UploadRetentionConfig`,
//! `TransportConfig`, `WorkerConfig`, `PoolConfig`). Components never read them directly, so every sweep stays
//! reentrant and testable with its own configuration.

// =============================================================================
// OUTBOX
// =============================================================================

/// Delivery attempts before an entry becomes terminally `failed`.
pub const OUTBOX_MAX_ATTEMPTS: i32 = 5;

/// Entries claimed per delivery sweep. Small so a sweep finishes quickly.
pub const DELIVERY_BATCH_SIZE: i64 = 20;

/// Wall-clock budget for one delivery sweep, in seconds.
///
/// Kept below the 240s soft limit of the task runtime so a final in-flight
/// delivery (30s worst case) and the update phase still fit.
pub const DELIVERY_SOFT_LIMIT_SECS: u64 = 200;

/// Seconds a fetched entry stays claimed by the sweep that fetched it.
///
/// Must outlast the soft limit plus one in-flight POST; `DeliveryConfig`
/// raises shorter values to that floor.
pub const DELIVERY_CLAIM_LEASE_SECS: u64 = 300;

/// Hours a delivered/failed entry is kept before the retention sweep purges it.
pub const OUTBOX_RETENTION_HOURS: i64 = 168;

/// Upper bound accepted for any retention window, in hours (ten years).
pub const MAX_RETENTION_HOURS: i64 = 87_600;

/// Entries deleted per retention sweep.
pub const CLEANUP_BATCH_SIZE: i64 = 1000;

// =============================================================================
// RETRY BACKOFF
// =============================================================================

/// Base retry delay in seconds; doubles per attempt.
pub const RETRY_BASE_DELAY_SECS: i64 = 60;

/// Upper bound on the retry delay in seconds.
pub const RETRY_MAX_DELAY_SECS: i64 = 3600;

/// Maximum jitter as a fraction of the computed delay.
pub const RETRY_JITTER_RATIO: f64 = 0.1;

// =============================================================================
// WEBHOOK TRANSPORT
// =============================================================================

/// TCP connect timeout for webhook POSTs, in seconds.
pub const WEBHOOK_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Total request timeout for webhook POSTs, in seconds.
pub const WEBHOOK_TIMEOUT_SECS: u64 = 30;

/// Characters of a non-2xx response body kept in the error message.
pub const WEBHOOK_ERROR_BODY_CHARS: usize = 200;

// =============================================================================
// SWEEP WORKER
// =============================================================================

/// Safety-net interval between delivery sweeps, in seconds.
pub const SWEEP_DELIVERY_INTERVAL_SECS: u64 = 60;

/// Interval between retention sweeps, in seconds.
pub const SWEEP_RETENTION_INTERVAL_SECS: u64 = 3600;

/// Interval between expired-upload sweeps, in seconds (6 hours).
pub const SWEEP_UPLOAD_CLEANUP_INTERVAL_SECS: u64 = 21_600;

/// Capacity of the worker event broadcast channel.
pub const WORKER_EVENT_CAPACITY: usize = 64;

// =============================================================================
// UPLOADS
// =============================================================================

/// Default chunk size for chunked uploads (5 MiB).
pub const UPLOAD_CHUNK_SIZE_BYTES: i64 = 5_242_880;

/// Maximum accepted size of a single uploaded file (50 MiB).
pub const UPLOAD_MAX_SIZE_BYTES: i64 = 52_428_800;

/// Fallback content type when the extension is unknown.
pub const UPLOAD_FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Hours an upload file row lives before the upload sweep deletes it.
pub const FILE_UPLOAD_TTL_HOURS: i64 = 24;

/// Upload files deleted per upload sweep.
pub const UPLOAD_CLEANUP_BATCH_SIZE: i64 = 1000;

// =============================================================================
// DATABASE POOL
// =============================================================================

/// Pool ceiling. The worker needs one connection per sweep phase in flight
/// plus whatever the emitting application shares the pool with.
pub const DB_MAX_CONNECTIONS: u32 = 10;

pub const DB_MIN_CONNECTIONS: u32 = 1;

/// Seconds to wait for a free pooled connection.
pub const DB_ACQUIRE_TIMEOUT_SECS: u64 = 30;

pub const DB_IDLE_TIMEOUT_SECS: u64 = 600;

pub const DB_MAX_LIFETIME_SECS: u64 = 1800;
