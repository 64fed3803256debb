//! Core data models for courier.
//!
//! These types are shared across all courier crates: outbox entries and
//! their delivery bookkeeping, webhook endpoints, and the chunked-upload
//! records (batch, file, session, part).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::Error;

// =============================================================================
// OUTBOX TYPES
// =============================================================================

/// Delivery status of an outbox entry.
///
/// `pending → delivered` on success, `pending → pending` on a retryable
/// failure, `pending → failed` once attempts are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Delivered,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Delivered => "delivered",
            OutboxStatus::Failed => "failed",
        }
    }

    /// Terminal statuses never transition automatically.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OutboxStatus::Pending)
    }
}

impl FromStr for OutboxStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "delivered" => Ok(OutboxStatus::Delivered),
            "failed" => Ok(OutboxStatus::Failed),
            other => Err(Error::InvalidInput(format!(
                "unknown outbox status: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Physical outbox table.
///
/// The generic and the portal outbox share one schema and one
/// implementation; only the table differs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxTable {
    #[default]
    Core,
    Portal,
}

impl OutboxTable {
    pub fn table_name(&self) -> &'static str {
        match self {
            OutboxTable::Core => "outbox_event",
            OutboxTable::Portal => "portal_event_outbox",
        }
    }

    /// Table named by `OUTBOX_TABLE` (`core` or `portal`), `core` when unset.
    ///
    /// An unknown name is a configuration error rather than a silent default.
    pub fn from_env() -> Result<Self, Error> {
        match std::env::var("OUTBOX_TABLE") {
            Ok(v) => v.parse(),
            Err(_) => Ok(Self::default()),
        }
    }
}

impl FromStr for OutboxTable {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "core" | "outbox_event" => Ok(OutboxTable::Core),
            "portal" | "portal_event_outbox" => Ok(OutboxTable::Portal),
            other => Err(Error::Config(format!("unknown outbox table: {}", other))),
        }
    }
}

/// A durable outbox entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: JsonValue,
    pub status: OutboxStatus,
    pub idempotency_key: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub error_message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxEntry {
    /// Whether the entry may be picked up by a sweep running at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::Pending
            && self.next_attempt_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// Request to append an event to the outbox.
#[derive(Debug, Clone, Default)]
pub struct NewOutboxEvent {
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    /// `None` is stored as `{}`.
    pub payload: Option<JsonValue>,
    /// `None` defaults to `"{aggregate_type}:{aggregate_id}"`.
    pub idempotency_key: Option<String>,
}

impl NewOutboxEvent {
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
    ) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            payload: None,
            idempotency_key: None,
        }
    }

    pub fn with_payload(mut self, payload: JsonValue) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Idempotency key actually written: explicit key or the aggregate reference.
    pub fn resolved_idempotency_key(&self) -> String {
        match &self.idempotency_key {
            Some(key) if !key.is_empty() => key.clone(),
            _ => format!("{}:{}", self.aggregate_type, self.aggregate_id),
        }
    }

    /// Payload actually written: explicit payload or an empty object.
    pub fn resolved_payload(&self) -> JsonValue {
        match &self.payload {
            Some(JsonValue::Null) | None => JsonValue::Object(Default::default()),
            Some(v) => v.clone(),
        }
    }
}

/// State written back for one attempted entry at the end of a delivery sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryTransition {
    pub id: Uuid,
    /// Attempts as read by the fetch phase; the write is guarded by it.
    pub previous_attempts: i32,
    pub attempts: i32,
    pub status: OutboxStatus,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub error_message: String,
}

/// Aggregate counters of one delivery sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStats {
    /// Entries whose transition was written.
    pub processed: usize,
    pub delivered: usize,
    pub failed: usize,
    /// Entries attempted whose transition lost to a concurrent change.
    pub skipped: usize,
    /// Entries fetched but released unattempted at the soft limit.
    pub deferred: usize,
    /// Entries still `pending` after the sweep (due or not).
    pub remaining: i64,
}

/// Counters of one retention or upload cleanup sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupStats {
    pub deleted: u64,
    /// Expired rows left for the next sweep.
    pub remaining: u64,
}

/// Entry counts per status, for operator visibility.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxStatusCounts {
    pub pending: i64,
    pub delivered: i64,
    pub failed: i64,
}

// =============================================================================
// WEBHOOK TYPES
// =============================================================================

/// A subscriber endpoint receiving signed webhook POSTs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEndpoint {
    pub id: Uuid,
    pub url: String,
    #[serde(skip_serializing)]
    pub secret: String,
    /// Subscribed event types. Empty matches every event.
    pub event_types: Vec<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookEndpoint {
    /// Catch-all endpoints have no event type filter.
    pub fn is_catch_all(&self) -> bool {
        self.event_types.is_empty()
    }

    pub fn matches(&self, event_type: &str) -> bool {
        self.is_catch_all() || self.event_types.iter().any(|t| t == event_type)
    }
}

/// Request to register a webhook endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateEndpointRequest {
    pub url: String,
    pub secret: String,
    #[serde(default)]
    pub event_types: Vec<String>,
}

/// Partial endpoint update; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateEndpointRequest {
    pub url: Option<String>,
    pub secret: Option<String>,
    pub event_types: Option<Vec<String>>,
    pub is_active: Option<bool>,
}

/// Outcome of one POST to one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryResult {
    pub ok: bool,
    pub status_code: Option<u16>,
    pub error: String,
}

impl DeliveryResult {
    pub fn success(status_code: u16) -> Self {
        Self {
            ok: true,
            status_code: Some(status_code),
            error: String::new(),
        }
    }

    pub fn failure(status_code: Option<u16>, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            status_code,
            error: error.into(),
        }
    }
}

// =============================================================================
// UPLOAD TYPES
// =============================================================================

/// Lifecycle of a logical uploaded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadFileStatus {
    Uploading,
    Stored,
    Processed,
    Failed,
    Deleted,
}

impl UploadFileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadFileStatus::Uploading => "uploading",
            UploadFileStatus::Stored => "stored",
            UploadFileStatus::Processed => "processed",
            UploadFileStatus::Failed => "failed",
            UploadFileStatus::Deleted => "deleted",
        }
    }

    /// `stored` and `processed` both count as a successful upload.
    pub fn is_success(&self) -> bool {
        matches!(self, UploadFileStatus::Stored | UploadFileStatus::Processed)
    }
}

impl FromStr for UploadFileStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploading" => Ok(UploadFileStatus::Uploading),
            "stored" => Ok(UploadFileStatus::Stored),
            "processed" => Ok(UploadFileStatus::Processed),
            "failed" => Ok(UploadFileStatus::Failed),
            "deleted" => Ok(UploadFileStatus::Deleted),
            other => Err(Error::InvalidInput(format!(
                "unknown upload file status: {}",
                other
            ))),
        }
    }
}

/// Status of a batch, derived from its files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadBatchStatus {
    Init,
    InProgress,
    Complete,
    Partial,
    Failed,
}

impl UploadBatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadBatchStatus::Init => "init",
            UploadBatchStatus::InProgress => "in_progress",
            UploadBatchStatus::Complete => "complete",
            UploadBatchStatus::Partial => "partial",
            UploadBatchStatus::Failed => "failed",
        }
    }
}

impl FromStr for UploadBatchStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "init" => Ok(UploadBatchStatus::Init),
            "in_progress" => Ok(UploadBatchStatus::InProgress),
            "complete" => Ok(UploadBatchStatus::Complete),
            "partial" => Ok(UploadBatchStatus::Partial),
            "failed" => Ok(UploadBatchStatus::Failed),
            other => Err(Error::InvalidInput(format!(
                "unknown upload batch status: {}",
                other
            ))),
        }
    }
}

/// Status of a chunked upload session.
///
/// `init → in_progress → complete`; `failed` and `aborted` are reachable
/// from any non-terminal state by an explicit decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadSessionStatus {
    Init,
    InProgress,
    Complete,
    Failed,
    Aborted,
}

impl UploadSessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadSessionStatus::Init => "init",
            UploadSessionStatus::InProgress => "in_progress",
            UploadSessionStatus::Complete => "complete",
            UploadSessionStatus::Failed => "failed",
            UploadSessionStatus::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadSessionStatus::Complete | UploadSessionStatus::Failed | UploadSessionStatus::Aborted
        )
    }
}

impl FromStr for UploadSessionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "init" => Ok(UploadSessionStatus::Init),
            "in_progress" => Ok(UploadSessionStatus::InProgress),
            "complete" => Ok(UploadSessionStatus::Complete),
            "failed" => Ok(UploadSessionStatus::Failed),
            "aborted" => Ok(UploadSessionStatus::Aborted),
            other => Err(Error::InvalidInput(format!(
                "unknown upload session status: {}",
                other
            ))),
        }
    }
}

/// Status of a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadPartStatus {
    Pending,
    Received,
    Failed,
}

impl UploadPartStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadPartStatus::Pending => "pending",
            UploadPartStatus::Received => "received",
            UploadPartStatus::Failed => "failed",
        }
    }
}

impl FromStr for UploadPartStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(UploadPartStatus::Pending),
            "received" => Ok(UploadPartStatus::Received),
            "failed" => Ok(UploadPartStatus::Failed),
            other => Err(Error::InvalidInput(format!(
                "unknown upload part status: {}",
                other
            ))),
        }
    }
}

/// A group of files uploaded together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadBatch {
    pub id: Uuid,
    pub created_by: Option<Uuid>,
    pub status: UploadBatchStatus,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Canonical record of one logical uploaded file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadFile {
    pub id: Uuid,
    pub batch_id: Option<Uuid>,
    pub uploaded_by: Option<Uuid>,
    pub original_filename: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub sha256: String,
    pub metadata: JsonValue,
    pub status: UploadFileStatus,
    pub error_message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request to register an uploaded file.
#[derive(Debug, Clone, Default)]
pub struct NewUploadFile {
    pub batch_id: Option<Uuid>,
    pub uploaded_by: Option<Uuid>,
    pub original_filename: String,
    /// Content type claimed by the client; re-derived from the extension when absent.
    pub content_type: Option<String>,
    pub size_bytes: i64,
    pub sha256: Option<String>,
    pub metadata: Option<JsonValue>,
}

/// Chunked transfer state of one file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub id: Uuid,
    pub file_id: Uuid,
    pub status: UploadSessionStatus,
    pub chunk_size_bytes: i64,
    pub total_size_bytes: i64,
    pub total_parts: i32,
    pub bytes_received: i64,
    pub completed_parts: i32,
    pub idempotency_key: String,
    pub upload_token: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One received chunk of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadPart {
    pub id: Uuid,
    pub session_id: Uuid,
    pub part_number: i32,
    pub offset_bytes: i64,
    pub size_bytes: i64,
    pub sha256: String,
    pub status: UploadPartStatus,
    pub temp_storage_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request to record a received chunk.
#[derive(Debug, Clone, Default)]
pub struct NewUploadPart {
    /// 1-indexed chunk ordinal.
    pub part_number: i32,
    pub offset_bytes: i64,
    pub size_bytes: i64,
    pub sha256: Option<String>,
    pub temp_storage_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn entry(status: OutboxStatus, next_attempt_at: Option<DateTime<Utc>>) -> OutboxEntry {
        let now = Utc::now();
        OutboxEntry {
            id: Uuid::now_v7(),
            aggregate_type: "UploadFile".to_string(),
            aggregate_id: "1".to_string(),
            event_type: "file.stored".to_string(),
            payload: json!({}),
            status,
            idempotency_key: "UploadFile:1".to_string(),
            attempts: 0,
            max_attempts: 5,
            next_attempt_at,
            delivered_at: None,
            error_message: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_default_idempotency_key_is_aggregate_reference() {
        let event = NewOutboxEvent::new("UploadFile", "abc", "file.stored");
        assert_eq!(event.resolved_idempotency_key(), "UploadFile:abc");
    }

    #[test]
    fn test_explicit_idempotency_key_preserved() {
        let event =
            NewOutboxEvent::new("UploadFile", "abc", "file.stored").with_idempotency_key("custom");
        assert_eq!(event.resolved_idempotency_key(), "custom");
    }

    #[test]
    fn test_missing_payload_becomes_empty_object() {
        let event = NewOutboxEvent::new("UploadFile", "abc", "file.stored");
        assert_eq!(event.resolved_payload(), json!({}));

        let event = event.with_payload(JsonValue::Null);
        assert_eq!(event.resolved_payload(), json!({}));
    }

    #[test]
    fn test_is_due() {
        let now = Utc::now();
        assert!(entry(OutboxStatus::Pending, Some(now)).is_due(now));
        assert!(entry(OutboxStatus::Pending, Some(now - Duration::seconds(5))).is_due(now));
        assert!(!entry(OutboxStatus::Pending, Some(now + Duration::seconds(5))).is_due(now));
        assert!(!entry(OutboxStatus::Delivered, None).is_due(now));
        assert!(!entry(OutboxStatus::Failed, None).is_due(now));
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in [
            OutboxStatus::Pending,
            OutboxStatus::Delivered,
            OutboxStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<OutboxStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<OutboxStatus>().is_err());
        assert!(OutboxStatus::Failed.is_terminal());
        assert!(!OutboxStatus::Pending.is_terminal());
    }

    #[test]
    fn test_outbox_table_names() {
        assert_eq!(OutboxTable::Core.table_name(), "outbox_event");
        assert_eq!(OutboxTable::Portal.table_name(), "portal_event_outbox");
        assert_eq!("PORTAL".parse::<OutboxTable>().unwrap(), OutboxTable::Portal);
        assert!("elsewhere".parse::<OutboxTable>().is_err());
    }

    #[test]
    fn test_endpoint_matching() {
        let now = Utc::now();
        let mut endpoint = WebhookEndpoint {
            id: Uuid::now_v7(),
            url: "https://example.com/hook".to_string(),
            secret: "s".to_string(),
            event_types: vec![],
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        assert!(endpoint.matches("file.stored"));
        assert!(endpoint.matches("anything.else"));

        endpoint.event_types = vec!["file.stored".to_string()];
        assert!(endpoint.matches("file.stored"));
        assert!(!endpoint.matches("file.failed"));
    }

    #[test]
    fn test_endpoint_secret_not_serialized() {
        let now = Utc::now();
        let endpoint = WebhookEndpoint {
            id: Uuid::nil(),
            url: "https://example.com/hook".to_string(),
            secret: "top-secret".to_string(),
            event_types: vec![],
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        let json = serde_json::to_string(&endpoint).unwrap();
        assert!(!json.contains("top-secret"));
    }

    #[test]
    fn test_upload_status_parsing() {
        assert_eq!(
            "in_progress".parse::<UploadSessionStatus>().unwrap(),
            UploadSessionStatus::InProgress
        );
        assert_eq!(
            "partial".parse::<UploadBatchStatus>().unwrap(),
            UploadBatchStatus::Partial
        );
        assert_eq!(
            "processed".parse::<UploadFileStatus>().unwrap(),
            UploadFileStatus::Processed
        );
        assert_eq!(
            "received".parse::<UploadPartStatus>().unwrap(),
            UploadPartStatus::Received
        );
        assert!(UploadFileStatus::Processed.is_success());
        assert!(!UploadFileStatus::Deleted.is_success());
        assert!(UploadSessionStatus::Aborted.is_terminal());
        assert!(!UploadSessionStatus::InProgress.is_terminal());
    }
}
