//! Structured logging conventions for courier.
//!
//! Spans carry `subsystem` ("outbox", "webhook", "uploads", "database") and
//! `component` fields. Fields recorded after a span is created use the names
//! below so log queries match across crates.
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Sweep or trigger failure needing operator attention |
//! | WARN  | Failed delivery attempt, soft limit reached, lost write race |
//! | INFO  | Worker lifecycle, sweep completions |
//! | DEBUG | Per-entry decisions, absorbed duplicates |
//! | TRACE | Trigger scheduling |

/// Outbox entry UUID.
pub const EVENT_ID: &str = "event_id";

/// Outbox event type, e.g. "file.stored".
pub const EVENT_TYPE: &str = "event_type";

/// Webhook endpoint URL.
pub const ENDPOINT_URL: &str = "endpoint_url";

/// HTTP status returned by a webhook endpoint.
pub const STATUS_CODE: &str = "status_code";
