//! UUID v7 helpers for outbox and upload identifiers.
//!
//! Every row courier creates is keyed by a UUIDv7. The first 48 bits carry a
//! Unix millisecond timestamp, so primary-key order is creation order and
//! `ORDER BY id` is a deterministic, time-ordered scan.

use uuid::Uuid;

/// Generate a new UUIDv7 identifier.
///
/// # Example
///
/// ```
/// use courier_core::uuid_utils::new_v7;
///
/// let id = new_v7();
/// assert_eq!(id.get_version_num(), 7);
/// ```
#[inline]
pub fn new_v7() -> Uuid {
    Uuid::now_v7()
}
