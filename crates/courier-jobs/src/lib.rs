//! # courier-jobs
//!
//! Background sweeps for the courier outbox.
//!
//! This crate provides:
//! - The delivery sweep posting due entries to subscribed webhook endpoints
//! - The signed HTTP transport used by the sweep
//! - The retention sweep deleting expired terminal entries
//! - The upload sweep deleting upload rows past their TTL
//! - A worker running them on a schedule and delivery on demand
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use courier_db::Database;
//! use courier_jobs::*;
//!
//! let db = Database::connect("postgres://...")
//!     .await?
//!     .with_outbox_table(OutboxTable::from_env()?);
//! let outbox = Arc::new(db.outbox.clone());
//!
//! let transport = HttpWebhookTransport::new(TransportConfig::from_env())?;
//! let delivery = DeliverySweep::new(
//!     outbox.clone(),
//!     Arc::new(db.endpoints.clone()),
//!     Arc::new(transport),
//!     DeliveryConfig::from_env(),
//! );
//! let retention = RetentionSweep::new(outbox, RetentionConfig::from_env());
//! let uploads = UploadRetentionSweep::new(
//!     Arc::new(db.uploads.clone()),
//!     UploadRetentionConfig::from_env(),
//! );
//!
//! let worker = SweepWorker::new(delivery, retention, WorkerConfig::from_env())
//!     .with_upload_cleanup(uploads);
//! let db = db.with_trigger(Arc::new(worker.trigger()));
//! let handle = worker.start();
//!
//! // Events committed through `db` now wake a delivery sweep.
//! handle.shutdown().await?;
//! ```

pub mod delivery;
pub mod retention;
pub mod transport;
pub mod worker;

// Re-export core types
pub use courier_core::*;

pub use delivery::{DeliveryConfig, DeliverySweep};
pub use retention::{
    RetentionConfig, RetentionSweep, UploadRetentionConfig, UploadRetentionSweep,
};
pub use transport::{compute_signature, HttpWebhookTransport, TransportConfig};
pub use worker::{SweepKind, SweepWorker, WorkerConfig, WorkerEvent, WorkerHandle};
