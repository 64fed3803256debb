//! # courier-core
//!
//! Core types, traits, and policies for the courier outbox.
//!
//! This crate provides the data structures, the retry policy and the trait
//! seams that the database and job crates build on. It performs no I/O of
//! its own.

pub mod defaults;
pub mod error;
pub mod logging;
pub mod models;
pub mod payload;
pub mod retry;
pub mod traits;
pub mod trigger;
pub mod upload_validation;
pub mod uploads;
pub mod uuid_utils;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use models::*;
pub use payload::{encode_body, to_payload, PayloadBuilder};
pub use retry::RetryPolicy;
pub use traits::*;
pub use trigger::{NoopTrigger, NotifyTrigger};
pub use upload_validation::{guess_content_type, validate_upload, UploadPolicy, UploadValidation};
pub use uploads::{derive_batch_status, is_sha256_hex, total_parts};
pub use uuid_utils::new_v7;
