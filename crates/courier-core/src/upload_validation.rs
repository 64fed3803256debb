//! Upload validation: size limit, content type and blocked extensions.
//!
//! Validation runs on metadata only (filename and declared size). Bytes are
//! owned by the storage collaborator and never pass through courier.

use once_cell::sync::Lazy;
use std::collections::HashSet;

use crate::defaults::{UPLOAD_FALLBACK_CONTENT_TYPE, UPLOAD_MAX_SIZE_BYTES};

/// Blocked file extensions (case-insensitive)
static BLOCKED_EXTENSIONS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        // Windows executables
        "exe", "dll", "scr", "pif", "com", "msi", "msp", "mst", "bat", "cmd",
        // Unix binaries
        "so", "dylib", "out",
        // Java/JVM
        "jar", "war", "ear", "class",
        // Packages
        "deb", "rpm", "apk", "app", "dmg", "pkg",
        // Office macros
        "xlsm", "xlsb", "xltm", "docm", "dotm", "pptm", "potm", "ppam",
        // Other
        "reg", "inf", "scf", "lnk", "url", "hta",
    ]
    .into_iter()
    .collect()
});

/// Limits applied to an incoming file.
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    pub max_size_bytes: i64,
    /// `None` accepts any content type that is not blocked.
    pub allowed_types: Option<Vec<String>>,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            max_size_bytes: UPLOAD_MAX_SIZE_BYTES,
            allowed_types: None,
        }
    }
}

impl UploadPolicy {
    pub fn with_max_size_bytes(mut self, max: i64) -> Self {
        self.max_size_bytes = max;
        self
    }

    pub fn with_allowed_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_types = Some(types.into_iter().map(Into::into).collect());
        self
    }
}

/// Result of upload validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadValidation {
    /// Content type derived from the filename (never the client claim).
    pub content_type: String,
    pub size_bytes: i64,
    /// `Some` when the file must be stored as `failed`.
    pub rejection: Option<String>,
}

impl UploadValidation {
    pub fn is_accepted(&self) -> bool {
        self.rejection.is_none()
    }
}

/// Validate an upload by filename and declared size.
pub fn validate_upload(filename: &str, size_bytes: i64, policy: &UploadPolicy) -> UploadValidation {
    let content_type = guess_content_type(filename).to_string();
    let rejection = rejection_reason(filename, size_bytes, &content_type, policy);

    UploadValidation {
        content_type,
        size_bytes,
        rejection,
    }
}

fn rejection_reason(
    filename: &str,
    size_bytes: i64,
    content_type: &str,
    policy: &UploadPolicy,
) -> Option<String> {
    if size_bytes < 0 {
        return Some(format!("File size {} bytes is negative.", size_bytes));
    }

    if size_bytes > policy.max_size_bytes {
        return Some(format!(
            "File size {} bytes exceeds maximum of {} bytes.",
            size_bytes, policy.max_size_bytes
        ));
    }

    if let Some(ext) = extension(filename) {
        if BLOCKED_EXTENSIONS.contains(ext.as_str()) {
            return Some(format!("File extension .{} is not allowed.", ext));
        }
    }

    if let Some(allowed) = &policy.allowed_types {
        if !allowed.iter().any(|t| t == content_type) {
            return Some(format!(
                "File type '{}' is not allowed. Allowed types: {}",
                content_type,
                allowed.join(", ")
            ));
        }
    }

    None
}

fn extension(filename: &str) -> Option<String> {
    let (stem, ext) = filename.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_lowercase())
}

/// Guess a MIME type from the filename extension.
///
/// Unknown or missing extensions fall back to `application/octet-stream`.
pub fn guess_content_type(filename: &str) -> &'static str {
    extension(filename)
        .and_then(|ext| mime_from_extension(&ext))
        .unwrap_or(UPLOAD_FALLBACK_CONTENT_TYPE)
}

fn mime_from_extension(ext: &str) -> Option<&'static str> {
    match ext {
        // Text
        "txt" | "log" => Some("text/plain"),
        "csv" => Some("text/csv"),
        "tsv" => Some("text/tab-separated-values"),
        "html" | "htm" => Some("text/html"),
        "md" | "markdown" => Some("text/markdown"),
        "css" => Some("text/css"),
        "js" | "mjs" => Some("text/javascript"),
        // Structured
        "json" => Some("application/json"),
        "xml" => Some("application/xml"),
        "yaml" | "yml" => Some("application/yaml"),
        // Documents
        "pdf" => Some("application/pdf"),
        "doc" => Some("application/msword"),
        "docx" => Some("application/vnd.openxmlformats-officedocument.wordprocessingml.document"),
        "xls" => Some("application/vnd.ms-excel"),
        "xlsx" => Some("application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"),
        "ppt" => Some("application/vnd.ms-powerpoint"),
        "pptx" => Some("application/vnd.openxmlformats-officedocument.presentationml.presentation"),
        "odt" => Some("application/vnd.oasis.opendocument.text"),
        "rtf" => Some("application/rtf"),
        // Images
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "svg" => Some("image/svg+xml"),
        "tif" | "tiff" => Some("image/tiff"),
        "heic" => Some("image/heic"),
        // Audio / video
        "mp3" => Some("audio/mpeg"),
        "wav" => Some("audio/wav"),
        "mp4" => Some("video/mp4"),
        "mov" => Some("video/quicktime"),
        "webm" => Some("video/webm"),
        // Archives
        "zip" => Some("application/zip"),
        "gz" => Some("application/gzip"),
        "tar" => Some("application/x-tar"),
        _ => None,
    }
}
