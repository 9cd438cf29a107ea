//! Truncation of long text fields before they are sent to the backend.
//!
//! Design rules:
//! - Limits are counted in characters, never bytes, so multi-byte text is
//!   never split inside a character
//! - A truncated string is exactly `limit` characters long and ends with the
//!   marker ` [truncated from N chars]`
//! - Every truncation is reported through [`TruncationMeta`], which carries a
//!   digest of the full text so the original can be matched later

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Default character limit
pub const DEFAULT_MAX_CHARS: usize = 20_000;

/// What happened to a text field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncationMeta {
    pub truncated: bool,
    pub orig_len: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kept_len: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl TruncationMeta {
    fn untouched(len: usize) -> Self {
        Self {
            truncated: false,
            orig_len: len,
            kept_len: None,
            sha256: None,
        }
    }
}

fn marker(orig_len: usize) -> String {
    format!(" [truncated from {} chars]", orig_len)
}

/// Hex SHA-256 of a string
pub fn sha256_hex(s: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Truncate `s` to at most `limit` characters.
///
/// When the limit is shorter than the marker itself, the marker is cut to
/// `limit` characters and no original text is kept.
pub fn truncate_text(s: &str, limit: usize) -> (String, TruncationMeta) {
    let orig_len = s.chars().count();
    if orig_len <= limit {
        return (s.to_string(), TruncationMeta::untouched(orig_len));
    }

    let marker = marker(orig_len);
    let marker_len = marker.chars().count();
    let (out, kept) = if limit > marker_len {
        let keep = limit - marker_len;
        let mut head: String = s.chars().take(keep).collect();
        head.push_str(&marker);
        (head, keep)
    } else {
        (marker.chars().take(limit).collect(), 0)
    };

    let meta = TruncationMeta {
        truncated: true,
        orig_len,
        kept_len: Some(kept),
        sha256: Some(sha256_hex(s)),
    };
    (out, meta)
}

/// Truncate a JSON value for display as a span input or output.
///
/// Strings are truncated directly. Structured values pass through unchanged
/// when their serialized form fits, otherwise they are replaced by their
/// truncated serialization.
pub fn truncate_value(value: &Value, limit: usize) -> (Value, Option<TruncationMeta>) {
    match value {
        Value::String(s) => {
            let (out, meta) = truncate_text(s, limit);
            let meta = meta.truncated.then_some(meta);
            (Value::String(out), meta)
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => (value.clone(), None),
        _ => {
            let serialized = value.to_string();
            if serialized.chars().count() <= limit {
                (value.clone(), None)
            } else {
                let (out, meta) = truncate_text(&serialized, limit);
                (Value::String(out), Some(meta))
            }
        }
    }
}
