//! Line codec for Claude Code JSONL transcripts.
//!
//! The cache core only needs three operations from a codec: decode a raw log
//! line, and encode/decode a record to and from the opaque payload stored in
//! a cache index. [`TranscriptCodec`] is the implementation for Claude Code
//! transcripts.

use simd_json::OwnedValue;
use simd_json::prelude::*;
use thiserror::Error;

use crate::types::{EntryKind, TranscriptEntry};

/// A single log line that could not be turned into a record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed record: {reason}")]
pub struct MalformedRecord {
    pub reason: String,
}

impl MalformedRecord {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

pub trait RecordCodec: Send + Sync {
    /// Decode one raw line. Callers skip blank lines before calling this.
    fn decode_line(&self, raw: &str) -> Result<TranscriptEntry, MalformedRecord>;

    /// Serialize a record into the opaque payload stored in the cache.
    fn encode_record(&self, record: &TranscriptEntry) -> anyhow::Result<String>;

    /// Inverse of [`RecordCodec::encode_record`].
    fn decode_record(&self, payload: &str) -> Result<TranscriptEntry, MalformedRecord>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TranscriptCodec;

impl TranscriptCodec {
    pub fn new() -> Self {
        Self
    }
}

impl RecordCodec for TranscriptCodec {
    fn decode_line(&self, raw: &str) -> Result<TranscriptEntry, MalformedRecord> {
        let mut bytes = raw.trim().as_bytes().to_vec();
        let value: OwnedValue = simd_json::from_slice(&mut bytes)
            .map_err(|e| MalformedRecord::new(format!("JSON decode error: {e}")))?;

        if value.as_object().is_none() {
            return Err(MalformedRecord::new("not a JSON object"));
        }

        let kind = match value.get("type").and_then(|v| v.as_str()) {
            Some(tag) => EntryKind::from_type_tag(tag)
                .ok_or_else(|| MalformedRecord::new(format!("unrecognised type `{tag}`")))?,
            None => return Err(MalformedRecord::new("missing `type` field")),
        };

        let entry: TranscriptEntry = simd_json::serde::from_owned_value(value)
            .map_err(|e| MalformedRecord::new(format!("invalid {kind:?} record: {e}")))?;

        if kind != EntryKind::Summary {
            match entry.timestamp.as_deref() {
                None => return Err(MalformedRecord::new("missing `timestamp` field")),
                Some(raw_ts) if entry.instant().is_none() => {
                    return Err(MalformedRecord::new(format!(
                        "unparseable timestamp `{raw_ts}`"
                    )));
                }
                Some(_) => {}
            }
        }

        Ok(entry)
    }

    fn encode_record(&self, record: &TranscriptEntry) -> anyhow::Result<String> {
        Ok(simd_json::to_string(record)?)
    }

    fn decode_record(&self, payload: &str) -> Result<TranscriptEntry, MalformedRecord> {
        let mut bytes = payload.as_bytes().to_vec();
        simd_json::from_slice(&mut bytes)
            .map_err(|e| MalformedRecord::new(format!("cached payload: {e}")))
    }
}
