use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use simd_json::OwnedValue;

/// Timestamp key used for records that carry no time of their own (summaries).
pub const NO_TIMESTAMP_KEY: &str = "_no_timestamp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    User,
    Assistant,
    System,
    Summary,
}

impl EntryKind {
    pub fn from_type_tag(tag: &str) -> Option<Self> {
        match tag {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            "summary" => Some(Self::Summary),
            _ => None,
        }
    }
}

/// One decoded transcript line.
///
/// `message` and `content` are kept as opaque JSON; rendering them is someone
/// else's job. Unknown top-level fields are dropped on decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_sidechain: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<OwnedValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<OwnedValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leaf_uuid: Option<String>,
}

impl TranscriptEntry {
    /// Parsed instant of this entry, `None` for summaries and unparseable stamps.
    pub fn instant(&self) -> Option<DateTime<Utc>> {
        self.timestamp.as_deref().and_then(parse_timestamp)
    }

    pub fn is_summary(&self) -> bool {
        self.kind == EntryKind::Summary
    }

    /// Index key this entry is stored under in a file cache.
    pub fn cache_key(&self) -> String {
        match self.instant() {
            Some(instant) => timestamp_key(&instant),
            None => NO_TIMESTAMP_KEY.to_string(),
        }
    }
}

/// Parse a transcript timestamp. Accepts RFC 3339 and offset-less ISO 8601
/// (interpreted as UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Normalized cache key for an instant: UTC, nanosecond precision, `Z` suffix.
/// Lexical order of these keys is chronological order.
pub fn timestamp_key(instant: &DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Observed metadata of a source log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceMetadata {
    /// Modification time in milliseconds since the Unix epoch.
    pub mtime_ms: i64,
    pub size: u64,
}

impl SourceMetadata {
    pub fn from_path(path: &Path) -> io::Result<Self> {
        let meta = fs::metadata(path)?;
        let modified = meta.modified()?;
        let mtime_ms = match modified.duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_millis() as i64,
            Err(e) => -(e.duration().as_millis() as i64),
        };
        Ok(Self {
            mtime_ms,
            size: meta.len(),
        })
    }
}

/// A resolved, inclusive `[from, to]` window. Either side may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn new(from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Self {
        Self { from, to }
    }

    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn is_unbounded(&self) -> bool {
        self.from.is_none() && self.to.is_none()
    }

    pub fn contains(&self, instant: &DateTime<Utc>) -> bool {
        if let Some(from) = &self.from
            && instant < from
        {
            return false;
        }
        if let Some(to) = &self.to
            && instant > to
        {
            return false;
        }
        true
    }
}

/// A decoded entry positioned on a merged timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    pub entry: TranscriptEntry,
    /// Source log file the entry came from.
    pub source: Arc<Path>,
    /// Instant used for ordering. For timestamped entries this is their own
    /// instant; for summaries it is borrowed from a neighbour in the same
    /// file (or the project's earliest instant). `None` means unanchored.
    pub sort_at: Option<DateTime<Utc>>,
}
