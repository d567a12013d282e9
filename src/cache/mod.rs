//! Persistent per-file cache for incremental transcript parsing.
//!
//! Every source log gets its own manifest + index pair inside the project's
//! cache directory. The manifest records the source mtime/size and the library
//! version that wrote it; the index groups encoded records by normalized
//! timestamp so date-window queries can skip whole keys.
//!
//! ## Layout
//!
//! - `<cache_dir>/<file>.jsonl.index.json` - ordered `[key, [records]]` pairs
//! - `<cache_dir>/<file>.jsonl.manifest.json` - commit marker, written last

mod store;
mod version;

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64;

pub use store::{CacheManifest, CacheRecord, FileCacheStore, MTIME_TOLERANCE_MS, read_manifest};
pub use version::{BreakingChange, CompatibilityRules, LIBRARY_VERSION, parse_version};

/// Name of the per-project cache directory when no cache root is configured.
pub const PROJECT_CACHE_DIR: &str = "cache";

/// Why cached data for a file could not be used (or persisted).
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("no cache present")]
    Missing,
    #[error(
        "source changed since caching (cached mtime {cached_mtime_ms}, now {observed_mtime_ms})"
    )]
    Stale {
        cached_mtime_ms: i64,
        observed_mtime_ms: i64,
    },
    #[error("cache format {found} is incompatible with library {running}")]
    Incompatible { found: String, running: String },
    #[error("cache corrupt: {0}")]
    Corrupt(String),
    #[error("source unreadable: {0}")]
    SourceUnreadable(#[source] io::Error),
    #[error("cache write failed: {0}")]
    WriteFailed(String),
}

/// Resolve the cache directory for a project.
///
/// Without a root, caches live next to the logs in `<project>/cache`. With a
/// root, each project gets `<root>/<xxh3 of project path>`.
pub fn cache_dir_for(project_dir: &Path, root: Option<&Path>) -> PathBuf {
    match root {
        Some(root) => root.join(format!(
            "{:016x}",
            xxh3_64(project_dir.as_os_str().as_encoded_bytes())
        )),
        None => project_dir.join(PROJECT_CACHE_DIR),
    }
}

/// Statistics about a project's cache
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub cached_files: usize,
    pub total_records: usize,
    pub malformed_lines: usize,
    pub bytes_on_disk: u64,
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}
