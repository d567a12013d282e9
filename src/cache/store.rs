//! Per-file cache store: one manifest + one timestamp index per source log.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::CacheError;
use super::version::CompatibilityRules;
use crate::{debug_log, filter};
use crate::types::{DateRange, NO_TIMESTAMP_KEY, SourceMetadata};

/// Maximum mtime drift (ms) still treated as "unchanged". Absorbs filesystem
/// timestamp granularity differences.
pub const MTIME_TOLERANCE_MS: i64 = 1000;

/// Per-file metadata, written after the index and read before any reuse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheManifest {
    pub source_mtime_ms: i64,
    #[serde(default)]
    pub source_size: Option<u64>,
    pub cache_format_version: String,
    pub entry_count: usize,
    #[serde(default)]
    pub malformed_lines: usize,
    /// Source log this cache describes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
}

impl CacheManifest {
    /// Whether the observed source still matches what this manifest describes.
    pub fn is_fresh(&self, observed: &SourceMetadata) -> bool {
        if (observed.mtime_ms - self.source_mtime_ms).abs() > MTIME_TOLERANCE_MS {
            return false;
        }
        match self.source_size {
            Some(size) => size == observed.size,
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StoredRecord {
    seq: u32,
    payload: String,
}

/// Timestamp key -> records sharing that key, as an ordered list of pairs.
/// Key order is first-occurrence order of the save input; record order within
/// a key is input order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct CacheIndex {
    keys: Vec<(String, Vec<StoredRecord>)>,
}

impl CacheIndex {
    fn build<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut keys: Vec<(String, Vec<StoredRecord>)> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();

        for (seq, (key, payload)) in entries.into_iter().enumerate() {
            let record = StoredRecord {
                seq: seq as u32,
                payload,
            };
            match positions.get(&key) {
                Some(&pos) => keys[pos].1.push(record),
                None => {
                    positions.insert(key.clone(), keys.len());
                    keys.push((key, vec![record]));
                }
            }
        }

        Self { keys }
    }

    fn record_count(&self) -> usize {
        self.keys.iter().map(|(_, records)| records.len()).sum()
    }
}

/// One cached record as handed back to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRecord {
    /// Normalized timestamp key, or [`NO_TIMESTAMP_KEY`].
    pub key: String,
    /// Position among the decoded records of the source file.
    pub seq: u32,
    /// Opaque payload produced by the record codec.
    pub payload: String,
}

impl CacheRecord {
    pub fn is_sentinel(&self) -> bool {
        self.key == NO_TIMESTAMP_KEY
    }
}

/// Owns the on-disk cache pair for exactly one source file.
///
/// Two stores for different source files share nothing and may be used from
/// different threads at once. Operations on the same source file must be
/// serialized by the caller; there is no locking here.
#[derive(Debug, Clone)]
pub struct FileCacheStore {
    source: PathBuf,
    index_path: PathBuf,
    manifest_path: PathBuf,
    rules: CompatibilityRules,
}

impl FileCacheStore {
    /// Store whose cache files are named after the source's file name.
    pub fn new(source: impl Into<PathBuf>, cache_dir: &Path, rules: CompatibilityRules) -> Self {
        let source = source.into();
        let cache_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| crate::utils::fast_hash(&source.to_string_lossy()));
        Self::with_cache_name(source, cache_dir, &cache_name, rules)
    }

    /// Store writing `<cache_name>.index.json` and `<cache_name>.manifest.json`.
    /// Two stores sharing a cache directory must use different names.
    pub fn with_cache_name(
        source: impl Into<PathBuf>,
        cache_dir: &Path,
        cache_name: &str,
        rules: CompatibilityRules,
    ) -> Self {
        Self {
            index_path: cache_dir.join(format!("{cache_name}.index.json")),
            manifest_path: cache_dir.join(format!("{cache_name}.manifest.json")),
            source: source.into(),
            rules,
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    /// True when a manifest + index pair exists, its format is compatible, the
    /// source is unchanged, and the index decodes. Any failure means "reparse".
    pub fn is_reusable(&self) -> bool {
        match SourceMetadata::from_path(&self.source) {
            Ok(observed) => self.validate(&observed).is_ok(),
            Err(_) => false,
        }
    }

    /// All cached records in source-file order.
    pub fn load_all(&self) -> Result<Vec<CacheRecord>, CacheError> {
        let observed = self.observe_source()?;
        self.load_checked(&observed, &DateRange::unbounded())
    }

    /// Records whose key lies in `range`, plus every no-timestamp record.
    pub fn load_range(&self, range: &DateRange) -> Result<Vec<CacheRecord>, CacheError> {
        let observed = self.observe_source()?;
        self.load_checked(&observed, range)
    }

    /// Validate against already-observed source metadata, then load.
    ///
    /// The whole index is read and parsed first. Records under keys outside
    /// the range are then dropped, so callers never decode their payloads.
    pub fn load_checked(
        &self,
        observed: &SourceMetadata,
        range: &DateRange,
    ) -> Result<Vec<CacheRecord>, CacheError> {
        let (_, index) = self.validate(observed)?;

        let mut records = Vec::new();
        for (key, stored) in index.keys {
            match filter::key_in_range(&key, range) {
                Some(true) => {}
                Some(false) => continue,
                None => {
                    return Err(CacheError::Corrupt(format!("invalid timestamp key `{key}`")));
                }
            }
            records.extend(stored.into_iter().map(|s| CacheRecord {
                key: key.clone(),
                seq: s.seq,
                payload: s.payload,
            }));
        }
        records.sort_by_key(|r| r.seq);

        debug_log::log(
            "CACHE",
            "HIT",
            &format!("{} ({} records)", self.source.display(), records.len()),
        );
        Ok(records)
    }

    /// Persist `(timestamp key, payload)` pairs in source order.
    ///
    /// The previous manifest is removed first and the new one is written last,
    /// so an interrupted save never leaves a manifest next to a partial index.
    pub fn save<I>(
        &self,
        entries: I,
        source_meta: &SourceMetadata,
        malformed_lines: usize,
    ) -> Result<(), CacheError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let index = CacheIndex::build(entries);
        let manifest = CacheManifest {
            source_mtime_ms: source_meta.mtime_ms,
            source_size: Some(source_meta.size),
            cache_format_version: self.rules.library_version().to_string(),
            entry_count: index.record_count(),
            malformed_lines,
            source_path: Some(self.source.to_string_lossy().into_owned()),
        };

        let index_bytes = simd_json::to_vec(&index).map_err(|e| write_failed(&self.index_path, e))?;
        let manifest_bytes =
            simd_json::to_vec_pretty(&manifest).map_err(|e| write_failed(&self.manifest_path, e))?;

        if let Some(dir) = self.index_path.parent() {
            fs::create_dir_all(dir).map_err(|e| write_failed(dir, e))?;
        }
        remove_if_exists(&self.manifest_path)
            .map_err(|e| write_failed(&self.manifest_path, e))?;
        write_atomic(&self.index_path, &index_bytes)
            .map_err(|e| write_failed(&self.index_path, e))?;
        write_atomic(&self.manifest_path, &manifest_bytes)
            .map_err(|e| write_failed(&self.manifest_path, e))?;

        debug_log::log(
            "CACHE",
            "SAVE",
            &format!("{} ({} records)", self.source.display(), manifest.entry_count),
        );
        Ok(())
    }

    /// Read the manifest without validating it.
    pub fn manifest(&self) -> Result<CacheManifest, CacheError> {
        read_manifest(&self.manifest_path)
    }

    /// Delete both cache files. Missing files are not an error.
    pub fn clear(&self) -> io::Result<()> {
        remove_if_exists(&self.manifest_path)?;
        remove_if_exists(&self.index_path)
    }

    /// Bytes currently used on disk by this store.
    pub fn disk_usage(&self) -> u64 {
        [&self.index_path, &self.manifest_path]
            .iter()
            .filter_map(|p| fs::metadata(p).ok())
            .map(|m| m.len())
            .sum()
    }

    fn observe_source(&self) -> Result<SourceMetadata, CacheError> {
        SourceMetadata::from_path(&self.source).map_err(CacheError::SourceUnreadable)
    }

    fn validate(
        &self,
        observed: &SourceMetadata,
    ) -> Result<(CacheManifest, CacheIndex), CacheError> {
        let manifest = self.manifest()?;

        if !self.rules.is_compatible(&manifest.cache_format_version) {
            return Err(CacheError::Incompatible {
                found: manifest.cache_format_version,
                running: self.rules.library_version().to_string(),
            });
        }

        if !manifest.is_fresh(observed) {
            return Err(CacheError::Stale {
                cached_mtime_ms: manifest.source_mtime_ms,
                observed_mtime_ms: observed.mtime_ms,
            });
        }

        let mut bytes = fs::read(&self.index_path)
            .map_err(|e| CacheError::Corrupt(format!("index unreadable: {e}")))?;
        let index: CacheIndex = simd_json::from_slice(&mut bytes)
            .map_err(|e| CacheError::Corrupt(format!("index undecodable: {e}")))?;

        let count = index.record_count();
        if count != manifest.entry_count {
            return Err(CacheError::Corrupt(format!(
                "index holds {count} records, manifest expects {}",
                manifest.entry_count
            )));
        }

        Ok((manifest, index))
    }
}

/// Read and decode a manifest file on its own.
pub fn read_manifest(path: &Path) -> Result<CacheManifest, CacheError> {
    let mut bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(CacheError::Missing),
        Err(e) => return Err(CacheError::Corrupt(format!("manifest unreadable: {e}"))),
    };
    simd_json::from_slice(&mut bytes)
        .map_err(|e| CacheError::Corrupt(format!("manifest undecodable: {e}")))
}

fn write_failed(path: &Path, err: impl std::fmt::Display) -> CacheError {
    CacheError::WriteFailed(format!("{}: {err}", path.display()))
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

// Atomic write via temp file + rename
fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let temp_path = path.with_extension("tmp");
    let mut file = File::create(&temp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&temp_path, path)
}
