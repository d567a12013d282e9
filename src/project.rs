//! Per-project cache orchestration.
//!
//! A project is one directory of `*.jsonl` transcripts. For every file the
//! manager either reuses the file's cache or reparses it (saving a fresh cache
//! on the way), then merges all files into one chronological stream.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rayon::prelude::*;

use crate::cache::{
    CacheError, CacheManifest, CacheStats, CompatibilityRules, FileCacheStore, cache_dir_for,
    read_manifest,
};
use crate::codec::{RecordCodec, TranscriptCodec};
use crate::types::{DateRange, SourceMetadata, TimelineEntry, TranscriptEntry};
use crate::utils::{fast_hash, warn_once};
use crate::{debug_log, filter};

const INDEX_SUFFIX: &str = ".index.json";
const MANIFEST_SUFFIX: &str = ".manifest.json";

/// What went wrong with one file. None of these abort a load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// One line was skipped. `line` is 1-based.
    MalformedRecord { line: usize, reason: String },
    /// The log file could not be read; it contributes nothing.
    SourceUnreadable(String),
    /// Cache existed but could not be decoded; the file was reparsed.
    CacheCorrupt(String),
    /// Cache was written by an incompatible release; the file was reparsed.
    CacheIncompatible { found: String, running: String },
    /// Fresh results were returned but could not be persisted.
    CacheWriteFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiagnostic {
    pub path: PathBuf,
    pub kind: DiagnosticKind,
}

impl fmt::Display for FileDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = self.path.display();
        match &self.kind {
            DiagnosticKind::MalformedRecord { line, reason } => {
                write!(f, "Line {line} of {path} | {reason}")
            }
            DiagnosticKind::SourceUnreadable(e) => write!(f, "Could not read {path}: {e}"),
            DiagnosticKind::CacheCorrupt(e) => {
                write!(f, "Cache for {path} is corrupt ({e}), reparsed")
            }
            DiagnosticKind::CacheIncompatible { found, running } => write!(
                f,
                "Cache for {path} was written by {found}, incompatible with {running}; reparsed"
            ),
            DiagnosticKind::CacheWriteFailed(e) => write!(f, "Could not cache {path}: {e}"),
        }
    }
}

/// Result of loading one project (or several, via the aggregator).
#[derive(Debug, Clone, Default)]
pub struct ProjectLoad {
    pub entries: Vec<TimelineEntry>,
    pub diagnostics: Vec<FileDiagnostic>,
}

impl ProjectLoad {
    pub fn records(&self) -> impl Iterator<Item = &TranscriptEntry> {
        self.entries.iter().map(|e| &e.entry)
    }
}

#[derive(Clone)]
pub struct ProjectOptions {
    /// Shared cache root; `None` keeps caches in `<project>/cache`.
    pub cache_root: Option<PathBuf>,
    pub rules: CompatibilityRules,
    /// When false every file is parsed and nothing is written.
    pub use_cache: bool,
    pub codec: Arc<dyn RecordCodec>,
}

impl Default for ProjectOptions {
    fn default() -> Self {
        Self {
            cache_root: None,
            rules: CompatibilityRules::builtin(),
            use_cache: true,
            codec: Arc::new(TranscriptCodec::new()),
        }
    }
}

impl fmt::Debug for ProjectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectOptions")
            .field("cache_root", &self.cache_root)
            .field("rules", &self.rules)
            .field("use_cache", &self.use_cache)
            .finish()
    }
}

/// Owns the file cache stores of one project directory.
///
/// Construct one per project and drop it when done; there is no process-wide
/// registry. Only one manager should be authoritative for a directory at a time.
#[derive(Debug)]
pub struct ProjectCacheManager {
    project_dir: PathBuf,
    cache_dir: PathBuf,
    options: ProjectOptions,
    stores: BTreeMap<PathBuf, FileCacheStore>,
}

impl ProjectCacheManager {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self::with_options(project_dir, ProjectOptions::default())
    }

    pub fn with_options(project_dir: impl Into<PathBuf>, options: ProjectOptions) -> Self {
        let project_dir = project_dir.into();
        let cache_dir = cache_dir_for(&project_dir, options.cache_root.as_deref());
        Self {
            project_dir,
            cache_dir,
            options,
            stores: BTreeMap::new(),
        }
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// `*.jsonl` files directly inside the project directory, sorted by path.
    pub fn discover_sources(&self) -> Result<Vec<PathBuf>> {
        if !self.project_dir.is_dir() {
            anyhow::bail!("{} is not a directory", self.project_dir.display());
        }
        let pattern = format!(
            "{}/*.jsonl",
            glob::Pattern::escape(&self.project_dir.to_string_lossy())
        );
        let mut sources = Vec::new();
        for entry in glob::glob(&pattern)? {
            let path = entry?;
            if path.is_file() {
                sources.push(path);
            }
        }
        sources.sort();
        Ok(sources)
    }

    /// Entries of every discovered transcript in `range`, merged chronologically.
    pub fn get_entries(&mut self, range: &DateRange) -> Result<ProjectLoad> {
        let sources = self
            .discover_sources()
            .with_context(|| format!("Failed to list {}", self.project_dir.display()))?;
        Ok(self.get_entries_for(&sources, range))
    }

    /// Same as [`Self::get_entries`] for an explicit list of files. Files are
    /// processed in parallel; each file's store is used by one worker only.
    ///
    /// Sources may live outside the project directory. Paths naming the same
    /// file are loaded once, under the first spelling given.
    pub fn get_entries_for(&mut self, sources: &[PathBuf], range: &DateRange) -> ProjectLoad {
        let mut ordered: Vec<PathBuf> = Vec::with_capacity(sources.len());
        for source in sources {
            let key = self.ensure_store(source);
            if !ordered.contains(&key) {
                ordered.push(key);
            }
        }

        let stores: Vec<&FileCacheStore> = ordered.iter().map(|key| &self.stores[key]).collect();
        let options = &self.options;
        let loads: Vec<FileLoad> = stores
            .into_par_iter()
            .map(|store| load_file(store, options, range))
            .collect();

        let mut diagnostics = Vec::new();
        let mut files = Vec::with_capacity(loads.len());
        for load in loads {
            diagnostics.extend(load.diagnostics);
            files.push((load.source, load.entries));
        }

        ProjectLoad {
            entries: merge_file_streams(files),
            diagnostics,
        }
    }

    /// Summed manifest data for the project's discovered sources.
    pub fn cache_stats(&mut self) -> Result<CacheStats> {
        let mut stats = CacheStats::default();
        for source in self.discover_sources()? {
            let key = self.ensure_store(&source);
            let store = &self.stores[&key];
            if let Ok(manifest) = store.manifest() {
                stats.cached_files += 1;
                stats.total_records += manifest.entry_count;
                stats.malformed_lines += manifest.malformed_lines;
            }
            stats.bytes_on_disk += store.disk_usage();
        }
        Ok(stats)
    }

    /// Delete every cache file of this project. Returns the number removed.
    pub fn clear_cache(&mut self) -> Result<usize> {
        let removed = self.remove_cache_files(|_| true)?;
        self.stores.clear();
        // Only drop the directory if nothing else lives there.
        let _ = fs::remove_dir(&self.cache_dir);
        Ok(removed)
    }

    /// Delete cache files whose source transcript no longer exists.
    pub fn prune(&mut self) -> Result<usize> {
        let removed =
            self.remove_cache_files(|cache_name| !self.recorded_source(cache_name).is_file())?;
        self.stores.retain(|path, _| path.is_file());
        Ok(removed)
    }

    /// Register a store for `source` if needed; returns its key (the
    /// canonical source path).
    fn ensure_store(&mut self, source: &Path) -> PathBuf {
        let key = canonical_path(source);
        if !self.stores.contains_key(&key) {
            let cache_name = self.cache_name_for(&key);
            let store = FileCacheStore::with_cache_name(
                source,
                &self.cache_dir,
                &cache_name,
                self.options.rules.clone(),
            );
            self.stores.insert(key.clone(), store);
        }
        key
    }

    /// Files directly inside the project are cached under their own name.
    /// Anything else gets a hash of its path in the name, so same-named
    /// files from different directories never share cache files.
    fn cache_name_for(&self, source: &Path) -> String {
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let project_dir = canonical_path(&self.project_dir);
        if !file_name.is_empty() && source.parent() == Some(project_dir.as_path()) {
            return file_name;
        }

        let hash = fast_hash(&source.to_string_lossy());
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        match source.extension() {
            Some(ext) => format!("{stem}-{hash}.{}", ext.to_string_lossy()),
            None => format!("{stem}-{hash}"),
        }
    }

    /// Source a cache name belongs to: the path recorded in its manifest, else
    /// the same-named file in the project directory.
    fn recorded_source(&self, cache_name: &str) -> PathBuf {
        let manifest_path = self.cache_dir.join(format!("{cache_name}{MANIFEST_SUFFIX}"));
        match read_manifest(&manifest_path) {
            Ok(CacheManifest {
                source_path: Some(path),
                ..
            }) => PathBuf::from(path),
            _ => self.project_dir.join(cache_name),
        }
    }

    /// Remove cache files (and leftover temp files) for which `should_remove`
    /// returns true, given the cache name they belong to.
    fn remove_cache_files(&self, should_remove: impl Fn(&str) -> bool) -> Result<usize> {
        let entries = match fs::read_dir(&self.cache_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read {}", self.cache_dir.display()));
            }
        };

        let mut removed = 0;
        for entry in entries {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let cache_name = [INDEX_SUFFIX, MANIFEST_SUFFIX, ".index.tmp", ".manifest.tmp"]
                .iter()
                .find_map(|suffix| name.strip_suffix(suffix));
            if let Some(cache_name) = cache_name
                && should_remove(cache_name)
            {
                fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// `path` with symlinks and `..` resolved. A missing file resolves through
/// its parent directory; if that fails too the path is kept as given.
fn canonical_path(path: &Path) -> PathBuf {
    if let Ok(resolved) = fs::canonicalize(path) {
        return resolved;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => fs::canonicalize(parent)
            .map(|dir| dir.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

struct FileLoad {
    source: Arc<Path>,
    entries: Vec<TranscriptEntry>,
    diagnostics: Vec<FileDiagnostic>,
}

impl FileLoad {
    fn diagnose(&mut self, kind: DiagnosticKind) {
        self.diagnostics.push(FileDiagnostic {
            path: self.source.to_path_buf(),
            kind,
        });
    }
}

/// Reuse-or-reparse for one file.
fn load_file(store: &FileCacheStore, options: &ProjectOptions, range: &DateRange) -> FileLoad {
    let mut load = FileLoad {
        source: Arc::from(store.source()),
        entries: Vec::new(),
        diagnostics: Vec::new(),
    };

    // Observe before reading so an append during the parse invalidates the cache.
    let observed = match SourceMetadata::from_path(store.source()) {
        Ok(meta) => meta,
        Err(e) => {
            load.diagnose(DiagnosticKind::SourceUnreadable(e.to_string()));
            return load;
        }
    };

    if options.use_cache {
        match store.load_checked(&observed, range) {
            Ok(records) => {
                for record in records {
                    match options.codec.decode_record(&record.payload) {
                        Ok(entry) => load.entries.push(entry),
                        Err(e) => load.diagnose(DiagnosticKind::MalformedRecord {
                            line: record.seq as usize + 1,
                            reason: e.reason,
                        }),
                    }
                }
                return load;
            }
            Err(CacheError::Incompatible { found, running }) => {
                load.diagnose(DiagnosticKind::CacheIncompatible { found, running });
            }
            Err(CacheError::Corrupt(reason)) => {
                load.diagnose(DiagnosticKind::CacheCorrupt(reason));
            }
            Err(e) => {
                debug_log::log("CACHE", "MISS", &format!("{}: {e}", store.source().display()));
            }
        }
    }

    let bytes = match fs::read(store.source()) {
        Ok(bytes) => bytes,
        Err(e) => {
            load.diagnose(DiagnosticKind::SourceUnreadable(e.to_string()));
            return load;
        }
    };

    let mut entries = Vec::new();
    let mut malformed = 0;
    for (line_no, raw) in bytes.split(|b| *b == b'\n').enumerate() {
        let decoded = std::str::from_utf8(raw)
            .map_err(|e| format!("invalid UTF-8: {e}"))
            .and_then(|line| {
                if line.trim().is_empty() {
                    Ok(None)
                } else {
                    options
                        .codec
                        .decode_line(line)
                        .map(Some)
                        .map_err(|e| e.reason)
                }
            });
        match decoded {
            Ok(Some(entry)) => entries.push(entry),
            Ok(None) => {}
            Err(reason) => {
                malformed += 1;
                load.diagnose(DiagnosticKind::MalformedRecord {
                    line: line_no + 1,
                    reason,
                });
            }
        }
    }

    if options.use_cache {
        let saved = save_entries(
            store,
            options.codec.as_ref(),
            &entries,
            &observed,
            malformed,
        );
        if let Err(e) = saved {
            let detail = format!("{}: {e:#}", store.source().display());
            debug_log::log("CACHE", "WRITE_FAIL", &detail);
            warn_once(format!(
                "Warning: could not cache {}: {e}",
                store.source().display()
            ));
            load.diagnose(DiagnosticKind::CacheWriteFailed(e.to_string()));
        }
    }

    load.entries = filter::filter_by_date(entries, range);
    load
}

fn save_entries(
    store: &FileCacheStore,
    codec: &dyn RecordCodec,
    entries: &[TranscriptEntry],
    observed: &SourceMetadata,
    malformed: usize,
) -> Result<()> {
    let pairs = entries
        .iter()
        .map(|entry| Ok((entry.cache_key(), codec.encode_record(entry)?)))
        .collect::<Result<Vec<_>>>()?;
    store.save(pairs, observed, malformed)?;
    Ok(())
}

/// Merge per-file streams (each in file order) into one timeline.
///
/// Timestamped entries sort by their own instant. An entry without one keeps
/// its place next to its file neighbours: it borrows the instant of the
/// closest preceding timestamped entry in the same file, else the closest
/// following one. Entries of files with no timestamps at all borrow the
/// earliest instant of the whole project, or stay unanchored (sorted first).
/// The sort is stable, so ties keep file order, then in-file order.
pub fn merge_file_streams(files: Vec<(Arc<Path>, Vec<TranscriptEntry>)>) -> Vec<TimelineEntry> {
    let anchored: Vec<(Arc<Path>, Vec<(TranscriptEntry, Option<DateTime<Utc>>)>)> = files
        .into_iter()
        .map(|(source, entries)| (source, anchor_within_file(entries)))
        .collect();

    let project_first = anchored
        .iter()
        .flat_map(|(_, entries)| entries.iter().filter_map(|(_, at)| *at))
        .min();

    let mut timeline = Vec::new();
    for (source, entries) in anchored {
        for (entry, at) in entries {
            timeline.push(TimelineEntry {
                entry,
                source: Arc::clone(&source),
                sort_at: at.or(project_first),
            });
        }
    }

    timeline.sort_by(|a, b| a.sort_at.cmp(&b.sort_at));
    timeline
}

fn anchor_within_file(
    entries: Vec<TranscriptEntry>,
) -> Vec<(TranscriptEntry, Option<DateTime<Utc>>)> {
    let own: Vec<Option<DateTime<Utc>>> = entries.iter().map(|e| e.instant()).collect();

    let mut anchors = own.clone();
    let mut previous = None;
    for (i, at) in own.iter().enumerate() {
        match at {
            Some(_) => previous = *at,
            None => anchors[i] = previous,
        }
    }
    let mut next = None;
    for (i, at) in own.iter().enumerate().rev() {
        match at {
            Some(_) => next = *at,
            None if anchors[i].is_none() => anchors[i] = next,
            None => {}
        }
    }

    entries.into_iter().zip(anchors).collect()
}

/// Project directories under `root`: non-hidden subdirectories, sorted.
pub fn discover_projects(root: &Path) -> Result<Vec<PathBuf>> {
    let mut projects = Vec::new();
    for entry in fs::read_dir(root).with_context(|| format!("Failed to read {}", root.display()))? {
        let entry = entry?;
        let path = entry.path();
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if path.is_dir() && !hidden {
            projects.push(path);
        }
    }
    projects.sort();
    Ok(projects)
}

/// Default location of Claude Code project transcripts.
pub fn default_projects_root() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;
    Ok(home.join(".claude").join("projects"))
}
