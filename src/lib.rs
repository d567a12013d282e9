//! Incremental cache and chronological aggregation for Claude Code session
//! transcripts (`~/.claude/projects/<project>/<session>.jsonl`).

pub mod aggregate;
pub mod cache;
pub mod codec;
pub mod config;
pub mod dates;
pub mod debug_log;
pub mod filter;
pub mod project;
pub mod sessions;
pub mod types;
pub mod utils;

pub use aggregate::{DirectoryAggregator, aggregate};
pub use cache::{CacheError, CompatibilityRules, FileCacheStore};
pub use codec::{RecordCodec, TranscriptCodec};
pub use project::{
    DiagnosticKind, FileDiagnostic, ProjectCacheManager, ProjectLoad, ProjectOptions,
};
pub use types::{DateRange, TimelineEntry, TranscriptEntry};
