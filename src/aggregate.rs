//! Cross-project timeline.

use std::path::Path;

use crate::project::{DiagnosticKind, FileDiagnostic, ProjectCacheManager, ProjectLoad};
use crate::types::DateRange;

/// Borrows a set of project managers for one directory-wide view.
///
/// Nothing is persisted here; each manager keeps owning its own caches.
pub struct DirectoryAggregator<'a> {
    managers: Vec<&'a mut ProjectCacheManager>,
}

impl<'a> DirectoryAggregator<'a> {
    pub fn new(managers: impl IntoIterator<Item = &'a mut ProjectCacheManager>) -> Self {
        Self {
            managers: managers.into_iter().collect(),
        }
    }

    pub fn project_dirs(&self) -> impl Iterator<Item = &Path> {
        self.managers.iter().map(|m| m.project_dir())
    }

    /// One deterministic timeline across every project.
    ///
    /// Projects are loaded in the order given. The final sort is stable, so
    /// unanchored entries (whole projects without a single timestamp) come
    /// first in project order, and ties keep project then local order.
    /// Such entries have no instant to compare against, and `None` sorts
    /// before every `Some`, which keeps them visible and in a fixed place.
    pub fn aggregate(&mut self, range: &DateRange) -> ProjectLoad {
        let mut combined = ProjectLoad::default();

        for manager in self.managers.iter_mut() {
            match manager.get_entries(range) {
                Ok(load) => {
                    combined.entries.extend(load.entries);
                    combined.diagnostics.extend(load.diagnostics);
                }
                Err(e) => combined.diagnostics.push(FileDiagnostic {
                    path: manager.project_dir().to_path_buf(),
                    kind: DiagnosticKind::SourceUnreadable(format!("{e:#}")),
                }),
            }
        }

        combined.entries.sort_by(|a, b| a.sort_at.cmp(&b.sort_at));
        combined
    }
}

/// Shorthand for [`DirectoryAggregator::aggregate`]. Projects with no
/// timestamp at all lead the result, since there is nothing to place them by.
pub fn aggregate<'a>(
    managers: impl IntoIterator<Item = &'a mut ProjectCacheManager>,
    range: &DateRange,
) -> ProjectLoad {
    DirectoryAggregator::new(managers).aggregate(range)
}
