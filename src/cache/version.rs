//! Cache format compatibility.
//!
//! Each manifest is stamped with the library version that wrote it. A table of
//! breaking changes names the historical cache shapes that newer releases can
//! no longer read; everything else stays valid across upgrades.

use std::sync::Arc;

pub const LIBRARY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Caches written by releases before the ordered-pair index layout.
const BUILTIN_BREAKING_CHANGES: &[(&str, &str)] = &[("0.1.x", "0.3.0"), ("0.2.x", "0.3.0")];

/// Caches whose format version matches `pattern` are invalid once the running
/// library is at least `min_required`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakingChange {
    /// Exact version (`0.2.4`) or a line wildcard (`0.2.x`, `2.x`).
    pub pattern: String,
    pub min_required: String,
}

impl BreakingChange {
    pub fn new(pattern: impl Into<String>, min_required: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            min_required: min_required.into(),
        }
    }

    fn matches(&self, cache_version: &str) -> bool {
        match self.pattern.strip_suffix('x') {
            Some(prefix) if prefix.ends_with('.') => cache_version
                .strip_prefix('v')
                .unwrap_or(cache_version)
                .starts_with(prefix),
            _ => match (parse_version(&self.pattern), parse_version(cache_version)) {
                (Some(p), Some(c)) => p == c,
                _ => self.pattern == cache_version,
            },
        }
    }
}

/// Running library version plus the breaking-change table.
#[derive(Debug, Clone)]
pub struct CompatibilityRules {
    library_version: Arc<str>,
    rules: Arc<[BreakingChange]>,
}

impl Default for CompatibilityRules {
    fn default() -> Self {
        Self::builtin()
    }
}

impl CompatibilityRules {
    pub fn new(library_version: &str, rules: Vec<BreakingChange>) -> Self {
        Self {
            library_version: Arc::from(library_version),
            rules: Arc::from(rules),
        }
    }

    /// Rules shipped with this release, evaluated against [`LIBRARY_VERSION`].
    pub fn builtin() -> Self {
        Self::new(
            LIBRARY_VERSION,
            BUILTIN_BREAKING_CHANGES
                .iter()
                .map(|(pattern, min)| BreakingChange::new(*pattern, *min))
                .collect(),
        )
    }

    pub fn library_version(&self) -> &str {
        &self.library_version
    }

    /// A cache is incompatible if any rule that is in force for the running
    /// version matches its format version. Rules are independent predicates.
    pub fn is_compatible(&self, cache_version: &str) -> bool {
        let Some(current) = parse_version(&self.library_version) else {
            return true;
        };

        !self.rules.iter().any(|rule| {
            parse_version(&rule.min_required).is_some_and(|min| min <= current)
                && rule.matches(cache_version)
        })
    }
}

/// Parse version string (with optional 'v' prefix) into (major, minor, patch)
pub fn parse_version(version: &str) -> Option<(u32, u32, u32)> {
    let v = version.strip_prefix('v').unwrap_or(version);
    let mut parts = v.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    // Tolerate pre-release/build suffixes on the patch component (`1.2.3-rc1`).
    let patch_raw = parts.next()?;
    let digits_end = patch_raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(patch_raw.len());
    let patch = patch_raw[..digits_end].parse().ok()?;
    Some((major, minor, patch))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("3.2.0"), Some((3, 2, 0)));
        assert_eq!(parse_version("v3.2.0"), Some((3, 2, 0)));
        assert_eq!(parse_version("0.3.1-beta.2"), Some((0, 3, 1)));
        assert_eq!(parse_version("invalid"), None);
        assert_eq!(parse_version("1.2"), None);
        assert_eq!(parse_version(""), None);
    }

    #[test]
    fn test_wildcard_rule_gates_on_running_version() {
        let rule = vec![BreakingChange::new("2.x", "2.0.0")];

        let running_new = CompatibilityRules::new("2.0.0", rule.clone());
        assert!(!running_new.is_compatible("2.3.0"));

        let running_newer = CompatibilityRules::new("3.1.4", rule.clone());
        assert!(!running_newer.is_compatible("2.3.0"));

        let running_old = CompatibilityRules::new("1.9.9", rule);
        assert!(running_old.is_compatible("2.3.0"));
    }

    #[test]
    fn test_wildcard_matches_only_its_line() {
        let rules = CompatibilityRules::new("0.4.0", vec![BreakingChange::new("0.3.x", "0.4.0")]);
        assert!(!rules.is_compatible("0.3.0"));
        assert!(!rules.is_compatible("0.3.17"));
        assert!(rules.is_compatible("0.31.0"));
        assert!(rules.is_compatible("0.2.9"));
        assert!(rules.is_compatible("0.4.0"));
    }

    #[test]
    fn test_exact_rule() {
        let rules = CompatibilityRules::new("1.0.0", vec![BreakingChange::new("0.9.2", "0.9.3")]);
        assert!(!rules.is_compatible("0.9.2"));
        assert!(!rules.is_compatible("v0.9.2"));
        assert!(rules.is_compatible("0.9.1"));
        assert!(rules.is_compatible("0.9.3"));
    }

    #[test]
    fn test_rules_are_ored() {
        let rules = CompatibilityRules::new(
            "5.0.0",
            vec![
                BreakingChange::new("1.x", "2.0.0"),
                BreakingChange::new("3.1.x", "9.0.0"),
                BreakingChange::new("4.0.1", "4.0.2"),
            ],
        );
        assert!(!rules.is_compatible("1.4.2"));
        // Rule not yet in force for 5.0.0.
        assert!(rules.is_compatible("3.1.0"));
        assert!(!rules.is_compatible("4.0.1"));
        assert!(rules.is_compatible("4.0.2"));
    }

    #[test]
    fn test_no_rules_means_compatible() {
        let rules = CompatibilityRules::new("1.0.0", Vec::new());
        assert!(rules.is_compatible("0.0.1"));
        assert!(rules.is_compatible("garbage"));
    }

    #[test]
    fn test_builtin_rules_accept_current_version() {
        let rules = CompatibilityRules::builtin();
        assert!(rules.is_compatible(LIBRARY_VERSION));
        assert!(!rules.is_compatible("0.2.5"));
        assert!(!rules.is_compatible("0.1.0"));
    }
}
