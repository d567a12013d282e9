use std::collections::HashSet;
use std::sync::OnceLock;

use parking_lot::Mutex;
use xxhash_rust::xxh3::xxh3_64;

static WARNED_MESSAGES: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();

/// Print a warning to stderr, at most once per distinct message.
pub fn warn_once(message: impl Into<String>) {
    let message = message.into();
    let cache = WARNED_MESSAGES.get_or_init(|| Mutex::new(HashSet::new()));

    if cache.lock().insert(message.clone()) {
        eprintln!("{message}");
    }
}

/// Fast non-cryptographic hash, hex encoded.
pub fn fast_hash(text: &str) -> String {
    format!("{:016x}", xxh3_64(text.as_bytes()))
}

/// First line of `text`, trimmed and cut to `max_chars` characters.
pub fn preview_line(text: &str, max_chars: usize) -> String {
    text.trim()
        .lines()
        .next()
        .unwrap_or("")
        .chars()
        .take(max_chars)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fast_hash_is_stable() {
        assert_eq!(fast_hash("abc"), fast_hash("abc"));
        assert_ne!(fast_hash("abc"), fast_hash("abd"));
        assert_eq!(fast_hash("abc").len(), 16);
    }

    #[test]
    fn test_preview_line() {
        assert_eq!(preview_line("  hello\nworld", 120), "hello");
        assert_eq!(preview_line("abcdef", 3), "abc");
        assert_eq!(preview_line("", 10), "");
        assert_eq!(preview_line("héllo", 2), "hé");
    }

    #[test]
    fn test_warn_once_dedupes() {
        // Only observable effect is stderr; make sure repeated calls don't panic.
        warn_once("duplicate warning");
        warn_once("duplicate warning");
        let cache = WARNED_MESSAGES.get().unwrap();
        assert!(cache.lock().contains("duplicate warning"));
    }
}
