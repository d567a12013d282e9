//! Debug logging for tracing cache decisions.
//!
//! Enable by setting environment variable: CLAUDE_CODE_LOG_DEBUG=1
//! Logs are written to `<temp dir>/claude-code-log-debug.log`

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

pub const ENV_VAR: &str = "CLAUDE_CODE_LOG_DEBUG";

static ENABLED: AtomicBool = AtomicBool::new(false);
static START_TIME: OnceLock<Instant> = OnceLock::new();
static LOG_FILE: OnceLock<Option<Mutex<File>>> = OnceLock::new();

pub fn log_path() -> PathBuf {
    std::env::temp_dir().join("claude-code-log-debug.log")
}

/// Initialize debug logging. Call once at startup.
pub fn init() {
    if std::env::var(ENV_VAR).is_err() {
        return;
    }
    START_TIME.get_or_init(Instant::now);
    let opened = LOG_FILE.get_or_init(|| {
        match OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(log_path())
        {
            Ok(file) => Some(Mutex::new(file)),
            Err(e) => {
                eprintln!("Warning: could not open debug log {}: {e}", log_path().display());
                None
            }
        }
    });
    if opened.is_some() {
        ENABLED.store(true, Ordering::SeqCst);
        log("DEBUG", "init", "Debug logging initialized");
    }
}

/// Check if debug logging is enabled.
#[inline]
pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

/// Log a debug message with timestamp and thread ID.
pub fn log(category: &str, action: &str, detail: &str) {
    if !is_enabled() {
        return;
    }

    let elapsed = START_TIME
        .get()
        .map(|s| s.elapsed().as_millis())
        .unwrap_or(0);
    let thread_id = std::thread::current().id();

    let msg = format!(
        "[{:>8}ms] [{:?}] [{}] {} - {}\n",
        elapsed, thread_id, category, action, detail
    );

    if let Some(Some(file)) = LOG_FILE.get() {
        let mut file = file.lock();
        let _ = file.write_all(msg.as_bytes());
        let _ = file.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_is_noop_when_disabled() {
        // Never initialized in tests, so this must not touch the filesystem.
        if !is_enabled() {
            log("TEST", "noop", "nothing");
            assert!(LOG_FILE.get().is_none());
        }
    }
}
