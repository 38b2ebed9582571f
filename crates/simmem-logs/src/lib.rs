// SPDX-License-Identifier: AGPL-3.0

//! Logging and diagnostic utilities
//!
//! Library crates emit `tracing` events directly. This crate installs the
//! subscriber for binaries and tests and provides de-duplicated warnings for
//! diagnostics that would otherwise repeat on every merge or load.

use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Codes attached to warnings so they can be grepped and filtered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WarningCode {
    /// Diff between two memories without a common ancestor
    SlowDiff,
    /// A checkpoint could not be written
    CacheDumpFailed,
    /// A checkpoint was found but could not be used
    CacheLoadFailed,
}

impl WarningCode {
    pub fn code(&self) -> &'static str {
        match self {
            WarningCode::SlowDiff => "slow-diff",
            WarningCode::CacheDumpFailed => "cache-dump-failed",
            WarningCode::CacheLoadFailed => "cache-load-failed",
        }
    }
}

/// Logger state for tracking unique messages
static UNIQUE_MESSAGES: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Record `message`; returns false if it was already recorded
fn mark_logged(message: &str) -> bool {
    let mut messages = UNIQUE_MESSAGES.lock().unwrap_or_else(|e| e.into_inner());
    messages.insert(message.to_string())
}

fn should_log(text: &str, allow_duplicate: bool) -> bool {
    allow_duplicate || mark_logged(text)
}

/// Log a warning, skipping text already logged unless `allow_duplicate`
fn warn(text: &str, allow_duplicate: bool) {
    if should_log(text, allow_duplicate) {
        tracing::warn!("{}", text);
    }
}

/// Log a warning tagged with a warning code
pub fn warn_code(code: WarningCode, msg: &str, allow_duplicate: bool) {
    let full_msg = format!("{} [{}]", msg, code.code());
    warn(&full_msg, allow_duplicate);
}

/// Default filter directive for a `-v` count
pub fn filter_for_verbosity(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Install the global fmt subscriber
///
/// `RUST_LOG` takes precedence over the verbosity level. Returns false if a
/// subscriber was already installed.
pub fn init(verbose: u8) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_for_verbosity(verbose)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose >= 2)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

fn is_logged(message: &str) -> bool {
    let messages = UNIQUE_MESSAGES.lock().unwrap_or_else(|e| e.into_inner());
    messages.contains(message)
}

    #[test]
    fn test_warning_codes() {
        let codes = vec![
            WarningCode::SlowDiff,
            WarningCode::CacheDumpFailed,
            WarningCode::CacheLoadFailed,
        ];

        let unique: HashSet<&str> = codes.iter().map(|c| c.code()).collect();
        assert_eq!(unique.len(), codes.len());
    }

    #[test]
    fn test_unique_logging() {
        let msg = "test unique message";
        warn(msg, false);
        assert!(is_logged(msg));

        // Second call should not log again
        assert!(!should_log(msg, false));
        assert!(should_log(msg, true));
    }

    #[test]
    fn test_allow_duplicate_is_not_tracked() {
        let msg = "duplicate message";
        warn(msg, true);
        assert!(!is_logged(msg));

        warn(msg, false);
        assert!(is_logged(msg));
    }

    #[test]
    fn test_warn_code_tags_message() {
        warn_code(WarningCode::SlowDiff, "merging without ancestor", false);
        assert!(is_logged("merging without ancestor [slow-diff]"));
    }

    #[test]
    fn test_filter_for_verbosity() {
        assert_eq!(filter_for_verbosity(0), "warn");
        assert_eq!(filter_for_verbosity(2), "debug");
        assert_eq!(filter_for_verbosity(9), "trace");
    }

    #[test]
    fn test_init_twice() {
        init(0);
        assert!(!init(0));
    }
}
