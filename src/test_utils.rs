//! Shared helpers for the crate's unit tests.

use std::sync::Once;

static INIT: Once = Once::new();

/// Installs a test-writer subscriber once per test binary.
///
/// The filter comes from `RUST_LOG` when set, otherwise from
/// `HARNESS_LOG_LEVEL`, defaulting to `info`.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let directive = filter_directive(|key| std::env::var(key).ok());
        let filter = tracing_subscriber::EnvFilter::try_new(&directive)
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LEVEL));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

const DEFAULT_LEVEL: &str = "info";

/// Picks the filter directive from `RUST_LOG`, then `HARNESS_LOG_LEVEL`.
fn filter_directive(lookup: impl Fn(&str) -> Option<String>) -> String {
    ["RUST_LOG", "HARNESS_LOG_LEVEL"]
        .into_iter()
        .filter_map(lookup)
        .find(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_LEVEL.to_owned())
}

/// Marks the start of a test in the log.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(test = $name, "=== TEST START ===");
    };
}

/// Marks a named section inside a test.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        tracing::debug!(section = $name, "--- section ---");
    };
}

/// Marks successful completion of a test.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = $name, "=== TEST COMPLETE ===");
    };
}

/// Assertion that logs expected and actual values before failing.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        if !$cond {
            tracing::error!(
                message = $msg,
                expected = ?$expected,
                actual = ?$actual,
                "Assertion failed"
            );
        }
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn harness_log_level_applies_without_rust_log() {
        init_test_logging();
        crate::test_phase!("harness_log_level_applies_without_rust_log");
        assert_eq!(filter_directive(env(&[("HARNESS_LOG_LEVEL", "trace")])), "trace");
        let both = filter_directive(env(&[("RUST_LOG", "warn"), ("HARNESS_LOG_LEVEL", "trace")]));
        crate::assert_with_log!(both == "warn", "RUST_LOG wins", "warn", both);
        assert_eq!(filter_directive(env(&[("RUST_LOG", " ")])), "info");
        assert_eq!(filter_directive(env(&[])), "info");
        crate::test_complete!("harness_log_level_applies_without_rust_log");
    }
}
