//! Subscriber setup for the `tracing` diagnostics emitted by the runtime.
//!
//! The filter is read from `LAZYRT_LOG`, then `RUST_LOG`, and defaults to `warn`.
//! Libraries embedding the runtime may install their own subscriber instead.

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

static LOGGING_INITIALIZED: OnceCell<()> = OnceCell::new();

const DEFAULT_FILTER: &str = "warn";
const LOG_ENV: &str = "LAZYRT_LOG";

fn filter_from_env() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs a fmt subscriber once per process. Later calls are no-ops, and an
/// already-installed global subscriber is left in place.
pub fn init_logging() {
    LOGGING_INITIALIZED.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter_from_env())
            .with_target(true)
            .try_init();
    });
}

pub fn is_initialized() -> bool {
    LOGGING_INITIALIZED.get().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_logging();
        init_logging();
        assert!(is_initialized());
    }
}
