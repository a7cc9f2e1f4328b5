//! Logging initialization and configuration.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when neither `RUST_LOG` nor a configured level is set.
pub const DEFAULT_FILTER: &str = "shell_relay=info";

fn filter_for(level: Option<&str>) -> EnvFilter {
    match level.filter(|l| !l.trim().is_empty()) {
        // A bare level applies to this crate only; directives pass through
        Some(level) if !level.contains('=') && !level.contains(',') => {
            EnvFilter::try_new(format!("shell_relay={level},tower_http={level}"))
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
        }
        Some(directives) => {
            EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
        }
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
    }
}

/// Initialize the logging system.
///
/// Uses the `RUST_LOG` environment variable for filtering. If not set,
/// defaults to `shell_relay=info`.
///
/// # Panics
///
/// Panics if called more than once, or if another tracing subscriber
/// has already been set.
pub fn init() {
    init_with_filter(None);
}

/// Initialize logging with a configured level or filter directive.
///
/// `None` falls back to `RUST_LOG`, then to the default filter.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_with_filter(level: Option<&str>) {
    tracing_subscriber::registry()
        .with(filter_for(level))
        .with(tracing_subscriber::fmt::layer().compact())
        .init();
}

/// Try to initialize the logging system.
///
/// Returns `Ok(())` if successful, or `Err` if logging has already been
/// initialized.
pub fn try_init() -> Result<(), tracing_subscriber::util::TryInitError> {
    tracing_subscriber::registry()
        .with(filter_for(None))
        .with(tracing_subscriber::fmt::layer().compact())
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_init_idempotent() {
        let _ = try_init();
        // Second call errors instead of panicking
        let _ = try_init();
    }

    #[test]
    fn test_bare_level_scoped_to_crate() {
        let filter = filter_for(Some("debug")).to_string();
        assert!(filter.contains("shell_relay=debug"));
    }

    #[test]
    fn test_directives_pass_through() {
        let filter = filter_for(Some("warn,shell_relay=trace")).to_string();
        assert!(filter.contains("shell_relay=trace"));
    }

    #[test]
    fn test_invalid_directive_falls_back() {
        let filter = filter_for(Some("shell_relay=notalevel")).to_string();
        assert!(filter.contains("shell_relay=info"));
    }
}
