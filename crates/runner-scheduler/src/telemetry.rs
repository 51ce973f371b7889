use tracing::debug;
use tracing_subscriber::{fmt, EnvFilter};

/// Used when `RUST_LOG` is unset. Runner stderr arrives at debug under the
/// `runner` target; HTTP client and server internals stay at warn.
pub const DEFAULT_FILTER: &str = "info,runner=info,hyper=warn,reqwest=warn,tower_http=info";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber; returns false when one is already set
pub fn init_tracing() -> bool {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_target(true)
        .with_level(true)
        .compact()
        .finish();

    let installed = tracing::subscriber::set_global_default(subscriber).is_ok();
    if installed {
        debug!("Tracing initialized");
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
        assert!(DEFAULT_FILTER.contains("runner=info"));
    }

    #[test]
    fn test_second_init_is_noop() {
        init_tracing();
        assert!(!init_tracing());
    }
}
