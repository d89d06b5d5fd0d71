//! Tracing setup with a reloadable filter so SIGHUP can change verbosity
//! without restarting the daemon.

use tracing_subscriber::{EnvFilter, fmt, prelude::*, reload};

pub type FilterReloadHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

const DEFAULT_LOG_FILTER: &str = "info";
const ENV_VAR_LOG_FILTER: &str = "OVERLAYD_LOG";

fn initial_filter() -> EnvFilter {
    if let Ok(directive) = std::env::var(ENV_VAR_LOG_FILTER) {
        return EnvFilter::new(directive);
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Installs the global subscriber and returns a handle that can swap the
/// active filter directive in place, used by the SIGHUP reload path.
pub fn init() -> FilterReloadHandle {
    let (filter_layer, reload_handle) = reload::Layer::new(initial_filter());
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_target(true))
        .init();
    reload_handle
}

/// Re-reads `OVERLAYD_LOG` (or the default filter) and swaps it in.
pub fn reload(handle: &FilterReloadHandle) {
    let new_filter = initial_filter();
    if let Err(err) = handle.reload(new_filter) {
        tracing::warn!(%err, "failed to reload log filter");
    } else {
        tracing::info!("log filter reloaded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_filter_defaults_to_info() {
        // SAFETY: tests run single-threaded within this module's scope for env vars.
        unsafe {
            std::env::remove_var(ENV_VAR_LOG_FILTER);
        }
        let filter = initial_filter();
        assert_eq!(filter.to_string(), DEFAULT_LOG_FILTER);
    }
}
