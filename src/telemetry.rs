//! Logging setup.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt};

/// Map `-v` counts to a default filter directive.
pub fn directive_for_verbosity(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "plenum=info",
        1 => "plenum=debug",
        _ => "plenum=trace",
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the verbosity flag. Safe to call once per process;
/// a second call is ignored so tests can race it.
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directive_for_verbosity(verbosity)));

    let result = Registry::default()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init();
    if result.is_err() {
        tracing::debug!("telemetry already initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_directives() {
        assert_eq!(directive_for_verbosity(0), "plenum=info");
        assert_eq!(directive_for_verbosity(1), "plenum=debug");
        assert_eq!(directive_for_verbosity(2), "plenum=trace");
        assert_eq!(directive_for_verbosity(9), "plenum=trace");
    }
}
