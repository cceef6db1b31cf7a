//! Shared tracing/logging initialization.
//!
//! Logs always go to stderr so the `testcast` CLI can keep stdout for test
//! output. `RUST_LOG` overrides the filter the binary asks for.

use std::io::IsTerminal;

use tracing_subscriber::fmt;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Build a filter directive enabling `level` for each of `targets`,
/// e.g. `"testcast=debug,testcast_cli=debug"`.
pub fn crate_filter(level: &str, targets: &[&str]) -> String {
    targets
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- used when `RUST_LOG` is unset or unparsable.
/// * `log_json` -- emit structured JSON lines instead of the human-readable
///   format.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let registry = tracing_subscriber::registry().with(env_filter);

    if log_json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_ansi(std::io::stderr().is_terminal())
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_covers_every_target() {
        assert_eq!(
            crate_filter("debug", &["testcast", "testcast_cli"]),
            "testcast=debug,testcast_cli=debug"
        );
        assert_eq!(crate_filter("info", &["testcast_relay"]), "testcast_relay=info");
    }
}
