//! Diagnostic tracing on stderr.
//!
//! Tracing is for watching the pipeline work: gate verdicts, plan fallbacks,
//! attempts, sandbox timeouts and kills. It is never persisted. What a request
//! actually did is in the attempt records (`io::recorder`), which are written
//! regardless of the log level.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset. Each `-v` raises this crate's level;
/// dependencies stay at `warn`.
pub fn default_directives(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "warn,pipeline=info",
        2 => "warn,pipeline=debug",
        _ => "warn,pipeline=trace",
    }
}

/// Install the stderr subscriber. `RUST_LOG` overrides `verbosity`.
///
/// ```bash
/// RUST_LOG=pipeline::io::sandbox=debug pipeline run "list files in my downloads folder"
/// pipeline -vv validate script.py
/// ```
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(verbosity)));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbosity > 1)
                .compact(),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_only_raises_this_crate() {
        assert_eq!(default_directives(0), "warn");
        assert_eq!(default_directives(1), "warn,pipeline=info");
        assert_eq!(default_directives(7), "warn,pipeline=trace");
        for level in 0..4 {
            assert!(EnvFilter::try_new(default_directives(level)).is_ok());
        }
    }
}
