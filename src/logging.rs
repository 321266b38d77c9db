//! Tracing subscriber setup.
//!
//! Logs always go to **stderr** so stdout stays parseable for scripts that
//! consume `--json` search output. `RUST_LOG` wins over `--verbose`, which
//! wins over `[logging].level`.

use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

/// Build the filter directive for our crates while keeping dependency noise
/// at `warn`.
fn directive(level: &str) -> String {
    format!(
        "warn,profile_fusion={level},profile_fusion_core={level},pfx={level},sqlx=error,hyper=warn,reqwest=warn"
    )
}

pub fn init_logging(config: &LoggingConfig, verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new(directive("debug"))
        } else {
            EnvFilter::new(directive(&config.level))
        }
    });

    let registry = tracing_subscriber::registry().with(filter);
    // A second initialization (tests, embedding the CLI) is not an error.
    let _ = if config.json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
    };
}
