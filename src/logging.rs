//! Logging setup.
//!
//! Library code logs through `tracing`; this installs the subscriber for
//! the CLI. Output goes to stderr so command output on stdout stays
//! scriptable. `RUST_LOG` takes precedence over the `[logging]` section:
//!
//! ```bash
//! RUST_LOG=imos::ingest=debug imos import --all
//! ```

use std::sync::Once;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingConfig;

static INIT: Once = Once::new();

/// Build the filter directive string from configuration.
///
/// Module names are relative to the crate (`ingest` becomes
/// `imos::ingest`) unless already qualified.
pub fn filter_directives(config: &LoggingConfig) -> String {
    let mut directives = config.level.clone();
    let mut modules: Vec<_> = config.modules.iter().collect();
    modules.sort();
    for (module, level) in modules {
        if module.contains("::") || module == "imos" {
            directives.push_str(&format!(",{module}={level}"));
        } else {
            directives.push_str(&format!(",imos::{module}={level}"));
        }
    }
    directives
}

/// Install the global subscriber. Only the first call has any effect.
pub fn init(config: &LoggingConfig) {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            EnvFilter::new(filter_directives(config))
        };

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_level(true)
            .with_filter(filter);

        // A subscriber may already be installed (tests, embedding apps).
        let _ = tracing_subscriber::registry().with(fmt_layer).try_init();
    });
}
