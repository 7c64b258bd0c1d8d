//! Tracing initialisation for the harness binary and test drivers.
//!
//! Harness events are logged at the requested level; dependencies (reqwest,
//! hyper, the tokio runtime) only surface warnings unless `RUST_LOG` says
//! otherwise. Later calls are ignored: the global subscriber is set once.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Directive used when `RUST_LOG` is unset.
pub fn default_directive(level: Level) -> String {
    format!("warn,agentpool_e2e={}", level.as_str().to_lowercase())
}

fn env_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(level)))
}

/// Initialise the global tracing subscriber; `json` selects newline-delimited
/// JSON lines for CI log collectors.
pub fn init_tracing(json: bool, level: Level) {
    let layer = fmt::layer().with_target(false);
    let registry = tracing_subscriber::registry().with(env_filter(level));
    let installed = if json {
        registry.with(layer.json()).try_init()
    } else {
        registry.with(layer).try_init()
    };
    if installed.is_ok() {
        tracing::debug!(directive = %default_directive(level), "tracing initialised");
    }
}

/// Route harness logs through the test writer; safe to call from every test.
pub fn init_test_tracing() {
    tracing_subscriber::registry()
        .with(env_filter(Level::WARN))
        .with(fmt::layer().with_test_writer())
        .try_init()
        .ok();
}
