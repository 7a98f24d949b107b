// Tracing subscriber setup for hosts embedding the lane manager and the pool

use std::sync::Once;

use anyhow::Result;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    EnvFilter, Registry,
};

use crate::config::LoggingConfig;

//-----------------------------------------------------------------------------
// Initialization
//-----------------------------------------------------------------------------

/// Route lane and pool diagnostics to stdout.
///
/// `log_level` is an `EnvFilter` directive used when `RUST_LOG` is unset, for
/// instance `lanekeeper::pool=debug,info`. Grants, evictions and lifecycle
/// transitions are logged at debug; timeouts and failed hooks at warn. With
/// `json_output` every event becomes one JSON line carrying its span list,
/// otherwise the multi-line pretty format is used. Closed spans are reported
/// with their busy and idle time.
///
/// Errors if the filter does not parse or a global subscriber is already set.
pub fn init_tracing(log_level: Option<&str>, json_output: Option<bool>) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(log_level.unwrap_or("info"))?,
    };
    let json = json_output.unwrap_or(false);

    let json_layer = json.then(|| {
        fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_span_list(true)
    });
    let pretty_layer = (!json).then(|| {
        fmt::layer()
            .pretty()
            .with_span_events(FmtSpan::CLOSE)
            .with_target(true)
    });

    Registry::default()
        .with(filter)
        .with(json_layer)
        .with(pretty_layer)
        .try_init()?;
    Ok(())
}

/// Install the global subscriber from the `[logging]` section
pub fn init_from_config(config: &LoggingConfig) -> Result<()> {
    init_tracing(Some(&config.level), Some(config.json))
}

static TEST_LOGGING: Once = Once::new();

/// Install a test-writer subscriber once per process.
///
/// Safe to call from every test; later calls are no-ops and an existing global
/// subscriber is left alone.
pub fn init_test_logging() {
    TEST_LOGGING.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("lanekeeper=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
