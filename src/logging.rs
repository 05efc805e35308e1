//! Logging for jrpcd.
//!
//! `jrpcd serve` writes through `tracing`, either as console lines or as
//! JSON records. The RPC adapters never log directly; they report through an
//! [`Observer`] handed to them at construction. [`TracingObserver`] is the
//! production one.

use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

use crate::config::ServerConfig;

/// Output options for [`init`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    /// One JSON record per event instead of console lines
    pub json: bool,
    /// Default to DEBUG instead of INFO
    pub verbose: bool,
}

impl From<&ServerConfig> for LogConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            json: config.json_logs,
            verbose: config.verbose,
        }
    }
}

/// Filter directive used when `RUST_LOG` is unset.
pub fn default_directive(verbose: bool) -> String {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    format!("jrpcd={}", level.as_str().to_lowercase())
}

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
///
/// Fails if a subscriber is already installed.
///
/// ```ignore
/// jrpcd::logging::init(LogConfig { json: true, ..Default::default() })?;
/// ```
pub fn init(config: LogConfig) -> Result<(), TryInitError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(config.verbose)));

    let registry = tracing_subscriber::registry().with(env_filter);

    if config.json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(false).compact())
            .try_init()
    }
}

/// Diagnostic sink for the RPC core.
pub trait Observer: Send + Sync {
    /// Report something worth a human's attention. `tag` names the reporter.
    fn notice(&self, tag: &str, message: &str);
}

/// Forwards notices to `tracing` at INFO.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn notice(&self, tag: &str, message: &str) {
        tracing::info!(tag, "{}", message);
    }
}
