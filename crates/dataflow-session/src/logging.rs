//! Subscriber setup for the runtime's `tracing` events.
//!
//! Only available with the `structured-logging` feature:
//!
//! ```toml
//! [dependencies]
//! dataflow-session = { version = "0.1", features = ["structured-logging"] }
//! ```
//!
//! ```no_run
//! use dataflow_session::logging::{init_logging, LogFormat};
//!
//! init_logging(LogFormat::Compact, "info").expect("logger");
//! tracing::info!(step_id = 3, "step dispatched");
//! ```

#[cfg(feature = "structured-logging")]
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[cfg(feature = "structured-logging")]
use crate::error::{Result, SessionError};

/// Log output format.
#[cfg(feature = "structured-logging")]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, for development.
    #[default]
    Pretty,
    Compact,
    /// One JSON object per event, for log aggregation.
    Json,
}

/// Installs a global subscriber. `level` is an `EnvFilter` directive such as
/// `"info"` or `"dataflow_session=debug"`; `RUST_LOG` takes precedence when set.
///
/// Fails if a global subscriber is already installed.
#[cfg(feature = "structured-logging")]
pub fn init_logging(format: LogFormat, level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).map_err(|e| {
            SessionError::invalid_argument(format!("Invalid log filter '{}': {}", level, e))
        })?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format {
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
        LogFormat::Compact => registry
            .with(fmt::layer().compact().with_thread_ids(true))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init(),
    };
    installed.map_err(|e| SessionError::FailedPrecondition(format!("Logger already set: {}", e)))
}
