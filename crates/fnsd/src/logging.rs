//! Logging setup for the daemon.
//!
//! # Log Targets
//!
//! - `gateway` - accept loop, connection tasks, shutdown
//! - `ws` - WebSocket codec and handshake
//! - `registry` - connection registry
//! - `rpc` - inter-node calls
//!
//! # Environment Variables
//!
//! - `FNS_LOG` - log filter (takes precedence)
//! - `RUST_LOG` - fallback log filter

use std::sync::OnceLock;

use fns_gate::{LogFormat, LogSettings};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

static INIT_GUARD: OnceLock<()> = OnceLock::new();

const TARGETS: [&str; 4] = ["gateway", "ws", "registry", "rpc"];

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to parse log filter: {0}")]
    FilterParse(#[from] tracing_subscriber::filter::ParseError),
    #[error("logging already initialized")]
    AlreadyInitialized,
    #[error("failed to initialize subscriber: {0}")]
    TryInit(#[from] tracing_subscriber::util::TryInitError),
}

/// Filter directives used when neither env variable is set.
fn default_directives(level: &str) -> String {
    let level = level.to_lowercase();
    let mut directives = level.clone();
    for target in TARGETS {
        directives.push_str(&format!(",{}={}", target, level));
    }
    directives
}

fn build_env_filter(default_level: &str) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = std::env::var("FNS_LOG") {
        return Ok(EnvFilter::try_new(filter)?);
    }
    if let Ok(filter) = std::env::var("RUST_LOG") {
        return Ok(EnvFilter::try_new(filter)?);
    }
    Ok(EnvFilter::try_new(default_directives(default_level))?)
}

/// Install the global subscriber. Only the first call succeeds.
pub fn init_logging(settings: &LogSettings) -> Result<(), LoggingError> {
    if INIT_GUARD.set(()).is_err() {
        return Err(LoggingError::AlreadyInitialized);
    }

    let filter = build_env_filter(&settings.level)?;
    match settings.format {
        LogFormat::Json => {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .with_current_span(true)
                .with_span_list(true)
                .with_writer(std::io::stdout)
                .with_filter(filter);
            tracing_subscriber::registry().with(layer).try_init()?;
        }
        LogFormat::Plain => {
            let layer = tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .with_writer(std::io::stdout)
                .with_filter(filter);
            tracing_subscriber::registry().with(layer).try_init()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directives_cover_every_target() {
        let directives = default_directives("DEBUG");
        assert_eq!(directives, "debug,gateway=debug,ws=debug,registry=debug,rpc=debug");
        assert!(EnvFilter::try_new(&directives).is_ok());
    }

    #[test]
    fn second_init_fails() {
        let settings = LogSettings::default();
        let _ = init_logging(&settings);
        assert!(matches!(init_logging(&settings), Err(LoggingError::AlreadyInitialized)));
    }
}
