//! Tracing subscriber setup for the server binary.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogFormat;
use crate::error::{FedError, Result};

/// Install the global subscriber. `RUST_LOG` takes precedence over `level`.
///
/// Fails if a subscriber is already installed.
pub fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = match format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(false).with_line_number(false))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(false))
            .try_init(),
    };
    installed.map_err(|e| FedError::Config(format!("failed to initialize logging: {e}")))?;

    tracing::debug!(level, ?format, "Logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        // The first call may race other tests installing a subscriber; only the
        // second is guaranteed to fail.
        let _ = init_logging("info", LogFormat::Pretty);
        assert!(init_logging("debug", LogFormat::Json).is_err());
    }
}
