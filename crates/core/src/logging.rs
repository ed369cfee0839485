//! Logging and observability
//!
//! Structured logging for the lifecycle core, built on `tracing-subscriber`.
//! Text or JSON formatting is selected at runtime through an argument or the
//! `ROCKCRAFT_LOG_FORMAT` environment variable. All output goes to stderr so
//! that stdout stays free for the caller's own output.

use anyhow::Result;
use std::{io, sync::Once};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Environment variable holding the filter directive (e.g. `rockcraft_core=debug`)
pub const LOG_ENV: &str = "ROCKCRAFT_LOG";

/// Environment variable selecting the output format (`json` or `text`)
pub const LOG_FORMAT_ENV: &str = "ROCKCRAFT_LOG_FORMAT";

/// Initialize the logging system
///
/// Safe to call more than once; only the first call installs a subscriber.
///
/// ## Arguments
///
/// * `format` - `None` or `"text"` for human-readable output, `"json"` for
///   one JSON object per event. Unknown values fall back to text.
///
/// ## Environment Variables
///
/// * `ROCKCRAFT_LOG_FORMAT` - used when `format` is `None`
/// * `ROCKCRAFT_LOG` - filter directive
/// * `RUST_LOG` - fallback filter directive
///
/// ## Example
///
/// ```rust
/// use rockcraft_core::logging;
///
/// logging::init(None).expect("Failed to initialize logging");
/// ```
pub fn init(format: Option<&str>) -> Result<()> {
    INIT.call_once(|| {
        let filter = create_env_filter();

        let env_format = std::env::var(LOG_FORMAT_ENV).ok();
        let effective_format = format.or(env_format.as_deref()).unwrap_or("text");

        match effective_format {
            "json" => {
                tracing_subscriber::registry()
                    .with(
                        fmt::layer()
                            .json()
                            .with_target(true)
                            .with_span_events(fmt::format::FmtSpan::CLOSE)
                            .with_writer(io::stderr),
                    )
                    .with(filter)
                    .init();
            }
            _ => {
                tracing_subscriber::registry()
                    .with(fmt::layer().with_target(true).with_writer(io::stderr))
                    .with(filter)
                    .init();
            }
        }

        tracing::debug!("Logging initialized with format: {}", effective_format);
    });

    Ok(())
}

/// Create an EnvFilter based on environment variables
fn create_env_filter() -> EnvFilter {
    if let Ok(directive) = std::env::var(LOG_ENV) {
        EnvFilter::try_new(&directive).unwrap_or_else(|_| {
            tracing::warn!(
                "Invalid {} directive '{}', using default 'info'",
                LOG_ENV,
                directive
            );
            EnvFilter::new("info")
        })
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Check if logging has been initialized
pub fn is_initialized() -> bool {
    INIT.is_completed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_init_multiple_calls_safe() {
        assert!(init(None).is_ok());
        assert!(init(Some("json")).is_ok());
        assert!(init(Some("text")).is_ok());
        assert!(is_initialized());
    }

    #[test]
    #[serial]
    fn test_env_filter_with_env_vars() {
        std::env::set_var(LOG_ENV, "rockcraft_core=trace");
        let _filter = create_env_filter();
        std::env::remove_var(LOG_ENV);

        // Invalid directive falls back to info without panicking
        std::env::set_var(LOG_ENV, "=@@invalid");
        let _filter = create_env_filter();
        std::env::remove_var(LOG_ENV);
    }
}
