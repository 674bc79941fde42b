//! Logging setup for the delivery server.
//!
//! Metrics are recorded through the OpenTelemetry global meter by
//! `dchat-realtime`; until a meter provider is installed they are no-ops.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogFormat;

const DEFAULT_FILTER: &str = "info,dchat_server=debug,dchat_realtime=debug";

/// Install the global tracing subscriber.
///
/// # Configuration
///
/// - `RUST_LOG`: log filter (default: `info,dchat_server=debug,dchat_realtime=debug`)
/// - `DCHAT_LOG_FORMAT`: `pretty` for console output, `json` for one object per line
pub fn init(format: LogFormat) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let (pretty, json) = match format {
        LogFormat::Pretty => (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(true)
                    .with_line_number(true),
            ),
            None,
        ),
        LogFormat::Json => (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true),
            ),
        ),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(pretty)
        .with(json)
        .try_init()?;

    tracing::info!(format = %format, "Telemetry initialized");
    Ok(())
}

/// Flush telemetry before exit.
pub fn shutdown() {
    tracing::info!("Telemetry shut down");
}
