use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use crate::config::ObservabilityConfig;

/// Initialize structured logging.
///
/// `RUST_LOG` takes precedence; otherwise the configured level applies.
pub fn init_telemetry(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.log_level))?;

    let registry = tracing_subscriber::registry().with(filter);
    if config.json_logs {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true),
            )
            .try_init()?;
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()?;
    }

    tracing::info!("Flowkeeper telemetry initialized");
    Ok(())
}

/// Generate a correlation ID for linking the operations of one step
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Create a span with common flow attributes
pub fn create_flow_span(flow: &str, identity: &str, correlation_id: &str) -> tracing::Span {
    tracing::info_span!(
        "flow",
        flow.name = flow,
        flow.identity = identity,
        correlation.id = correlation_id,
    )
}
