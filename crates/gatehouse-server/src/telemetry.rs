//! Structured logging setup
//!
//! `RUST_LOG` wins over the configured level. `JSON_LOGS=true` switches to
//! JSON output for log shippers.

use anyhow::Result;
use gatehouse_common::config::env_parse_or_default;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing
pub fn init(log_level: &str, json_logs: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let json_logs = json_logs || env_parse_or_default("JSON_LOGS", false);

    let subscriber = tracing_subscriber::registry().with(filter);

    if json_logs {
        subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?;
    } else {
        subscriber.with(tracing_subscriber::fmt::layer()).try_init()?;
    }

    Ok(())
}
