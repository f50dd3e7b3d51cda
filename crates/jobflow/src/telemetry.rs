//! Tracing subscriber setup.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use crate::config::{LogFormat, LoggingConfig};

/// Filter used when `RUST_LOG` is unset.
fn default_directive(config: &LoggingConfig) -> String {
    format!("jobflow={}", config.level)
}

fn build_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive(config)))
        .unwrap_or_else(|_| EnvFilter::new("jobflow=info"))
}

/// Installs the global tracing subscriber and routes `log` records into it.
///
/// Returns `false` when a subscriber was already installed; the existing one
/// is kept.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let filter = build_filter(config);
    let registry = Registry::default().with(filter);

    let installed = match config.format {
        LogFormat::Text => {
            tracing::subscriber::set_global_default(registry.with(fmt::layer().with_target(true)))
                .is_ok()
        }
        LogFormat::Json => tracing::subscriber::set_global_default(
            registry.with(fmt::layer().json().with_current_span(true)),
        )
        .is_ok(),
    };

    if installed {
        if let Err(e) = tracing_log::LogTracer::init() {
            tracing::debug!("log bridge already installed: {}", e);
        }
    }
    installed
}
