//! Tracing initialisation

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;
use voice_client_config::ObservabilityConfig;

/// Install the global subscriber
///
/// `RUST_LOG` wins over the configured level. Returns `false` when a global
/// subscriber was already installed.
pub fn init_tracing(config: &ObservabilityConfig) -> bool {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("voice_client={},warn", config.log_level).into()
    });

    let fmt_layer = if config.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .is_ok()
}
