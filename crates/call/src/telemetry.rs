//! Telemetry sinks
//!
//! Every sink is fire-and-forget: `record` returns immediately and never
//! fails, so the controller calls it inline without awaiting anything.

use std::sync::Arc;
use voice_client_config::ObservabilityConfig;
use voice_client_core::{TelemetryEvent, TelemetrySink};

/// Discards every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn record(&self, _event: TelemetryEvent) {}
}

/// Logs events through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn record(&self, event: TelemetryEvent) {
        tracing::info!(target: "voice_client::telemetry", event = event.name(), details = ?event, "Telemetry");
    }
}

/// Records counters and histograms with the `metrics` facade
///
/// Install an exporter in the host application; without one the calls are
/// no-ops.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsTelemetry;

impl TelemetrySink for MetricsTelemetry {
    fn record(&self, event: TelemetryEvent) {
        match event {
            TelemetryEvent::CallStarted { .. } => {
                metrics::counter!("voice_client_calls_started_total").increment(1);
            },
            TelemetryEvent::CallConnected { setup_time, .. } => {
                metrics::counter!("voice_client_calls_connected_total").increment(1);
                metrics::histogram!("voice_client_call_setup_seconds")
                    .record(setup_time.as_secs_f64());
            },
            TelemetryEvent::CallEnded {
                duration, reason, ..
            } => {
                metrics::counter!("voice_client_calls_ended_total", "reason" => reason)
                    .increment(1);
                metrics::histogram!("voice_client_call_duration_seconds")
                    .record(duration.as_secs_f64());
            },
            TelemetryEvent::PersonaSwitched { voice_changed, .. } => {
                let path = if voice_changed { "speak_restart" } else { "prompt_refresh" };
                metrics::counter!("voice_client_persona_switches_total", "path" => path)
                    .increment(1);
            },
            TelemetryEvent::ReconnectAttempt { .. } => {
                metrics::counter!("voice_client_reconnect_attempts_total").increment(1);
            },
            TelemetryEvent::VoiceFallback { .. } => {
                metrics::counter!("voice_client_voice_fallbacks_total").increment(1);
            },
            TelemetryEvent::TerminationConfirmed { .. } => {
                metrics::counter!("voice_client_terminations_confirmed_total").increment(1);
            },
            TelemetryEvent::Error { kind, .. } => {
                metrics::counter!("voice_client_errors_total", "kind" => kind).increment(1);
            },
        }
    }
}

/// Sink selected by the observability settings
pub fn from_config(config: &ObservabilityConfig) -> Arc<dyn TelemetrySink> {
    if config.metrics_enabled {
        Arc::new(MetricsTelemetry)
    } else {
        Arc::new(TracingTelemetry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use voice_client_core::SessionId;

    #[test]
    fn test_sinks_accept_every_event_without_exporter() {
        let id = SessionId::new("dana-1");
        let events = vec![
            TelemetryEvent::CallStarted {
                session_id: id.clone(),
                persona: "Dana".into(),
            },
            TelemetryEvent::CallEnded {
                session_id: id.clone(),
                duration: Duration::from_secs(42),
                reason: "user".into(),
            },
            TelemetryEvent::Error {
                session_id: None,
                kind: "handshake_failure",
            },
        ];

        let metrics_enabled = ObservabilityConfig::default();
        let tracing_only = ObservabilityConfig {
            metrics_enabled: false,
            ..ObservabilityConfig::default()
        };
        for sink in [from_config(&metrics_enabled), from_config(&tracing_only)] {
            for event in events.clone() {
                sink.record(event);
            }
        }
        NoopTelemetry.record(events[0].clone());
    }
}
