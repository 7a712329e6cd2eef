//! Call lifecycle for the voice client
//!
//! Features:
//! - Single-session controller with queued persona switches during connect
//! - Bounded exponential reconnect that never resets on internal recovery
//! - Termination guard with two-signal confirmation and a grace period
//! - Snapshots for observers, telemetry through pluggable sinks

pub mod controller;
pub mod guard;
pub mod observability;
pub mod reconnect;
pub mod snapshot;
pub mod telemetry;

pub use controller::{CallController, ControllerDeps};
pub use guard::{GuardAction, GuardPhase, TerminationCandidate, TerminationGuard, TerminationStatus};
pub use observability::init_tracing;
pub use reconnect::ReconnectPolicy;
pub use snapshot::CallSnapshot;
pub use telemetry::{MetricsTelemetry, NoopTelemetry, TracingTelemetry};

pub use voice_client_session::ReconfigureOutcome;
