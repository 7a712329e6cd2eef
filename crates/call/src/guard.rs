//! Termination guard
//!
//! Decides from a noisy external "should this call end" signal when to end
//! the call. A positive observation only becomes a candidate; a second
//! positive inside the confirmation window confirms it, after which a grace
//! period runs and the call is ended unconditionally. A negative observation
//! discards the candidate. Nothing happens before the minimum call age.

use std::time::Duration;
use tokio::time::Instant;
use voice_client_config::TerminationConfig;
use voice_client_core::{Result, ScoringSource, SessionId, TerminationSignal};

/// Guard phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GuardPhase {
    #[default]
    Idle,
    /// One positive signal seen, waiting for confirmation
    Candidate,
    /// Confirmed; the call ends when the grace period runs out
    Grace,
}

impl GuardPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardPhase::Idle => "idle",
            GuardPhase::Candidate => "candidate",
            GuardPhase::Grace => "grace",
        }
    }
}

/// Read-only projection of the guard
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TerminationStatus {
    pub phase: GuardPhase,
    /// Time left in the confirmation window or grace period
    pub remaining: Option<Duration>,
    pub phrase: Option<String>,
}

/// First positive observation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationCandidate {
    pub phrase: Option<String>,
    pub first_seen_at: Instant,
}

/// What the owner must do after an observation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardAction {
    None,
    /// Termination confirmed; wind the agent down and wait for the grace period
    Confirmed { phrase: Option<String> },
}

#[derive(Debug)]
pub struct TerminationGuard {
    enabled: bool,
    poll_interval: Duration,
    min_call_age: Duration,
    confirm_window: Duration,
    grace_period: Duration,

    candidate: Option<TerminationCandidate>,
    grace_deadline: Option<Instant>,
    confirmed_phrase: Option<String>,
    next_poll_at: Option<Instant>,
    polling: bool,
}

impl TerminationGuard {
    pub fn new(config: &TerminationConfig) -> Self {
        Self {
            enabled: config.enabled,
            poll_interval: config.poll_interval(),
            min_call_age: config.min_call_age(),
            confirm_window: config.confirm_window(),
            grace_period: config.grace_period(),
            candidate: None,
            grace_deadline: None,
            confirmed_phrase: None,
            next_poll_at: None,
            polling: false,
        }
    }

    /// Begin polling for a freshly connected call
    pub fn start(&mut self, now: Instant) {
        self.stop();
        if self.enabled {
            self.next_poll_at = Some(now + self.poll_interval);
        }
    }

    /// Clear every timer and candidate
    pub fn stop(&mut self) {
        self.candidate = None;
        self.grace_deadline = None;
        self.confirmed_phrase = None;
        self.next_poll_at = None;
        self.polling = false;
    }

    /// Stop polling but keep a running grace period
    pub fn stop_polling(&mut self) {
        self.candidate = None;
        self.next_poll_at = None;
        self.polling = false;
    }

    /// Termination is confirmed and the call is winding down
    pub fn in_grace(&self) -> bool {
        self.grace_deadline.is_some()
    }

    pub fn is_armed(&self) -> bool {
        self.next_poll_at.is_some() || self.polling || self.grace_deadline.is_some()
    }

    pub fn poll_due(&self, now: Instant) -> bool {
        !self.polling && self.next_poll_at.is_some_and(|at| at <= now)
    }

    /// A poll has been issued; no further poll is due until it is observed
    pub fn begin_poll(&mut self) {
        self.polling = true;
        self.next_poll_at = None;
    }

    /// The poll failed; try again after the usual interval
    pub fn poll_failed(&mut self, now: Instant) {
        self.polling = false;
        if self.grace_deadline.is_none() && self.enabled {
            self.next_poll_at = Some(now + self.poll_interval);
        }
    }

    pub fn grace_expired(&self, now: Instant) -> bool {
        self.grace_deadline.is_some_and(|at| at <= now)
    }

    /// Earliest instant at which the owner must call back
    pub fn next_deadline(&self) -> Option<Instant> {
        [self.next_poll_at, self.grace_deadline]
            .into_iter()
            .flatten()
            .min()
    }

    /// Apply one observation of the scoring signal
    pub fn observe(
        &mut self,
        signal: TerminationSignal,
        call_age: Duration,
        now: Instant,
    ) -> GuardAction {
        self.polling = false;
        if !self.enabled || self.grace_deadline.is_some() {
            return GuardAction::None;
        }
        self.next_poll_at = Some(now + self.poll_interval);

        if call_age < self.min_call_age {
            tracing::trace!(call_age_ms = call_age.as_millis() as u64, "Call too young for termination");
            return GuardAction::None;
        }

        if !signal.should_terminate {
            if self.candidate.take().is_some() {
                tracing::debug!("Termination candidate not confirmed, discarded");
            }
            return GuardAction::None;
        }

        match self.candidate.take() {
            Some(candidate) if now.duration_since(candidate.first_seen_at) <= self.confirm_window => {
                let phrase = signal.phrase.or(candidate.phrase);
                tracing::info!(
                    phrase = phrase.as_deref().unwrap_or(""),
                    grace_ms = self.grace_period.as_millis() as u64,
                    "Termination confirmed"
                );
                self.grace_deadline = Some(now + self.grace_period);
                self.confirmed_phrase = phrase.clone();
                self.next_poll_at = None;
                GuardAction::Confirmed { phrase }
            },
            _ => {
                tracing::debug!("Termination candidate recorded");
                self.candidate = Some(TerminationCandidate {
                    phrase: signal.phrase,
                    first_seen_at: now,
                });
                GuardAction::None
            },
        }
    }

    /// Poll `source` once and apply the result
    pub async fn check_for_termination(
        &mut self,
        source: &dyn ScoringSource,
        session_id: &SessionId,
        call_age: Duration,
    ) -> Result<GuardAction> {
        self.begin_poll();
        match source.check_termination(session_id).await {
            Ok(signal) => Ok(self.observe(signal, call_age, Instant::now())),
            Err(e) => {
                self.poll_failed(Instant::now());
                Err(e)
            },
        }
    }

    /// Status at `now`; never changes the guard
    pub fn status(&self, now: Instant) -> TerminationStatus {
        if let Some(deadline) = self.grace_deadline {
            return TerminationStatus {
                phase: GuardPhase::Grace,
                remaining: Some(deadline.saturating_duration_since(now)),
                phrase: self.confirmed_phrase.clone(),
            };
        }
        match &self.candidate {
            Some(candidate) => TerminationStatus {
                phase: GuardPhase::Candidate,
                remaining: Some(
                    (candidate.first_seen_at + self.confirm_window).saturating_duration_since(now),
                ),
                phrase: candidate.phrase.clone(),
            },
            None => TerminationStatus::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> TerminationGuard {
        TerminationGuard::new(&TerminationConfig::default())
    }

    const OLD: Duration = Duration::from_secs(120);

    #[tokio::test(start_paused = true)]
    async fn test_blip_then_negative_does_not_confirm() {
        let mut guard = guard();
        let t0 = Instant::now();
        guard.start(t0);

        let t1 = t0 + Duration::from_secs(5);
        assert_eq!(guard.observe(TerminationSignal::positive("bye"), OLD, t1), GuardAction::None);
        assert_eq!(guard.status(t1).phase, GuardPhase::Candidate);

        let t2 = t1 + Duration::from_secs(5);
        assert_eq!(guard.observe(TerminationSignal::negative(), OLD, t2), GuardAction::None);
        assert_eq!(guard.status(t2).phase, GuardPhase::Idle);

        // The window restarts on the next positive
        let t3 = t2 + Duration::from_secs(5);
        assert_eq!(guard.observe(TerminationSignal::positive("bye"), OLD, t3), GuardAction::None);
        assert_eq!(guard.status(t3).phase, GuardPhase::Candidate);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_positives_confirm_and_start_grace() {
        let mut guard = guard();
        let t0 = Instant::now();
        guard.start(t0);

        guard.observe(TerminationSignal::positive("thanks, bye"), OLD, t0);
        let t1 = t0 + Duration::from_secs(5);
        let action = guard.observe(TerminationSignal::positive("goodbye"), OLD, t1);

        assert_eq!(
            action,
            GuardAction::Confirmed {
                phrase: Some("goodbye".into())
            }
        );
        assert_eq!(guard.next_deadline(), Some(t1 + Duration::from_secs(8)));
        assert!(!guard.grace_expired(t1 + Duration::from_millis(7_999)));
        assert!(guard.grace_expired(t1 + Duration::from_secs(8)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_polling_keeps_grace_deadline() {
        let mut guard = guard();
        let t0 = Instant::now();
        guard.start(t0);
        guard.observe(TerminationSignal::positive("bye"), OLD, t0);
        let t1 = t0 + Duration::from_secs(5);
        guard.observe(TerminationSignal::positive("bye"), OLD, t1);

        guard.stop_polling();
        assert!(guard.in_grace());
        assert!(!guard.poll_due(t1 + Duration::from_secs(5)));
        assert_eq!(guard.next_deadline(), Some(t1 + Duration::from_secs(8)));

        guard.stop();
        assert!(!guard.in_grace());
        assert_eq!(guard.next_deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_candidate_restarts_window() {
        let mut guard = guard();
        let t0 = Instant::now();

        guard.observe(TerminationSignal::positive("bye"), OLD, t0);
        let late = t0 + Duration::from_secs(21);
        assert_eq!(guard.observe(TerminationSignal::positive("bye"), OLD, late), GuardAction::None);

        let status = guard.status(late);
        assert_eq!(status.phase, GuardPhase::Candidate);
        assert_eq!(status.remaining, Some(Duration::from_secs(20)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_young_call_is_never_terminated() {
        let mut guard = guard();
        let t0 = Instant::now();
        let young = Duration::from_secs(10);

        guard.observe(TerminationSignal::positive("bye"), young, t0);
        let action = guard.observe(TerminationSignal::positive("bye"), young, t0 + Duration::from_secs(1));

        assert_eq!(action, GuardAction::None);
        assert_eq!(guard.status(t0).phase, GuardPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_is_pure() {
        let mut guard = guard();
        let t0 = Instant::now();
        guard.observe(TerminationSignal::positive("a"), OLD, t0);
        guard.observe(TerminationSignal::positive("b"), OLD, t0);

        let before = guard.next_deadline();
        let later = t0 + Duration::from_secs(3);
        let status = guard.status(later);
        assert_eq!(status.phase, GuardPhase::Grace);
        assert_eq!(status.remaining, Some(Duration::from_secs(5)));
        assert_eq!(guard.status(later), status);
        assert_eq!(guard.next_deadline(), before);
    }

    struct FlakySource;

    #[async_trait::async_trait]
    impl ScoringSource for FlakySource {
        async fn check_termination(&self, session_id: &SessionId) -> Result<TerminationSignal> {
            if session_id.as_str() == "down" {
                Err(voice_client_core::CallError::collaborator("scoring", "unavailable"))
            } else {
                Ok(TerminationSignal::positive("bye"))
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_for_termination_polls_source() {
        let mut guard = guard();
        let t0 = Instant::now();
        guard.start(t0);

        let up = SessionId::new("up");
        let action = guard.check_for_termination(&FlakySource, &up, OLD).await.unwrap();
        assert_eq!(action, GuardAction::None);
        assert_eq!(guard.status(t0).phase, GuardPhase::Candidate);

        // A failed poll keeps the candidate and schedules the next poll
        let down = SessionId::new("down");
        assert!(guard.check_for_termination(&FlakySource, &down, OLD).await.is_err());
        assert_eq!(guard.status(t0).phase, GuardPhase::Candidate);
        assert_eq!(guard.next_deadline(), Some(t0 + Duration::from_secs(5)));

        let action = guard.check_for_termination(&FlakySource, &up, OLD).await.unwrap();
        assert!(matches!(action, GuardAction::Confirmed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_guard_never_polls() {
        let config = TerminationConfig {
            enabled: false,
            ..TerminationConfig::default()
        };
        let mut guard = TerminationGuard::new(&config);
        guard.start(Instant::now());
        assert_eq!(guard.next_deadline(), None);
        assert!(!guard.is_armed());
    }
}
