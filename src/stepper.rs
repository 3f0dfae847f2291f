use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::api::{DecisionApi, DecisionEvent, StepResponse};
use crate::error::{ControllerError, Result};
use crate::model::{
    AttributeCounts, Decision, PendingCandidate, RunState, RunStatus, SessionPhase, Strategy,
};
use crate::state::SessionStateStore;

/// Result of one applied round trip.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub run: RunState,
    pub next: Option<PendingCandidate>,
    pub event: Option<DecisionEvent>,
    pub version: u64,
}

impl StepOutcome {
    /// The run needs finalizing: terminal status, venue full, or no candidate left.
    pub fn finished(&self) -> bool {
        is_finished(&self.run, self.next.as_ref())
    }
}

fn is_finished(run: &RunState, next: Option<&PendingCandidate>) -> bool {
    run.is_terminal() || run.at_capacity() || next.is_none()
}

#[derive(Debug, Clone, Copy)]
enum StepAction {
    Manual(Option<Decision>),
    Auto(Strategy),
}

/// Releases the single-flight flag on drop.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Performs one decision round trip at a time against the service.
pub struct DecisionStepper {
    api: Arc<dyn DecisionApi>,
    state: Arc<SessionStateStore>,
    in_flight: AtomicBool,
}

impl DecisionStepper {
    pub fn new(api: Arc<dyn DecisionApi>, state: Arc<SessionStateStore>) -> Self {
        Self {
            api,
            state,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Manual decision on candidate `index`; `None` only for the initial fetch.
    pub async fn step(
        &self,
        run_id: &str,
        index: u64,
        decision: Option<Decision>,
    ) -> Result<StepOutcome> {
        self.execute(run_id, index, StepAction::Manual(decision)).await
    }

    /// Server-decided step using `strategy`.
    pub async fn auto_step(
        &self,
        run_id: &str,
        index: u64,
        strategy: Strategy,
    ) -> Result<StepOutcome> {
        self.execute(run_id, index, StepAction::Auto(strategy)).await
    }

    fn acquire(&self) -> Result<FlightGuard<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ControllerError::ConcurrencyViolation)?;
        Ok(FlightGuard(&self.in_flight))
    }

    fn check_preconditions(&self, run_id: &str) -> Result<()> {
        let session = self.state.current();
        let run = session.run.as_ref().ok_or(ControllerError::NoSession)?;
        if run.run_id != run_id {
            return Err(ControllerError::SessionMismatch {
                requested: run_id.to_string(),
                current: run.run_id.clone(),
            });
        }
        if run.is_terminal() {
            return Err(ControllerError::TerminalState(run.status));
        }
        match session.phase {
            SessionPhase::Completed => Err(ControllerError::TerminalState(RunStatus::Completed)),
            SessionPhase::Failed => Err(ControllerError::TerminalState(RunStatus::Failed)),
            _ => Ok(()),
        }
    }

    async fn execute(&self, run_id: &str, index: u64, action: StepAction) -> Result<StepOutcome> {
        let _guard = self.acquire()?;
        self.check_preconditions(run_id)?;

        debug!(run_id = %run_id, index, action = ?action, "sending decision");
        let response = match action {
            StepAction::Manual(decision) => self.api.step(run_id, index, decision).await,
            StepAction::Auto(strategy) => self.api.auto_step(run_id, index, strategy).await,
        }
        .map_err(|e| {
            warn!(run_id = %run_id, index, error = %e, "decision round trip failed");
            ControllerError::from(e)
        })?;

        self.apply(run_id, response)
    }

    fn apply(&self, run_id: &str, response: StepResponse) -> Result<StepOutcome> {
        let StepResponse {
            run: summary,
            event,
            next_person,
            admitted_by_attribute,
        } = response;

        let previous = self.state.current();
        let admitted = match admitted_by_attribute {
            Some(counts) => counts,
            None => derive_counts(
                previous
                    .run
                    .as_ref()
                    .map(|run| run.admitted_by_attribute.clone())
                    .unwrap_or_default(),
                event.as_ref(),
            ),
        };
        let run = summary
            .into_run_state(admitted)
            .map_err(ControllerError::TransientNetwork)?;
        let finished = is_finished(&run, next_person.as_ref());
        let next = if finished { None } else { next_person };

        let commit = self
            .state
            .update_if(|session| {
                if session.run_id() != Some(run_id) {
                    return false;
                }
                session.phase = if finished {
                    SessionPhase::finished(&run)
                } else if session.phase == SessionPhase::Starting {
                    SessionPhase::ManualReady
                } else {
                    session.phase
                };
                session.run = Some(run.clone());
                session.pending = next.clone();
                true
            })
            .ok_or_else(|| {
                warn!(run_id = %run_id, "session replaced during round trip; response dropped");
                ControllerError::SessionMismatch {
                    requested: run_id.to_string(),
                    current: self.state.current().run_id().unwrap_or("none").to_string(),
                }
            })?;

        if finished {
            info!(
                run_id = %run_id,
                status = %run.status,
                admitted = run.admitted_count,
                rejected = run.rejected_count,
                "run finished"
            );
        }

        Ok(StepOutcome {
            run,
            next,
            event,
            version: commit.version,
        })
    }
}

/// Tallies after `event` when the service did not send them.
fn derive_counts(mut counts: AttributeCounts, event: Option<&DecisionEvent>) -> AttributeCounts {
    if let Some(event) = event.filter(|e| e.accepted) {
        for attribute in event.true_attributes() {
            *counts.entry(attribute.to_string()).or_insert(0) += 1;
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{MockDecisionApi, RunSummary};
    use crate::error::ApiError;
    use crate::model::fixtures::{candidate, run_state};
    use crate::model::{Scenario, Session};
    use std::collections::BTreeMap;

    fn seeded_state(phase: SessionPhase) -> Arc<SessionStateStore> {
        let state = Arc::new(SessionStateStore::new(Scenario::Three));
        state.replace(Session {
            phase,
            scenario: Scenario::Three,
            run: Some(run_state("r1")),
            pending: Some(candidate(1)),
        });
        state
    }

    fn response(admitted: u32, next: Option<u64>) -> StepResponse {
        let mut run = run_state("r1");
        run.admitted_count = admitted;
        run.pending_candidate_index = next;
        StepResponse {
            run: RunSummary::from(&run),
            event: None,
            next_person: next.map(candidate),
            admitted_by_attribute: Some(BTreeMap::from([("techno_lover".to_string(), admitted)])),
        }
    }

    fn accepted_event(index: u64) -> DecisionEvent {
        DecisionEvent {
            id: 1,
            person_index: index,
            attributes: BTreeMap::from([
                ("techno_lover".to_string(), serde_json::json!(true)),
                ("well_connected".to_string(), serde_json::json!(false)),
            ]),
            accepted: true,
            admitted_count: 1,
            rejected_count: 0,
            created_at: "2025-01-01T00:00:00Z".to_string(),
        }
    }

    #[tokio::test]
    async fn test_step_applies_response() {
        let mut api = MockDecisionApi::new();
        api.expect_step()
            .withf(|run_id, index, decision| {
                run_id == "r1" && *index == 1 && *decision == Some(Decision::Accept)
            })
            .times(1)
            .returning(|_, _, _| Ok(response(1, Some(2))));
        let state = seeded_state(SessionPhase::ManualReady);
        let stepper = DecisionStepper::new(Arc::new(api), state.clone());

        let outcome = stepper.step("r1", 1, Some(Decision::Accept)).await.unwrap();
        assert!(!outcome.finished());
        assert_eq!(outcome.next, Some(candidate(2)));

        let session = state.current();
        assert_eq!(session.phase, SessionPhase::ManualReady);
        assert_eq!(session.pending, Some(candidate(2)));
        let run = session.run.unwrap();
        assert_eq!(run.admitted_count, 1);
        assert_eq!(run.admitted_by_attribute.get("techno_lover"), Some(&1));
        assert!(!stepper.is_in_flight());
    }

    #[tokio::test]
    async fn test_initial_fetch_moves_to_manual_ready() {
        let mut api = MockDecisionApi::new();
        api.expect_step()
            .withf(|_, index, decision| *index == 0 && decision.is_none())
            .times(1)
            .returning(|_, _, _| Ok(response(0, Some(0))));
        let state = seeded_state(SessionPhase::Starting);
        state.update(|s| s.pending = None);
        let stepper = DecisionStepper::new(Arc::new(api), state.clone());

        stepper.step("r1", 0, None).await.unwrap();
        let session = state.current();
        assert_eq!(session.phase, SessionPhase::ManualReady);
        assert_eq!(session.pending, Some(candidate(0)));
    }

    #[tokio::test]
    async fn test_in_flight_call_rejected_without_network() {
        let mut api = MockDecisionApi::new();
        api.expect_step().never();
        api.expect_auto_step().never();
        let stepper = DecisionStepper::new(Arc::new(api), seeded_state(SessionPhase::ManualReady));

        let _held = stepper.acquire().unwrap();
        let err = stepper.step("r1", 1, Some(Decision::Reject)).await.unwrap_err();
        assert!(matches!(err, ControllerError::ConcurrencyViolation));
        let err = stepper
            .auto_step("r1", 1, Strategy::GreedyTightness)
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::ConcurrencyViolation));
    }

    #[tokio::test]
    async fn test_terminal_run_rejected() {
        let mut api = MockDecisionApi::new();
        api.expect_step().never();
        let state = seeded_state(SessionPhase::Completed);
        state.update(|s| {
            if let Some(run) = s.run.as_mut() {
                run.status = RunStatus::Completed;
            }
        });
        let stepper = DecisionStepper::new(Arc::new(api), state);

        let err = stepper.step("r1", 1, Some(Decision::Accept)).await.unwrap_err();
        assert!(matches!(
            err,
            ControllerError::TerminalState(RunStatus::Completed)
        ));
        assert!(!stepper.is_in_flight());
    }

    #[tokio::test]
    async fn test_wrong_run_id_rejected() {
        let mut api = MockDecisionApi::new();
        api.expect_step().never();
        let stepper = DecisionStepper::new(Arc::new(api), seeded_state(SessionPhase::ManualReady));
        let err = stepper.step("other", 1, None).await.unwrap_err();
        assert!(matches!(err, ControllerError::SessionMismatch { .. }));
    }

    #[tokio::test]
    async fn test_failure_leaves_state_unchanged() {
        let mut api = MockDecisionApi::new();
        api.expect_step().times(1).returning(|_, _, _| {
            Err(ApiError::Status {
                status: 502,
                body: "external failed".to_string(),
            })
        });
        let state = seeded_state(SessionPhase::ManualReady);
        let before = state.current();
        let version = state.version();
        let stepper = DecisionStepper::new(Arc::new(api), state.clone());

        let err = stepper.step("r1", 1, Some(Decision::Accept)).await.unwrap_err();
        assert!(matches!(err, ControllerError::TransientNetwork(_)));
        assert_eq!(state.current(), before);
        assert_eq!(state.version(), version);
        assert!(!stepper.is_in_flight());
    }

    #[tokio::test]
    async fn test_missing_counts_derived_from_event() {
        let mut api = MockDecisionApi::new();
        api.expect_auto_step()
            .withf(|_, index, strategy| *index == 1 && *strategy == Strategy::Lookahead1)
            .returning(|_, _, _| {
                let mut r = response(1, Some(2));
                r.admitted_by_attribute = None;
                r.event = Some(accepted_event(1));
                Ok(r)
            });
        let state = seeded_state(SessionPhase::AutoRunning);
        state.update(|s| {
            if let Some(run) = s.run.as_mut() {
                run.admitted_by_attribute.insert("techno_lover".to_string(), 4);
            }
        });
        let stepper = DecisionStepper::new(Arc::new(api), state.clone());

        stepper.auto_step("r1", 1, Strategy::Lookahead1).await.unwrap();
        let run = state.current().run.unwrap();
        assert_eq!(run.admitted_by_attribute.get("techno_lover"), Some(&5));
        assert_eq!(run.admitted_by_attribute.get("well_connected"), None);
        assert_eq!(state.current().phase, SessionPhase::AutoRunning);
    }

    #[tokio::test]
    async fn test_terminal_response_clears_candidate() {
        let mut api = MockDecisionApi::new();
        api.expect_step().returning(|_, _, _| {
            let mut r = response(3, Some(2));
            r.run.status = RunStatus::Failed;
            Ok(r)
        });
        let state = seeded_state(SessionPhase::ManualReady);
        let stepper = DecisionStepper::new(Arc::new(api), state.clone());

        let outcome = stepper.step("r1", 1, Some(Decision::Accept)).await.unwrap();
        assert!(outcome.finished());
        assert!(outcome.next.is_none());
        let session = state.current();
        assert_eq!(session.phase, SessionPhase::Failed);
        assert!(session.pending.is_none());
    }

    #[tokio::test]
    async fn test_full_venue_finishes_run() {
        let mut api = MockDecisionApi::new();
        api.expect_step()
            .returning(|_, _, _| Ok(response(1000, Some(2))));
        let state = seeded_state(SessionPhase::ManualReady);
        let stepper = DecisionStepper::new(Arc::new(api), state.clone());

        let outcome = stepper.step("r1", 1, Some(Decision::Accept)).await.unwrap();
        assert!(outcome.finished());
        assert_eq!(state.current().phase, SessionPhase::Completed);
    }

    #[tokio::test]
    async fn test_response_over_capacity_not_applied() {
        let mut api = MockDecisionApi::new();
        api.expect_step().returning(|_, _, _| {
            let mut r = response(0, Some(2));
            r.run.admitted_count = 1001;
            Ok(r)
        });
        let state = seeded_state(SessionPhase::ManualReady);
        let version = state.version();
        let stepper = DecisionStepper::new(Arc::new(api), state.clone());

        let err = stepper.step("r1", 1, Some(Decision::Accept)).await.unwrap_err();
        assert!(matches!(
            err,
            ControllerError::TransientNetwork(ApiError::InvalidResponse(_))
        ));
        assert_eq!(state.version(), version);
    }

    #[tokio::test]
    async fn test_response_for_replaced_session_dropped() {
        let state = seeded_state(SessionPhase::ManualReady);
        let racing = state.clone();
        let mut api = MockDecisionApi::new();
        api.expect_step().returning(move |_, _, _| {
            racing.replace(Session::idle(Scenario::One));
            Ok(response(1, Some(2)))
        });
        let stepper = DecisionStepper::new(Arc::new(api), state.clone());

        let err = stepper.step("r1", 1, Some(Decision::Accept)).await.unwrap_err();
        assert!(matches!(err, ControllerError::SessionMismatch { .. }));
        assert!(state.current().is_idle());
    }

    #[test]
    fn test_derive_counts_ignores_rejections() {
        let mut event = accepted_event(3);
        event.accepted = false;
        let counts = derive_counts(AttributeCounts::new(), Some(&event));
        assert!(counts.is_empty());
        assert!(derive_counts(AttributeCounts::new(), None).is_empty());
    }
}
