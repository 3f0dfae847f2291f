use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{info, warn};

use crate::api::{DecisionApi, HttpDecisionApi};
use crate::config::Config;
use crate::error::{ApiError, ControllerError, Result};
use crate::feasibility::FeasibilityReport;
use crate::model::{Decision, RunStatus, Scenario, Session, SessionPhase, Strategy};
use crate::persistence::PersistenceManager;
use crate::scheduler::{self, AutoRunScheduler, ScheduleExit, SchedulerState};
use crate::state::SessionStateStore;
use crate::stepper::{DecisionStepper, StepOutcome};
use crate::store::{FileStore, KeyValueStore};

/// Who is currently allowed to step the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMode {
    Idle,
    /// A manual request (decision or session start) is in flight.
    Manual,
    /// The auto-run scheduler owns stepping.
    Auto,
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub scenario: Scenario,
    pub strategy: Strategy,
    pub delay: Duration,
    pub snapshot_key: String,
}

impl From<&Config> for ControllerSettings {
    fn from(config: &Config) -> Self {
        Self {
            scenario: config.default_scenario,
            strategy: config.auto_run.strategy,
            delay: config.auto_run.delay(),
            snapshot_key: config.storage.snapshot_key.clone(),
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Returns the mode to `Idle` when a manual request ends.
struct ManualGuard<'a>(&'a Mutex<ControlMode>);

impl Drop for ManualGuard<'_> {
    fn drop(&mut self) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = ControlMode::Idle;
    }
}

/// Owns one session: state, stepping, auto-run and persistence.
pub struct SessionController {
    api: Arc<dyn DecisionApi>,
    state: Arc<SessionStateStore>,
    stepper: Arc<DecisionStepper>,
    scheduler: AutoRunScheduler,
    persistence: Arc<PersistenceManager>,
    mode: Mutex<ControlMode>,
    settings: Mutex<ControllerSettings>,
}

impl SessionController {
    /// Wire up a controller. Must be called from within a tokio runtime.
    pub fn new(
        api: Arc<dyn DecisionApi>,
        store: Arc<dyn KeyValueStore>,
        settings: ControllerSettings,
    ) -> Self {
        let state = Arc::new(SessionStateStore::new(settings.scenario));
        let persistence = PersistenceManager::spawn(store, settings.snapshot_key.clone());
        state.subscribe(persistence.clone());

        let stepper = Arc::new(DecisionStepper::new(api.clone(), state.clone()));
        let scheduler = AutoRunScheduler::new(api.clone(), stepper.clone(), state.clone());

        Self {
            api,
            state,
            stepper,
            scheduler,
            persistence,
            mode: Mutex::new(ControlMode::Idle),
            settings: Mutex::new(settings),
        }
    }

    /// HTTP service plus file-backed profile store, as configured.
    pub fn from_config(config: &Config) -> Result<Self, ApiError> {
        let api = Arc::new(HttpDecisionApi::new(&config.api)?);
        let store = Arc::new(FileStore::new(config.storage.dir.clone()));
        Ok(Self::new(api, store, ControllerSettings::from(config)))
    }

    fn mode_lock(&self) -> MutexGuard<'_, ControlMode> {
        self.mode.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn settings_lock(&self) -> MutexGuard<'_, ControllerSettings> {
        self.settings.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn mode(&self) -> ControlMode {
        let mut mode = self.mode_lock();
        if *mode == ControlMode::Auto && !self.scheduler.is_running() {
            *mode = ControlMode::Idle;
        }
        *mode
    }

    /// Claim manual control, or fail if anything else is stepping.
    fn begin_manual(&self) -> Result<ManualGuard<'_>> {
        let mut mode = self.mode_lock();
        if self.scheduler.is_running() || self.stepper.is_in_flight() {
            return Err(ControllerError::ConcurrencyViolation);
        }
        if *mode == ControlMode::Manual {
            return Err(ControllerError::ConcurrencyViolation);
        }
        *mode = ControlMode::Manual;
        Ok(ManualGuard(&self.mode))
    }

    pub fn session(&self) -> Session {
        self.state.current()
    }

    pub fn feasibility(&self) -> Option<FeasibilityReport> {
        self.state.feasibility()
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    pub fn settings(&self) -> ControllerSettings {
        self.settings_lock().clone()
    }

    pub fn set_strategy(&self, strategy: Strategy) {
        self.settings_lock().strategy = strategy;
    }

    /// Pause between auto-run calls; takes effect on the next start.
    pub fn set_delay(&self, delay: Duration) {
        self.settings_lock().delay = delay;
    }

    /// Load the persisted session, falling back to idle. Never fails.
    pub async fn restore(&self) -> Session {
        let session = match self.persistence.restore(self.api.as_ref()).await {
            Some(session) => session,
            None => Session::idle(self.settings().scenario),
        };
        self.settings_lock().scenario = session.scenario;
        self.state.replace(session.clone());
        session
    }

    /// Create a fresh session and fetch its first candidate.
    pub async fn new_session(&self, scenario: Scenario) -> Result<Session> {
        self.scheduler.shutdown().await;
        let _guard = self.begin_manual()?;
        self.settings_lock().scenario = scenario;

        self.state.replace(Session {
            phase: SessionPhase::Starting,
            ..Session::idle(scenario)
        });

        let run = match self.api.create_session(scenario).await {
            Ok(run) => run,
            Err(e) => {
                warn!(scenario = %scenario, error = %e, "failed to create run");
                self.state.replace(Session::idle(scenario));
                return Err(e.into());
            }
        };
        let run_id = run.run_id.clone();
        info!(run_id = %run_id, game_id = %run.game_id, scenario = %scenario, "new run created");

        self.state.replace(Session {
            phase: SessionPhase::Starting,
            scenario,
            run: Some(run),
            pending: None,
        });

        match self.stepper.step(&run_id, 0, None).await {
            Ok(outcome) => {
                if outcome.finished() {
                    scheduler::finalize(self.api.as_ref(), &run_id).await;
                }
                Ok(self.state.current())
            }
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "failed to fetch first candidate");
                self.state.replace(Session::idle(scenario));
                Err(e)
            }
        }
    }

    /// One manual decision on the pending candidate.
    pub async fn decide(&self, decision: Decision) -> Result<StepOutcome> {
        let _guard = self.begin_manual()?;

        let session = self.state.current();
        let run = session.run.as_ref().ok_or(ControllerError::NoSession)?;
        if run.is_terminal() {
            return Err(ControllerError::TerminalState(run.status));
        }
        match session.phase {
            SessionPhase::Completed => {
                return Err(ControllerError::TerminalState(RunStatus::Completed))
            }
            SessionPhase::Failed => return Err(ControllerError::TerminalState(RunStatus::Failed)),
            _ => {}
        }
        let pending = session
            .pending
            .as_ref()
            .ok_or(ControllerError::NoPendingCandidate)?;

        let outcome = self
            .stepper
            .step(&run.run_id, pending.index, Some(decision))
            .await?;
        if outcome.finished() {
            scheduler::finalize(self.api.as_ref(), &run.run_id).await;
        } else if session.phase == SessionPhase::AutoPaused {
            self.state.update_if(|s| {
                if s.phase != SessionPhase::AutoPaused {
                    return false;
                }
                s.phase = SessionPhase::ManualReady;
                true
            });
        }
        Ok(outcome)
    }

    /// Start auto-run with the current settings. `Ok(false)` if already running.
    pub async fn start_auto(&self) -> Result<bool> {
        let settings = self.settings();
        self.start_auto_with(settings.strategy, settings.delay).await
    }

    /// A loop that is still stopping is waited out before the new one starts.
    pub async fn start_auto_with(&self, strategy: Strategy, delay: Duration) -> Result<bool> {
        self.scheduler.settle().await;
        let mut mode = self.mode_lock();
        if *mode == ControlMode::Manual {
            return Err(ControllerError::ConcurrencyViolation);
        }
        let started = self.scheduler.start(strategy, delay)?;
        *mode = ControlMode::Auto;
        Ok(started)
    }

    /// Stop auto-run, letting an in-flight round trip land first.
    pub async fn stop_auto(&self) -> Option<ScheduleExit> {
        let exit = self.scheduler.shutdown().await;
        let mut mode = self.mode_lock();
        if *mode == ControlMode::Auto && !self.scheduler.is_running() {
            *mode = ControlMode::Idle;
        }
        exit
    }

    /// Wait for a running auto-run to end on its own.
    pub async fn wait_auto(&self) -> Option<ScheduleExit> {
        self.scheduler.join().await
    }

    /// Exit reason of an auto-run that ended on its own, if not yet taken.
    pub fn last_auto_exit(&self) -> Option<ScheduleExit> {
        self.scheduler.last_exit()
    }

    /// Switch scenario; a live session is dropped back to idle.
    pub async fn change_scenario(&self, scenario: Scenario) -> Result<()> {
        self.stop_auto().await;
        let _guard = self.begin_manual()?;
        self.settings_lock().scenario = scenario;
        if self.state.current().is_idle() {
            self.state.update(|s| s.scenario = scenario);
        } else {
            info!(scenario = %scenario, "scenario changed; resetting session");
            self.state.replace(Session::idle(scenario));
        }
        Ok(())
    }

    /// Drop the current session and clear its snapshot.
    pub async fn reset(&self) -> Result<()> {
        self.stop_auto().await;
        let _guard = self.begin_manual()?;
        let scenario = self.state.current().scenario;
        self.state.replace(Session::idle(scenario));
        Ok(())
    }

    /// Re-read the per-attribute tallies from the service.
    pub async fn refresh_tallies(&self) -> Result<()> {
        let _guard = self.begin_manual()?;
        let run_id = self
            .state
            .current()
            .run_id()
            .map(str::to_string)
            .ok_or(ControllerError::NoSession)?;
        let counts = self.api.admitted_by_attribute(&run_id).await?;
        self.state.update_if(|s| match s.run.as_mut() {
            Some(run) if run.run_id == run_id => {
                run.admitted_by_attribute = counts;
                true
            }
            _ => false,
        });
        Ok(())
    }

    /// Stop auto-run and wait for pending snapshot writes.
    pub async fn shutdown(&self) {
        self.stop_auto().await;
        self.persistence.flush().await;
    }

    pub async fn flush(&self) {
        self.persistence.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{CompletionAck, MockDecisionApi, RunSummary, StepResponse};
    use crate::model::fixtures::{candidate, run_state};
    use crate::store::MemoryStore;
    use std::collections::BTreeMap;

    fn first_step(index: u64) -> StepResponse {
        StepResponse {
            run: RunSummary::from(&run_state("r1")),
            event: None,
            next_person: Some(candidate(index)),
            admitted_by_attribute: None,
        }
    }

    fn controller(api: MockDecisionApi, store: Arc<MemoryStore>) -> SessionController {
        SessionController::new(Arc::new(api), store, ControllerSettings::default())
    }

    fn expect_new_run(api: &mut MockDecisionApi) {
        api.expect_create_session()
            .withf(|scenario| *scenario == Scenario::Two)
            .times(1)
            .returning(|_| Ok(run_state("r1")));
        api.expect_step()
            .withf(|_, index, decision| *index == 0 && decision.is_none())
            .times(1)
            .returning(|_, _, _| Ok(first_step(0)));
    }

    #[tokio::test]
    async fn test_new_session_fetches_first_candidate() {
        let mut api = MockDecisionApi::new();
        expect_new_run(&mut api);
        let store = Arc::new(MemoryStore::new());
        let controller = controller(api, store.clone());

        let session = controller.new_session(Scenario::Two).await.unwrap();
        assert_eq!(session.phase, SessionPhase::ManualReady);
        assert_eq!(session.scenario, Scenario::Two);
        assert_eq!(session.pending, Some(candidate(0)));
        assert_eq!(controller.mode(), ControlMode::Idle);

        controller.flush().await;
        assert!(store.contains("session_snapshot"));
    }

    #[tokio::test]
    async fn test_new_session_failure_resets_to_idle() {
        let mut api = MockDecisionApi::new();
        api.expect_create_session().returning(|_| {
            Err(ApiError::Status {
                status: 502,
                body: "external failed".to_string(),
            })
        });
        api.expect_step().never();
        let store = Arc::new(MemoryStore::new());
        let controller = controller(api, store.clone());

        let err = controller.new_session(Scenario::One).await.unwrap_err();
        assert!(matches!(err, ControllerError::TransientNetwork(_)));
        assert!(controller.session().is_idle());
        controller.flush().await;
        assert!(!store.contains("session_snapshot"));
    }

    #[tokio::test]
    async fn test_decide_finishing_run_acknowledges_completion() {
        let mut api = MockDecisionApi::new();
        expect_new_run(&mut api);
        api.expect_step()
            .withf(|_, index, decision| *index == 0 && *decision == Some(Decision::Accept))
            .times(1)
            .returning(|_, _, _| {
                let mut run = run_state("r1");
                run.status = RunStatus::Completed;
                run.admitted_count = 1;
                Ok(StepResponse {
                    run: RunSummary::from(&run),
                    event: None,
                    next_person: None,
                    admitted_by_attribute: Some(BTreeMap::from([("techno_lover".to_string(), 1)])),
                })
            });
        api.expect_complete_session().times(1).returning(|_| {
            Ok(CompletionAck {
                status: "completed".to_string(),
                success: false,
            })
        });
        let controller = controller(api, Arc::new(MemoryStore::new()));

        controller.new_session(Scenario::Two).await.unwrap();
        let outcome = controller.decide(Decision::Accept).await.unwrap();
        assert!(outcome.finished());
        assert_eq!(controller.session().phase, SessionPhase::Completed);

        let err = controller.decide(Decision::Reject).await.unwrap_err();
        assert!(matches!(
            err,
            ControllerError::TerminalState(RunStatus::Completed)
        ));
        let err = controller.start_auto().await.unwrap_err();
        assert!(matches!(
            err,
            ControllerError::TerminalState(RunStatus::Completed)
        ));
    }

    #[tokio::test]
    async fn test_decide_without_session() {
        let controller = controller(MockDecisionApi::new(), Arc::new(MemoryStore::new()));
        assert!(matches!(
            controller.decide(Decision::Accept).await.unwrap_err(),
            ControllerError::NoSession
        ));
    }

    #[tokio::test]
    async fn test_change_scenario_resets_and_clears_snapshot() {
        let mut api = MockDecisionApi::new();
        expect_new_run(&mut api);
        let store = Arc::new(MemoryStore::new());
        let controller = controller(api, store.clone());

        controller.new_session(Scenario::Two).await.unwrap();
        controller.change_scenario(Scenario::One).await.unwrap();
        let session = controller.session();
        assert!(session.is_idle());
        assert_eq!(session.scenario, Scenario::One);
        assert!(controller.feasibility().is_none());

        controller.flush().await;
        assert!(!store.contains("session_snapshot"));
    }

    #[tokio::test]
    async fn test_refresh_tallies() {
        let mut api = MockDecisionApi::new();
        expect_new_run(&mut api);
        api.expect_admitted_by_attribute()
            .times(1)
            .returning(|_| Ok(BTreeMap::from([("techno_lover".to_string(), 640)])));
        let controller = controller(api, Arc::new(MemoryStore::new()));

        controller.new_session(Scenario::Two).await.unwrap();
        controller.refresh_tallies().await.unwrap();
        let report = controller.feasibility().unwrap();
        assert_eq!(report.progress[0].current, 640);
        assert_eq!(report.progress[0].deficit, 10);
    }

    #[tokio::test]
    async fn test_restore_snapshot_for_unknown_run_goes_idle() {
        let store = Arc::new(MemoryStore::new());
        let stale = crate::model::SessionSnapshot::capture(
            &Session {
                phase: SessionPhase::ManualReady,
                scenario: Scenario::One,
                run: Some(run_state("gone")),
                pending: Some(candidate(3)),
            },
            12,
        )
        .unwrap();
        store
            .set("session_snapshot", &serde_json::to_vec(&stale).unwrap())
            .await
            .unwrap();

        let mut api = MockDecisionApi::new();
        api.expect_get_session()
            .returning(|_| Err(ApiError::NotFound));
        let controller = controller(api, store.clone());

        let session = controller.restore().await;
        assert!(session.is_idle());
        controller.flush().await;
        assert!(!store.contains("session_snapshot"));
    }
}
