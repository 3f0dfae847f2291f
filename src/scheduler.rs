//! Auto-run scheduler: a paced, cancellable loop over the decision stepper.
//!
//! Each iteration awaits one round trip, then waits the configured delay
//! before the next, so a slow service never causes overlapping calls.
//! Cancellation is cooperative. A round trip already in flight always
//! completes and is applied; the token is checked before every call and
//! raced against the delay.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::DecisionApi;
use crate::error::{ControllerError, Result};
use crate::model::{SessionPhase, Strategy};
use crate::state::SessionStateStore;
use crate::stepper::{DecisionStepper, StepOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Running,
}

/// Why a scheduler run ended.
#[derive(Debug)]
pub enum ScheduleExit {
    /// A stop condition was reached and the session finalized.
    Finished(StepOutcome),
    /// `stop()` was called, or the session went away underneath the loop.
    Cancelled,
    /// A round trip failed; the loop does not retry.
    Failed(ControllerError),
}

/// The most recently started loop. Kept after it exits so late joiners
/// still see its completion.
#[derive(Clone)]
struct ActiveRun {
    generation: u64,
    token: CancellationToken,
    done: watch::Receiver<bool>,
}

impl ActiveRun {
    async fn exited(&self) {
        let mut done = self.done.clone();
        let _ = done.wait_for(|exited| *exited).await;
    }
}

/// Marks the loop as exited when dropped, even if the task unwinds.
struct ExitSignal {
    running: Arc<AtomicBool>,
    done: watch::Sender<bool>,
}

impl Drop for ExitSignal {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.done.send_replace(true);
    }
}

struct LoopContext {
    api: Arc<dyn DecisionApi>,
    stepper: Arc<DecisionStepper>,
    state: Arc<SessionStateStore>,
    strategy: Strategy,
    delay: Duration,
    token: CancellationToken,
}

pub struct AutoRunScheduler {
    api: Arc<dyn DecisionApi>,
    stepper: Arc<DecisionStepper>,
    state: Arc<SessionStateStore>,
    active: Mutex<Option<ActiveRun>>,
    generation: AtomicU64,
    running: Arc<AtomicBool>,
    exit: Arc<Mutex<Option<(u64, ScheduleExit)>>>,
}

impl AutoRunScheduler {
    pub fn new(
        api: Arc<dyn DecisionApi>,
        stepper: Arc<DecisionStepper>,
        state: Arc<SessionStateStore>,
    ) -> Self {
        Self {
            api,
            stepper,
            state,
            active: Mutex::new(None),
            generation: AtomicU64::new(0),
            running: Arc::new(AtomicBool::new(false)),
            exit: Arc::new(Mutex::new(None)),
        }
    }

    pub fn state(&self) -> SchedulerState {
        if self.running.load(Ordering::Acquire) {
            SchedulerState::Running
        } else {
            SchedulerState::Stopped
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == SchedulerState::Running
    }

    /// Stop was requested but the loop has not exited yet.
    pub fn is_stopping(&self) -> bool {
        self.is_running()
            && self
                .active()
                .as_ref()
                .is_some_and(|run| run.token.is_cancelled())
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn exit_slot(&self) -> MutexGuard<'_, Option<(u64, ScheduleExit)>> {
        self.exit.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Handle to the current loop's completion, without holding the lock.
    fn watch_active(&self) -> Option<ActiveRun> {
        self.active().clone()
    }

    /// Start the loop. Returns `Ok(false)` when it is already running and
    /// `StopPending` while a stopped loop is still finishing its last call.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, strategy: Strategy, delay: Duration) -> Result<bool> {
        let mut active = self.active();
        if self.is_running() {
            if active.as_ref().is_some_and(|run| run.token.is_cancelled()) {
                return Err(ControllerError::StopPending);
            }
            return Ok(false);
        }
        if self.stepper.is_in_flight() {
            return Err(ControllerError::ConcurrencyViolation);
        }

        let session = self.state.current();
        let run = session.run.as_ref().ok_or(ControllerError::NoSession)?;
        if run.is_terminal() {
            return Err(ControllerError::TerminalState(run.status));
        }
        if session.phase.is_terminal() || session.pending.is_none() {
            return Err(ControllerError::NoPendingCandidate);
        }

        self.state.update(|s| s.phase = SessionPhase::AutoRunning);
        self.running.store(true, Ordering::Release);

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let token = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        let signal = ExitSignal {
            running: self.running.clone(),
            done: done_tx,
        };
        let ctx = LoopContext {
            api: self.api.clone(),
            stepper: self.stepper.clone(),
            state: self.state.clone(),
            strategy,
            delay,
            token: token.clone(),
        };
        let exit_slot = self.exit.clone();

        info!(
            run_id = %run.run_id,
            strategy = %strategy,
            delay_ms = delay.as_millis() as u64,
            "auto-run started"
        );
        tokio::spawn(async move {
            let _signal = signal;
            let state = ctx.state.clone();
            let exit = run_loop(ctx).await;
            if !matches!(exit, ScheduleExit::Finished(_)) {
                state.update_if(|s| {
                    if s.phase != SessionPhase::AutoRunning {
                        return false;
                    }
                    s.phase = SessionPhase::AutoPaused;
                    true
                });
            }
            match &exit {
                ScheduleExit::Finished(outcome) => info!(
                    run_id = %outcome.run.run_id,
                    status = %outcome.run.status,
                    "auto-run finished"
                ),
                ScheduleExit::Cancelled => info!("auto-run stopped"),
                ScheduleExit::Failed(e) => warn!(error = %e, "auto-run stopped on error"),
            }
            *exit_slot.lock().unwrap_or_else(|e| e.into_inner()) = Some((generation, exit));
        });

        *active = Some(ActiveRun {
            generation,
            token,
            done: done_rx,
        });
        Ok(true)
    }

    /// Request a cooperative stop. Returns whether a loop was running.
    pub fn stop(&self) -> bool {
        let active = self.active();
        match active.as_ref() {
            Some(run) if self.is_running() => {
                run.token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Wait for the current loop to exit and take its exit reason.
    ///
    /// Cancel-safe: dropping the future leaves the loop and its exit
    /// reason in place for the next caller.
    pub async fn join(&self) -> Option<ScheduleExit> {
        let run = self.watch_active()?;
        run.exited().await;
        let mut slot = self.exit_slot();
        match slot.as_ref() {
            Some((generation, _)) if *generation == run.generation => {
                slot.take().map(|(_, exit)| exit)
            }
            _ => None,
        }
    }

    /// Wait for a loop that was asked to stop to finish its last round trip.
    pub async fn settle(&self) {
        if let Some(run) = self.watch_active() {
            if run.token.is_cancelled() {
                run.exited().await;
            }
        }
    }

    /// Take the exit reason of a loop that already ended. Each exit is surfaced once.
    pub fn last_exit(&self) -> Option<ScheduleExit> {
        if self.is_running() {
            return None;
        }
        self.exit_slot().take().map(|(_, exit)| exit)
    }

    /// Stop and wait, as one call.
    pub async fn shutdown(&self) -> Option<ScheduleExit> {
        self.stop();
        self.join().await
    }
}

async fn run_loop(ctx: LoopContext) -> ScheduleExit {
    loop {
        if ctx.token.is_cancelled() {
            return ScheduleExit::Cancelled;
        }

        let session = ctx.state.current();
        let (run_id, index) = match (session.run.as_ref(), session.pending.as_ref()) {
            (Some(run), Some(pending)) => (run.run_id.clone(), pending.index),
            _ => return ScheduleExit::Cancelled,
        };

        match ctx.stepper.auto_step(&run_id, index, ctx.strategy).await {
            Ok(outcome) if outcome.finished() => {
                finalize(ctx.api.as_ref(), &run_id).await;
                return ScheduleExit::Finished(outcome);
            }
            Ok(_) => {}
            Err(e) => return ScheduleExit::Failed(e),
        }

        tokio::select! {
            _ = ctx.token.cancelled() => return ScheduleExit::Cancelled,
            _ = tokio::time::sleep(ctx.delay) => {}
        }
    }
}

/// Best-effort completion acknowledgment; the run is already terminal locally.
pub(crate) async fn finalize(api: &dyn DecisionApi, run_id: &str) {
    match api.complete_session(run_id).await {
        Ok(ack) => info!(
            run_id = %run_id,
            status = %ack.status,
            success = ack.success,
            "completion recorded"
        ),
        Err(e) => warn!(run_id = %run_id, error = %e, "failed to record completion"),
    }
}
