//! Session state store.
//!
//! Holds the one authoritative [`Session`]. Every change goes through
//! [`SessionStateStore::replace`] or [`SessionStateStore::update`], which
//! bump the version, recompute feasibility and hand the committed state to
//! each observer exactly once, in version order.

use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use crate::feasibility::{self, FeasibilityReport};
use crate::model::{Scenario, Session};

/// A committed state transition.
#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    pub version: u64,
    pub session: Session,
    pub feasibility: Option<FeasibilityReport>,
}

/// Receives every committed transition.
///
/// Called while the store is locked: implementations must not call back
/// into the store and must not block.
pub trait StateObserver: Send + Sync {
    fn on_commit(&self, commit: &Commit);
}

struct Inner {
    version: u64,
    session: Session,
    feasibility: Option<FeasibilityReport>,
    observers: Vec<Arc<dyn StateObserver>>,
}

pub struct SessionStateStore {
    inner: Mutex<Inner>,
}

impl SessionStateStore {
    pub fn new(scenario: Scenario) -> Self {
        Self {
            inner: Mutex::new(Inner {
                version: 0,
                session: Session::idle(scenario),
                feasibility: None,
                observers: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self, observer: Arc<dyn StateObserver>) {
        self.lock().observers.push(observer);
    }

    pub fn current(&self) -> Session {
        self.lock().session.clone()
    }

    pub fn version(&self) -> u64 {
        self.lock().version
    }

    /// Feasibility of the current run, `None` while idle.
    pub fn feasibility(&self) -> Option<FeasibilityReport> {
        self.lock().feasibility.clone()
    }

    /// Atomically replace the whole session.
    pub fn replace(&self, next: Session) -> Commit {
        let mut inner = self.lock();
        Self::commit_locked(&mut inner, next)
    }

    /// Read-modify-replace under one lock.
    pub fn update<F>(&self, f: F) -> Commit
    where
        F: FnOnce(&mut Session),
    {
        let mut inner = self.lock();
        let mut next = inner.session.clone();
        f(&mut next);
        Self::commit_locked(&mut inner, next)
    }

    /// Like [`update`](Self::update), but commits only when `f` returns true.
    pub fn update_if<F>(&self, f: F) -> Option<Commit>
    where
        F: FnOnce(&mut Session) -> bool,
    {
        let mut inner = self.lock();
        let mut next = inner.session.clone();
        if !f(&mut next) {
            return None;
        }
        Some(Self::commit_locked(&mut inner, next))
    }

    fn commit_locked(inner: &mut Inner, next: Session) -> Commit {
        inner.version += 1;
        inner.feasibility = next.run.as_ref().map(feasibility::evaluate);
        inner.session = next;

        let commit = Commit {
            version: inner.version,
            session: inner.session.clone(),
            feasibility: inner.feasibility.clone(),
        };
        debug!(
            version = commit.version,
            phase = %commit.session.phase,
            run_id = ?commit.session.run_id(),
            "state committed"
        );
        for observer in &inner.observers {
            observer.on_commit(&commit);
        }
        commit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{candidate, run_state};
    use crate::model::SessionPhase;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(u64, SessionPhase)>>,
    }

    impl StateObserver for Recorder {
        fn on_commit(&self, commit: &Commit) {
            self.seen
                .lock()
                .unwrap()
                .push((commit.version, commit.session.phase));
        }
    }

    fn ready_session() -> Session {
        Session {
            phase: SessionPhase::ManualReady,
            scenario: Scenario::Three,
            run: Some(run_state("r1")),
            pending: Some(candidate(1)),
        }
    }

    #[test]
    fn test_starts_idle() {
        let store = SessionStateStore::new(Scenario::Two);
        let session = store.current();
        assert!(session.is_idle());
        assert_eq!(session.scenario, Scenario::Two);
        assert_eq!(store.version(), 0);
        assert!(store.feasibility().is_none());
    }

    #[test]
    fn test_replace_bumps_version_and_recomputes_feasibility() {
        let store = SessionStateStore::new(Scenario::Three);
        let commit = store.replace(ready_session());
        assert_eq!(commit.version, 1);
        assert_eq!(store.current(), ready_session());

        let report = store.feasibility().unwrap();
        assert_eq!(report.remaining, 1000);
        assert!(report.is_feasible());

        store.replace(Session::idle(Scenario::Three));
        assert_eq!(store.version(), 2);
        assert!(store.feasibility().is_none());
    }

    #[test]
    fn test_observers_see_every_commit_in_order() {
        let store = SessionStateStore::new(Scenario::Three);
        let recorder = Arc::new(Recorder::default());
        store.subscribe(recorder.clone());

        store.replace(ready_session());
        store.update(|s| s.phase = SessionPhase::AutoRunning);
        store.update(|s| s.phase = SessionPhase::AutoPaused);

        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec![
                (1, SessionPhase::ManualReady),
                (2, SessionPhase::AutoRunning),
                (3, SessionPhase::AutoPaused),
            ]
        );
    }

    #[test]
    fn test_update_sees_latest_state() {
        let store = SessionStateStore::new(Scenario::Three);
        store.replace(ready_session());
        let commit = store.update(|s| {
            if let Some(run) = s.run.as_mut() {
                run.admitted_count = 999;
            }
        });
        assert_eq!(commit.feasibility.unwrap().remaining, 1);
    }

    #[test]
    fn test_update_if_skips_commit() {
        let store = SessionStateStore::new(Scenario::Three);
        let recorder = Arc::new(Recorder::default());
        store.subscribe(recorder.clone());

        assert!(store.update_if(|_| false).is_none());
        assert_eq!(store.version(), 0);
        assert!(recorder.seen.lock().unwrap().is_empty());

        let commit = store.update_if(|s| {
            s.phase = SessionPhase::Starting;
            true
        });
        assert_eq!(commit.map(|c| c.version), Some(1));
    }
}
