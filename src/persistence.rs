//! Snapshot persistence.
//!
//! The manager observes the state store. Each commit becomes a write
//! command carrying the commit version; a single writer task applies them
//! in order and skips anything not newer than what it last wrote. Write
//! failures are logged and never reach the code that mutated the state.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::api::DecisionApi;
use crate::error::{ApiError, ControllerError, StoreError};
use crate::model::{Session, SessionPhase, SessionSnapshot};
use crate::state::{Commit, StateObserver};
use crate::store::KeyValueStore;

enum PersistCommand {
    Write {
        version: u64,
        snapshot: Option<SessionSnapshot>,
    },
    Flush(oneshot::Sender<()>),
}

pub struct PersistenceManager {
    store: Arc<dyn KeyValueStore>,
    key: String,
    tx: mpsc::UnboundedSender<PersistCommand>,
}

impl PersistenceManager {
    /// Spawn the writer task. Must be called from within a tokio runtime.
    pub fn spawn(store: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Arc<Self> {
        let key = key.into();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer(store.clone(), key.clone(), rx));
        Arc::new(Self { store, key, tx })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Wait until every write queued so far has been attempted.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(PersistCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    fn enqueue(&self, version: u64, snapshot: Option<SessionSnapshot>) {
        if self
            .tx
            .send(PersistCommand::Write { version, snapshot })
            .is_err()
        {
            warn!(version, "snapshot writer is gone; state not persisted");
        }
    }

    async fn load(&self) -> Result<Option<SessionSnapshot>, StoreError> {
        match self.store.get(&self.key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Load the persisted session and check it against the service.
    ///
    /// Returns `None` (idle) when there is no snapshot or it cannot be
    /// resolved; unresolvable snapshots are deleted. Never fails. Call this
    /// before the first commit.
    pub async fn restore(&self, api: &dyn DecisionApi) -> Option<Session> {
        let snapshot = match self.load().await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                debug!(key = %self.key, "no session snapshot");
                return None;
            }
            Err(e) => {
                warn!(key = %self.key, error = %e, "unreadable session snapshot; discarding");
                self.discard().await;
                return None;
            }
        };

        if snapshot.phase == SessionPhase::Starting {
            // No first candidate was fetched; the run cannot be resumed.
            info!(run_id = %snapshot.run_id, "snapshot taken before first candidate; discarding");
            self.discard().await;
            return None;
        }

        match api.get_session(&snapshot.run_id).await {
            Ok(run) => {
                info!(run_id = %snapshot.run_id, phase = %snapshot.phase, "session restored");
                Some(snapshot.restore(run))
            }
            Err(e) => {
                let err = match e {
                    ApiError::NotFound => ControllerError::InvalidSession(snapshot.run_id.clone()),
                    other => ControllerError::from(other),
                };
                warn!(
                    run_id = %snapshot.run_id,
                    error = %err,
                    "failed to restore session; resetting to idle"
                );
                self.discard().await;
                None
            }
        }
    }

    async fn discard(&self) {
        if let Err(e) = self.store.delete(&self.key).await {
            warn!(key = %self.key, error = %e, "failed to delete session snapshot");
        }
    }
}

impl StateObserver for PersistenceManager {
    fn on_commit(&self, commit: &Commit) {
        self.enqueue(
            commit.version,
            SessionSnapshot::capture(&commit.session, commit.version),
        );
    }
}

async fn writer(
    store: Arc<dyn KeyValueStore>,
    key: String,
    mut rx: mpsc::UnboundedReceiver<PersistCommand>,
) {
    let mut last_written = 0u64;
    while let Some(command) = rx.recv().await {
        match command {
            PersistCommand::Write { version, snapshot } => {
                if version <= last_written {
                    debug!(version, last_written, "skipping stale snapshot");
                    continue;
                }
                let result = match &snapshot {
                    Some(snapshot) => match serde_json::to_vec(snapshot) {
                        Ok(bytes) => store.set(&key, &bytes).await,
                        Err(e) => Err(e.into()),
                    },
                    None => store.delete(&key).await,
                };
                match result {
                    Ok(()) => {
                        debug!(version, cleared = snapshot.is_none(), "snapshot persisted");
                        last_written = version;
                    }
                    Err(e) => warn!(version, error = %e, "failed to persist snapshot"),
                }
            }
            PersistCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}
