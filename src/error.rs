use crate::model::RunStatus;

/// Failure talking to the decision service.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("run not found")]
    NotFound,
    #[error("service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ApiError {
    /// Client-side validation failures (4xx other than 404) are not worth retrying.
    pub fn is_rejection(&self) -> bool {
        matches!(self, ApiError::Status { status, .. } if (400..500).contains(status))
    }
}

/// Failure of the durable key-value store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("network round trip failed: {0}")]
    TransientNetwork(ApiError),
    #[error("request rejected by service: {0}")]
    Rejected(ApiError),
    #[error("run {0} is unknown to the service")]
    InvalidSession(String),
    #[error("another decision is already in flight")]
    ConcurrencyViolation,
    #[error("auto-run is still finishing its last round trip")]
    StopPending,
    #[error("run is {0}; no further decisions allowed")]
    TerminalState(RunStatus),
    #[error("no active session")]
    NoSession,
    #[error("no pending candidate")]
    NoPendingCandidate,
    #[error("run {requested} is not the current session ({current})")]
    SessionMismatch { requested: String, current: String },
}

impl From<ApiError> for ControllerError {
    fn from(err: ApiError) -> Self {
        if err.is_rejection() {
            ControllerError::Rejected(err)
        } else {
            ControllerError::TransientNetwork(err)
        }
    }
}

pub type Result<T, E = ControllerError> = std::result::Result<T, E>;
