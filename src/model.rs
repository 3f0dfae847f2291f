use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Admission counts per attribute name.
pub type AttributeCounts = BTreeMap<String, u32>;

/// One of the fixed venue scenarios offered by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Scenario {
    One,
    Two,
    #[default]
    Three,
}

impl Scenario {
    pub const ALL: [Scenario; 3] = [Scenario::One, Scenario::Two, Scenario::Three];

    pub fn number(self) -> u8 {
        match self {
            Scenario::One => 1,
            Scenario::Two => 2,
            Scenario::Three => 3,
        }
    }
}

impl TryFrom<u8> for Scenario {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Scenario::One),
            2 => Ok(Scenario::Two),
            3 => Ok(Scenario::Three),
            other => Err(format!("scenario must be 1, 2, or 3 (got {})", other)),
        }
    }
}

impl From<Scenario> for u8 {
    fn from(scenario: Scenario) -> Self {
        scenario.number()
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// Run status as reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Created,
    Running,
    Paused,
    Completed,
    Failed,
    /// Any status string this client does not know about. Treated as live.
    #[serde(other)]
    Unknown,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Created => "created",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Minimum number of admissions required for one attribute by session end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Constraint {
    pub attribute: String,
    pub min_count: u32,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeStatistics {
    #[serde(default)]
    pub relative_frequencies: BTreeMap<String, f64>,
    #[serde(default)]
    pub correlations: BTreeMap<String, BTreeMap<String, f64>>,
}

/// The candidate currently awaiting a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCandidate {
    #[serde(rename = "personIndex")]
    pub index: u64,
    pub attributes: BTreeMap<String, bool>,
}

/// Client view of one run on the service.
#[derive(Debug, Clone, PartialEq)]
pub struct RunState {
    pub run_id: String,
    pub game_id: String,
    pub scenario: Scenario,
    pub status: RunStatus,
    pub admitted_count: u32,
    pub rejected_count: u32,
    pub capacity_required: u32,
    pub constraints: Vec<Constraint>,
    pub admitted_by_attribute: AttributeCounts,
    pub attribute_statistics: AttributeStatistics,
    pub pending_candidate_index: Option<u64>,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn at_capacity(&self) -> bool {
        self.admitted_count >= self.capacity_required
    }

    /// True when the run filled the venue and met every constraint.
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Completed && self.at_capacity()
    }
}

/// A manual admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Reject,
}

impl Decision {
    pub fn accepts(self) -> bool {
        matches!(self, Decision::Accept)
    }
}

impl From<bool> for Decision {
    fn from(accept: bool) -> Self {
        if accept {
            Decision::Accept
        } else {
            Decision::Reject
        }
    }
}

/// Server-side decision strategies the auto-run loop can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    GreedyTightness,
    ExpectedFeasible,
    RiskAdjustedFeasible,
    ProportionalControl,
    #[serde(rename = "lookahead_1")]
    Lookahead1,
}

impl Strategy {
    pub const ALL: [Strategy; 5] = [
        Strategy::GreedyTightness,
        Strategy::ExpectedFeasible,
        Strategy::RiskAdjustedFeasible,
        Strategy::ProportionalControl,
        Strategy::Lookahead1,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            Strategy::GreedyTightness => "greedy_tightness",
            Strategy::ExpectedFeasible => "expected_feasible",
            Strategy::RiskAdjustedFeasible => "risk_adjusted_feasible",
            Strategy::ProportionalControl => "proportional_control",
            Strategy::Lookahead1 => "lookahead_1",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Strategy::ALL
            .into_iter()
            .find(|strategy| strategy.tag() == s)
            .ok_or_else(|| format!("unknown strategy: {}", s))
    }
}

/// Local lifecycle of the controller's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionPhase {
    #[default]
    Idle,
    /// Session created, first candidate not fetched yet.
    Starting,
    ManualReady,
    AutoRunning,
    AutoPaused,
    Completed,
    Failed,
}

impl SessionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionPhase::Completed | SessionPhase::Failed)
    }

    /// Phase a finished run settles in.
    pub fn finished(run: &RunState) -> Self {
        if run.status == RunStatus::Failed {
            SessionPhase::Failed
        } else {
            SessionPhase::Completed
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Starting => "starting",
            SessionPhase::ManualReady => "manual-ready",
            SessionPhase::AutoRunning => "auto-running",
            SessionPhase::AutoPaused => "auto-paused",
            SessionPhase::Completed => "completed",
            SessionPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Everything the state store holds for the current session.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Session {
    pub phase: SessionPhase,
    pub scenario: Scenario,
    pub run: Option<RunState>,
    pub pending: Option<PendingCandidate>,
}

impl Session {
    pub fn idle(scenario: Scenario) -> Self {
        Self {
            phase: SessionPhase::Idle,
            scenario,
            run: None,
            pending: None,
        }
    }

    pub fn run_id(&self) -> Option<&str> {
        self.run.as_ref().map(|run| run.run_id.as_str())
    }

    pub fn is_idle(&self) -> bool {
        self.phase == SessionPhase::Idle
    }
}

/// Persisted subset of a session; everything else is fetched from the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub version: u64,
    pub saved_at: DateTime<Utc>,
    pub run_id: String,
    pub phase: SessionPhase,
    pub scenario: Scenario,
    #[serde(default)]
    pub pending: Option<PendingCandidate>,
    #[serde(default)]
    pub admitted_by_attribute: AttributeCounts,
}

impl SessionSnapshot {
    /// `None` for idle sessions: idle sessions have no snapshot.
    pub fn capture(session: &Session, version: u64) -> Option<Self> {
        if session.is_idle() {
            return None;
        }
        let run = session.run.as_ref()?;
        Some(Self {
            version,
            saved_at: Utc::now(),
            run_id: run.run_id.clone(),
            phase: session.phase,
            scenario: session.scenario,
            pending: session.pending.clone(),
            admitted_by_attribute: run.admitted_by_attribute.clone(),
        })
    }

    /// Rebuild a session from this snapshot and the run as the service reports it.
    pub fn restore(self, mut run: RunState) -> Session {
        run.admitted_by_attribute = self.admitted_by_attribute;
        let phase = match self.phase {
            SessionPhase::AutoRunning => SessionPhase::AutoPaused,
            phase => phase,
        };
        let pending = if phase.is_terminal() { None } else { self.pending };
        Session {
            phase,
            scenario: self.scenario,
            run: Some(run),
            pending,
        }
    }
}
