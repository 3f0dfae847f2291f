use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::config::ApiConfig;
use crate::error::ApiError;
use crate::model::{
    AttributeCounts, AttributeStatistics, Constraint, Decision, PendingCandidate, RunState,
    RunStatus, Scenario, Strategy,
};

/// Run summary as the service reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub id: String,
    pub scenario: Scenario,
    pub game_id: String,
    pub status: RunStatus,
    pub admitted_count: u32,
    pub rejected_count: u32,
    pub capacity_required: u32,
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub attribute_statistics: AttributeStatistics,
    #[serde(default)]
    pub pending_person_index: Option<u64>,
}

impl RunSummary {
    /// Convert to the client view, rejecting summaries that break the capacity bound.
    pub fn into_run_state(
        self,
        admitted_by_attribute: AttributeCounts,
    ) -> Result<RunState, ApiError> {
        if self.admitted_count > self.capacity_required {
            return Err(ApiError::InvalidResponse(format!(
                "admitted {} exceeds capacity {}",
                self.admitted_count, self.capacity_required
            )));
        }
        Ok(RunState {
            run_id: self.id,
            game_id: self.game_id,
            scenario: self.scenario,
            status: self.status,
            admitted_count: self.admitted_count,
            rejected_count: self.rejected_count,
            capacity_required: self.capacity_required,
            constraints: self.constraints,
            admitted_by_attribute,
            attribute_statistics: self.attribute_statistics,
            pending_candidate_index: self.pending_person_index,
        })
    }
}

impl From<&RunState> for RunSummary {
    fn from(run: &RunState) -> Self {
        Self {
            id: run.run_id.clone(),
            scenario: run.scenario,
            game_id: run.game_id.clone(),
            status: run.status,
            admitted_count: run.admitted_count,
            rejected_count: run.rejected_count,
            capacity_required: run.capacity_required,
            constraints: run.constraints.clone(),
            attribute_statistics: run.attribute_statistics.clone(),
            pending_person_index: run.pending_candidate_index,
        }
    }
}

/// The decision the service recorded for the candidate just judged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionEvent {
    pub id: i64,
    pub person_index: u64,
    pub attributes: BTreeMap<String, serde_json::Value>,
    pub accepted: bool,
    pub admitted_count: u32,
    pub rejected_count: u32,
    pub created_at: String,
}

impl DecisionEvent {
    /// Attributes the judged candidate had set.
    pub fn true_attributes(&self) -> impl Iterator<Item = &str> {
        self.attributes
            .iter()
            .filter(|(_, v)| v.as_bool().unwrap_or(false))
            .map(|(k, _)| k.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResponse {
    pub run: RunSummary,
    #[serde(default)]
    pub event: Option<DecisionEvent>,
    #[serde(default)]
    pub next_person: Option<PendingCandidate>,
    #[serde(default)]
    pub admitted_by_attribute: Option<AttributeCounts>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionAck {
    pub status: String,
    pub success: bool,
}

#[derive(Debug, Serialize)]
struct NewRunRequest {
    scenario: Scenario,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StepRequest {
    person_index: u64,
    accept: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AutoStepRequest {
    person_index: u64,
    strategy: Strategy,
}

#[derive(Debug, Deserialize)]
struct AdmittedByAttributeResponse {
    counts: AttributeCounts,
}

/// Remote evaluation service driving a run.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DecisionApi: Send + Sync {
    async fn create_session(&self, scenario: Scenario) -> Result<RunState, ApiError>;

    async fn get_session(&self, run_id: &str) -> Result<RunState, ApiError>;

    /// `decision: None` is only valid for the initial fetch of candidate 0.
    async fn step(
        &self,
        run_id: &str,
        index: u64,
        decision: Option<Decision>,
    ) -> Result<StepResponse, ApiError>;

    /// Let the service decide for candidate `index` using `strategy`.
    async fn auto_step(
        &self,
        run_id: &str,
        index: u64,
        strategy: Strategy,
    ) -> Result<StepResponse, ApiError>;

    async fn complete_session(&self, run_id: &str) -> Result<CompletionAck, ApiError>;

    async fn admitted_by_attribute(&self, run_id: &str) -> Result<AttributeCounts, ApiError>;
}

/// reqwest-backed client for the decision service's JSON API.
pub struct HttpDecisionApi {
    client: Client,
    base_url: String,
}

impl HttpDecisionApi {
    pub fn new(config: &ApiConfig) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiError> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if status == StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound);
        }
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl DecisionApi for HttpDecisionApi {
    async fn create_session(&self, scenario: Scenario) -> Result<RunState, ApiError> {
        debug!(scenario = %scenario, "creating run");
        let summary: RunSummary = self
            .send(
                self.client
                    .post(self.url("/runs/new"))
                    .json(&NewRunRequest { scenario }),
            )
            .await?;
        summary.into_run_state(AttributeCounts::new())
    }

    async fn get_session(&self, run_id: &str) -> Result<RunState, ApiError> {
        let summary: RunSummary = self
            .send(self.client.get(self.url(&format!("/runs/{}", run_id))))
            .await?;
        summary.into_run_state(AttributeCounts::new())
    }

    async fn step(
        &self,
        run_id: &str,
        index: u64,
        decision: Option<Decision>,
    ) -> Result<StepResponse, ApiError> {
        let request = StepRequest {
            person_index: index,
            accept: decision.map(Decision::accepts),
        };
        self.send(
            self.client
                .post(self.url(&format!("/runs/{}/step", run_id)))
                .json(&request),
        )
        .await
    }

    async fn auto_step(
        &self,
        run_id: &str,
        index: u64,
        strategy: Strategy,
    ) -> Result<StepResponse, ApiError> {
        let request = AutoStepRequest {
            person_index: index,
            strategy,
        };
        self.send(
            self.client
                .post(self.url(&format!("/runs/{}/auto-step", run_id)))
                .json(&request),
        )
        .await
    }

    async fn complete_session(&self, run_id: &str) -> Result<CompletionAck, ApiError> {
        self.send(
            self.client
                .post(self.url(&format!("/runs/{}/complete", run_id))),
        )
        .await
    }

    async fn admitted_by_attribute(&self, run_id: &str) -> Result<AttributeCounts, ApiError> {
        let response: AdmittedByAttributeResponse = self
            .send(
                self.client
                    .get(self.url(&format!("/runs/{}/admitted-by-attribute", run_id))),
            )
            .await?;
        Ok(response.counts)
    }
}
