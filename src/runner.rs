use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use crate::{
    actors::ModelActor,
    conversation::{Clock, ConversationEngine, EngineConfig, SystemClock},
    error::SimulationError,
    evaluator::{EvaluationResult, Evaluator},
    prompts::PromptTemplates,
    scenario::ScenarioSpec,
    session::{SessionSource, UuidSessions},
    transcript::{TerminationReason, Transcript},
    types::TokenUsage,
    LLMError, LLMProvider,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioStatus {
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl ScenarioStatus {
    pub fn from_reason(reason: TerminationReason) -> Self {
        match reason {
            TerminationReason::ClientEnded
            | TerminationReason::AgentEndedCall
            | TerminationReason::MaxTurnsReached => ScenarioStatus::Completed,
            TerminationReason::TimeoutExceeded => ScenarioStatus::Timeout,
            TerminationReason::Cancelled => ScenarioStatus::Cancelled,
            TerminationReason::EngineError => ScenarioStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Rate limit or network trouble that outlasted the per-call retries.
    Transient,
    /// Bad scenario, missing template variable, rejected request.
    Fatal,
    /// A panic or other unexpected fault inside the scenario.
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ScenarioFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == FailureKind::Transient
    }
}

impl From<&LLMError> for ScenarioFailure {
    fn from(err: &LLMError) -> Self {
        let kind = if err.is_transient() {
            FailureKind::Transient
        } else {
            FailureKind::Fatal
        };
        Self::new(kind, err.to_string())
    }
}

impl From<&SimulationError> for ScenarioFailure {
    fn from(err: &SimulationError) -> Self {
        match err {
            SimulationError::Provider(inner) => inner.into(),
            other => Self::new(FailureKind::Fatal, other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub session_id: String,
    pub scenario_name: String,
    pub status: ScenarioStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<TerminationReason>,
    pub transcript: Transcript,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<EvaluationResult>,
    pub turn_count: usize,
    pub duration_seconds: f64,
    pub usage_totals: TokenUsage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ScenarioFailure>,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ScenarioResult {
    fn empty(session_id: String, scenario_name: String, status: ScenarioStatus) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            scenario_name,
            status,
            termination_reason: None,
            transcript: Transcript::new(),
            evaluation: None,
            turn_count: 0,
            duration_seconds: 0.0,
            usage_totals: TokenUsage::default(),
            error: None,
            attempts: 1,
            started_at: now,
            finished_at: now,
        }
    }

    /// A failed result with no transcript, e.g. for a scenario rejected before
    /// the conversation started.
    pub fn failed(session_id: impl Into<String>, scenario_name: impl Into<String>, failure: ScenarioFailure) -> Self {
        let mut result = Self::empty(session_id.into(), scenario_name.into(), ScenarioStatus::Failed);
        result.error = Some(failure);
        result
    }

    /// Placeholder for a scenario that was never dispatched. Carries no error.
    pub fn not_started(scenario_name: impl Into<String>) -> Self {
        let mut result = Self::empty(String::new(), scenario_name.into(), ScenarioStatus::Cancelled);
        result.termination_reason = Some(TerminationReason::Cancelled);
        result.attempts = 0;
        result
    }

    pub fn is_retryable(&self) -> bool {
        self.status == ScenarioStatus::Failed && self.error.as_ref().map_or(false, ScenarioFailure::is_retryable)
    }

    pub fn score(&self) -> Option<u8> {
        self.evaluation.as_ref().map(|evaluation| evaluation.score)
    }

    pub fn record(&self) -> ResultRecord {
        ResultRecord {
            session_id: self.session_id.clone(),
            scenario_name: self.scenario_name.clone(),
            status: self.status,
            score: self.score(),
            comment: self
                .evaluation
                .as_ref()
                .map(|evaluation| evaluation.comment.clone())
                .or_else(|| self.error.as_ref().map(|error| error.message.clone())),
            turn_count: self.turn_count,
            duration_seconds: self.duration_seconds,
            token_usage_totals: self.usage_totals,
            termination_reason: self.termination_reason,
        }
    }
}

/// Flat per-scenario record handed to storage and export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub session_id: String,
    pub scenario_name: String,
    pub status: ScenarioStatus,
    pub score: Option<u8>,
    pub comment: Option<String>,
    pub turn_count: usize,
    pub duration_seconds: f64,
    pub token_usage_totals: TokenUsage,
    pub termination_reason: Option<TerminationReason>,
}

/// Seam the scheduler dispatches through.
#[async_trait]
pub trait ScenarioExecutor: Send + Sync {
    /// Must not panic or error; every outcome is a [`ScenarioResult`].
    async fn execute(&self, spec: &ScenarioSpec, cancel: &CancellationToken) -> ScenarioResult;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunnerSettings {
    pub model: String,
    pub agent_temperature: f32,
    pub client_temperature: f32,
    pub evaluator_temperature: f32,
    pub engine: EngineConfig,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            agent_temperature: 0.7,
            client_temperature: 0.7,
            evaluator_temperature: 0.3,
            engine: EngineConfig::default(),
        }
    }
}

/// Renders prompts, runs the conversation, scores it.
pub struct ScenarioRunner {
    provider: Arc<dyn LLMProvider>,
    templates: Arc<PromptTemplates>,
    settings: RunnerSettings,
    clock: Arc<dyn Clock>,
    sessions: Arc<dyn SessionSource>,
}

impl ScenarioRunner {
    pub fn new(provider: Arc<dyn LLMProvider>, templates: PromptTemplates, settings: RunnerSettings) -> Self {
        Self {
            provider,
            templates: Arc::new(templates),
            settings,
            clock: Arc::new(SystemClock),
            sessions: Arc::new(UuidSessions),
        }
    }

    pub fn with_session_source(mut self, sessions: Arc<dyn SessionSource>) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    async fn run_scenario(&self, spec: &ScenarioSpec, session_id: &str, cancel: &CancellationToken) -> ScenarioResult {
        let started_at = Utc::now();
        let timer = Instant::now();

        let prepared = spec
            .validate()
            .and_then(|()| self.templates.render(&spec.variables, session_id));
        let prompts = match prepared {
            Ok(prompts) => prompts,
            Err(err) => {
                tracing::error!(error = %err, "scenario rejected");
                return ScenarioResult::failed(session_id, &spec.name, (&err).into());
            }
        };

        let seed = spec.effective_seed();
        let settings = &self.settings;
        let agent = ModelActor::agent(prompts.agent, Arc::clone(&self.provider), settings.model.clone())
            .with_temperature(settings.agent_temperature);
        let client = ModelActor::client(prompts.client, Arc::clone(&self.provider), settings.model.clone())
            .with_temperature(settings.client_temperature);
        let engine = ConversationEngine::new(Arc::new(agent), Arc::new(client)).with_clock(Arc::clone(&self.clock));
        let config = settings.engine.clone().with_seed(seed);

        let outcome = engine.run(&config, cancel).await;
        let mut status = ScenarioStatus::from_reason(outcome.reason);
        let mut error = outcome.error.as_ref().map(ScenarioFailure::from);

        let skip_evaluation = outcome.transcript.is_empty()
            && matches!(outcome.reason, TerminationReason::EngineError | TerminationReason::Cancelled);

        let evaluation = if skip_evaluation {
            None
        } else {
            let evaluator = Evaluator::new(Arc::clone(&self.provider), settings.model.clone(), prompts.evaluator)
                .with_temperature(settings.evaluator_temperature)
                .with_seed(seed)
                .with_retry(settings.engine.retry);
            match evaluator.score(&outcome.transcript).await {
                Ok(evaluation) => Some(evaluation),
                Err(err) => {
                    tracing::error!(error = %err, "evaluation failed");
                    status = ScenarioStatus::Failed;
                    error.get_or_insert_with(|| ScenarioFailure::from(&err));
                    None
                }
            }
        };

        let usage_totals = outcome.transcript.usage_totals();
        ScenarioResult {
            session_id: session_id.to_string(),
            scenario_name: spec.name.clone(),
            status,
            termination_reason: Some(outcome.reason),
            transcript: outcome.transcript,
            evaluation,
            turn_count: outcome.turn_count,
            duration_seconds: timer.elapsed().as_secs_f64(),
            usage_totals,
            error,
            attempts: 1,
            started_at,
            finished_at: Utc::now(),
        }
    }
}

#[async_trait]
impl ScenarioExecutor for ScenarioRunner {
    async fn execute(&self, spec: &ScenarioSpec, cancel: &CancellationToken) -> ScenarioResult {
        let session_id = self.sessions.session_id().await;
        let span = tracing::info_span!("scenario", session_id = %session_id, scenario = %spec.name);

        let outcome = AssertUnwindSafe(self.run_scenario(spec, &session_id, cancel))
            .catch_unwind()
            .instrument(span.clone())
            .await;

        let result = match outcome {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                span.in_scope(|| tracing::error!(panic = %message, "scenario panicked"));
                ScenarioResult::failed(
                    session_id,
                    &spec.name,
                    ScenarioFailure::new(FailureKind::Internal, format!("scenario panicked: {message}")),
                )
            }
        };

        span.in_scope(|| {
            tracing::info!(
                status = ?result.status,
                score = ?result.score(),
                turns = result.turn_count,
                "scenario finished"
            )
        });
        result
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::TimeZone;

    use super::*;
    use crate::{
        conversation::FixedClock,
        evaluator::EvaluationStatus,
        providers::scripted::{ScriptedProvider, ScriptedReply},
        retry::RetryPolicy,
        transcript::Speaker,
        types::{ActorRole, CompletionRequest, CompletionResponse},
    };

    fn templates() -> PromptTemplates {
        PromptTemplates::new("Agent for {{company}}", "Client of {{company}}", "Rate the agent")
    }

    fn settings(max_turns: usize) -> RunnerSettings {
        RunnerSettings {
            engine: EngineConfig::default()
                .with_max_turns(max_turns)
                .with_retry(RetryPolicy::new(1, Duration::from_millis(5))),
            ..RunnerSettings::default()
        }
    }

    fn spec() -> ScenarioSpec {
        ScenarioSpec::new("pizza order").with_variable("company", "Pizza Co")
    }

    #[tokio::test]
    async fn completed_conversation_is_scored() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .with_replies(
                    ActorRole::Agent,
                    [
                        ScriptedReply::text("Hello!").with_usage(TokenUsage::new(10, 2)),
                        ScriptedReply::text("Anything else?").with_usage(TokenUsage::new(20, 3)),
                    ],
                )
                .with_replies(
                    ActorRole::Client,
                    [
                        ScriptedReply::text("A pizza please.").with_usage(TokenUsage::new(8, 4)),
                        ScriptedReply::text("No, that's all.").with_usage(TokenUsage::new(15, 4)),
                    ],
                )
                .with_texts(ActorRole::Evaluator, [r#"{"score": 3, "comment": "Great"}"#]),
        );
        let runner = ScenarioRunner::new(provider.clone(), templates(), settings(3))
            .with_clock(Arc::new(FixedClock(Utc.timestamp_opt(0, 0).unwrap())));

        let result = runner.execute(&spec(), &CancellationToken::new()).await;

        assert_eq!(result.status, ScenarioStatus::Completed);
        assert_eq!(result.termination_reason, Some(TerminationReason::ClientEnded));
        assert_eq!(result.turn_count, 2);
        assert_eq!(result.score(), Some(3));
        assert_eq!(result.usage_totals, TokenUsage::new(53, 13));
        assert!(uuid::Uuid::parse_str(&result.session_id).is_ok());
        assert_eq!(provider.requests()[0].messages[0].text(), Some("Agent for Pizza Co"));

        let record = result.record();
        assert_eq!(record.comment.as_deref(), Some("Great"));
        assert_eq!(record.termination_reason, Some(TerminationReason::ClientEnded));
    }

    #[tokio::test]
    async fn session_id_comes_from_the_configured_source() {
        struct FixedSessions;

        #[async_trait]
        impl SessionSource for FixedSessions {
            async fn session_id(&self) -> String {
                "call-7".to_string()
            }
        }

        let provider = Arc::new(
            ScriptedProvider::new()
                .with_texts(ActorRole::Agent, ["Hello!"])
                .with_texts(ActorRole::Client, ["Bye."])
                .with_texts(ActorRole::Evaluator, [r#"{"score": 2, "comment": "ok"}"#]),
        );
        let templates = PromptTemplates::new("Agent for {{company}} in {{session_id}}", "Client", "Rate");
        let runner = ScenarioRunner::new(provider.clone(), templates, settings(3))
            .with_session_source(Arc::new(FixedSessions));

        let result = runner.execute(&spec(), &CancellationToken::new()).await;

        assert_eq!(result.session_id, "call-7");
        assert_eq!(result.record().session_id, "call-7");
        assert_eq!(provider.requests()[0].messages[0].text(), Some("Agent for Pizza Co in call-7"));
    }

    #[test]
    fn not_started_placeholder_is_cancelled_without_error() {
        let result = ScenarioResult::not_started("later");

        assert_eq!(result.status, ScenarioStatus::Cancelled);
        assert_eq!(result.termination_reason, Some(TerminationReason::Cancelled));
        assert_eq!(result.attempts, 0);
        assert!(result.error.is_none());
        assert!(!result.is_retryable());
        assert_eq!(result.record().comment, None);
    }

    #[tokio::test]
    async fn missing_template_variable_fails_without_model_calls() {
        let provider = Arc::new(ScriptedProvider::new());
        let runner = ScenarioRunner::new(provider.clone(), templates(), settings(3));

        let result = runner.execute(&ScenarioSpec::new("no vars"), &CancellationToken::new()).await;

        assert_eq!(result.status, ScenarioStatus::Failed);
        assert_eq!(result.error.as_ref().map(|e| e.kind), Some(FailureKind::Fatal));
        assert!(!result.is_retryable());
        assert!(provider.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn engine_error_with_empty_transcript_skips_evaluation() {
        let provider = Arc::new(
            ScriptedProvider::new().with_fallback(ActorRole::Agent, ScriptedReply::transient("rate limited")),
        );
        let runner = ScenarioRunner::new(provider.clone(), templates(), settings(3));

        let result = runner.execute(&spec(), &CancellationToken::new()).await;

        assert_eq!(result.status, ScenarioStatus::Failed);
        assert_eq!(result.termination_reason, Some(TerminationReason::EngineError));
        assert!(result.evaluation.is_none());
        assert!(result.is_retryable());
        assert_eq!(provider.calls_for(ActorRole::Evaluator), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn engine_error_mid_call_still_scores_partial_transcript() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .with_texts(ActorRole::Agent, ["Hello!"])
                .with_fallback(ActorRole::Client, ScriptedReply::fatal("invalid request"))
                .with_texts(ActorRole::Evaluator, ["garbage"]),
        );
        let runner = ScenarioRunner::new(provider, templates(), settings(3));

        let result = runner.execute(&spec(), &CancellationToken::new()).await;

        assert_eq!(result.status, ScenarioStatus::Failed);
        assert_eq!(result.transcript.count(Speaker::Agent), 1);
        let evaluation = result.evaluation.as_ref().expect("partial transcript is evaluated");
        assert_eq!(evaluation.status, EvaluationStatus::Fallback);
        assert_eq!(result.error.as_ref().map(|e| e.kind), Some(FailureKind::Fatal));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_maps_to_timeout_status() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .with_fallback(ActorRole::Agent, ScriptedReply::text("Hello?").after(Duration::from_secs(3)))
                .with_fallback(ActorRole::Client, ScriptedReply::text("Hm."))
                .with_texts(ActorRole::Evaluator, [r#"{"score": 2, "comment": "slow"}"#]),
        );
        let mut settings = settings(10);
        settings.engine.timeout = Duration::from_secs(1);
        let runner = ScenarioRunner::new(provider, templates(), settings);

        let result = runner.execute(&spec(), &CancellationToken::new()).await;

        assert_eq!(result.status, ScenarioStatus::Timeout);
        assert!(!result.transcript.is_empty());
        assert_eq!(result.score(), Some(2));
    }

    #[tokio::test]
    async fn panics_are_contained() {
        struct PanickingProvider;

        #[async_trait]
        impl LLMProvider for PanickingProvider {
            async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
                panic!("provider exploded");
            }

            fn name(&self) -> &'static str {
                "panicking"
            }
        }

        let runner = ScenarioRunner::new(Arc::new(PanickingProvider), templates(), settings(3));
        let result = runner.execute(&spec(), &CancellationToken::new()).await;

        assert_eq!(result.status, ScenarioStatus::Failed);
        let error = result.error.expect("error recorded");
        assert_eq!(error.kind, FailureKind::Internal);
        assert!(error.message.contains("provider exploded"));
    }
}
