use std::{env, path::PathBuf, str::FromStr, sync::Arc, time::Duration};

use crate::{
    conversation::{EngineConfig, TerminationPolicy},
    error::SimulationError,
    retry::RetryPolicy,
    runner::RunnerSettings,
    scheduler::SchedulerConfig,
    session::{SessionSource, UuidSessions, WebhookSessions},
};

/// Process-wide settings, read once from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationConfig {
    pub model: String,
    pub max_turns: usize,
    pub timeout: Duration,
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub scenario_retry_max: u32,
    pub prompts_dir: PathBuf,
    pub termination: TerminationPolicy,
    pub agent_temperature: f32,
    pub client_temperature: f32,
    pub evaluator_temperature: f32,
    pub webhook_url: Option<String>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        let runner = RunnerSettings::default();
        Self {
            model: runner.model,
            max_turns: runner.engine.max_turns,
            timeout: runner.engine.timeout,
            concurrency: SchedulerConfig::default().concurrency,
            retry: RetryPolicy::default(),
            scenario_retry_max: 1,
            prompts_dir: PathBuf::from("prompts"),
            termination: TerminationPolicy::default(),
            agent_temperature: runner.agent_temperature,
            client_temperature: runner.client_temperature,
            evaluator_temperature: runner.evaluator_temperature,
            webhook_url: None,
        }
    }
}

impl SimulationConfig {
    /// Loads `.env` if present, then reads the process environment.
    pub fn from_env() -> Result<Self, SimulationError> {
        if let Err(err) = dotenvy::dotenv() {
            if !err.not_found() {
                tracing::warn!(error = %err, "could not load .env file");
            }
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, SimulationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).map(|value| value.trim().to_string()).filter(|value| !value.is_empty());

        let max_turns = parse_or(&var, "MAX_TURNS", defaults.max_turns)?;
        let concurrency = parse_or(&var, "CONCURRENCY", defaults.concurrency)?;

        let retry = RetryPolicy::new(
            parse_or(&var, "RETRY_MAX", defaults.retry.max_retries)?,
            Duration::from_millis(parse_or(&var, "RETRY_BASE_MS", duration_ms(defaults.retry.base_backoff))?),
        )
        .with_max_backoff(Duration::from_millis(parse_or(
            &var,
            "RETRY_MAX_BACKOFF_MS",
            duration_ms(defaults.retry.max_backoff),
        )?));

        let mut termination = defaults.termination.clone();
        if let Some(marker) = var("AGENT_END_MARKER") {
            termination.agent_end_marker = marker;
        }
        if let Some(phrases) = var("CLIENT_END_PHRASES") {
            termination.client_end_phrases = phrases
                .split(',')
                .map(str::trim)
                .filter(|phrase| !phrase.is_empty())
                .map(String::from)
                .collect();
        }

        let config = Self {
            model: var("OPENAI_MODEL").unwrap_or(defaults.model),
            max_turns,
            timeout: Duration::from_secs(parse_or(&var, "TIMEOUT_SEC", defaults.timeout.as_secs())?),
            concurrency,
            retry,
            scenario_retry_max: parse_or(&var, "SCENARIO_RETRY_MAX", defaults.scenario_retry_max)?,
            prompts_dir: var("PROMPTS_DIR").map(PathBuf::from).unwrap_or(defaults.prompts_dir),
            termination,
            agent_temperature: parse_or(&var, "AGENT_TEMPERATURE", defaults.agent_temperature)?,
            client_temperature: parse_or(&var, "CLIENT_TEMPERATURE", defaults.client_temperature)?,
            evaluator_temperature: parse_or(&var, "EVALUATOR_TEMPERATURE", defaults.evaluator_temperature)?,
            webhook_url: var("WEBHOOK_URL"),
        };
        config.validate()?;
        Ok(config)
    }

    /// Re-run after applying overrides from outside the environment.
    pub fn validate(&self) -> Result<(), SimulationError> {
        if self.max_turns == 0 {
            return Err(SimulationError::InvalidConfig("MAX_TURNS must be at least 1".into()));
        }
        if self.concurrency == 0 {
            return Err(SimulationError::InvalidConfig("CONCURRENCY must be at least 1".into()));
        }
        Ok(())
    }

    /// Webhook-issued session ids when `WEBHOOK_URL` is set, random UUIDs otherwise.
    pub fn session_source(&self) -> Arc<dyn SessionSource> {
        match &self.webhook_url {
            Some(url) => Arc::new(WebhookSessions::new(url.clone())),
            None => Arc::new(UuidSessions),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::default()
            .with_max_turns(self.max_turns)
            .with_timeout(self.timeout)
            .with_retry(self.retry)
            .with_termination(self.termination.clone())
    }

    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            model: self.model.clone(),
            agent_temperature: self.agent_temperature,
            client_temperature: self.client_temperature,
            evaluator_temperature: self.evaluator_temperature,
            engine: self.engine_config(),
        }
    }

    /// Scenario-level retries reuse the per-call backoff curve.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::default()
            .with_concurrency(self.concurrency)
            .with_scenario_retry(
                RetryPolicy::new(self.scenario_retry_max, self.retry.base_backoff)
                    .with_max_backoff(self.retry.max_backoff),
            )
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn parse_or<T, F>(var: &F, key: &str, default: T) -> Result<T, SimulationError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|err| SimulationError::InvalidConfig(format!("{key}={raw:?}: {err}"))),
    }
}
