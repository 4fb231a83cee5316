use std::{fmt, sync::Arc};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::{
    retry::{retry_call, RetryPolicy},
    transcript::Transcript,
    types::{ActorRole, ChatMessage, CompletionRequest, TokenUsage},
    LLMError, LLMProvider,
};

static RE_FENCED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(\{.*?\})\s*```").unwrap());

const FALLBACK_SCORE: u8 = 1;
const NO_COMMENT: &str = "no comment provided";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStatus {
    /// Response was a well-formed JSON object.
    Parsed,
    /// Usable after stripping fences or coercing field types.
    Repaired,
    /// Unusable; score and comment are the fallback values.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub score: u8,
    pub comment: String,
    pub raw_response: String,
    pub status: EvaluationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl EvaluationResult {
    fn fallback(raw: &str, reason: impl fmt::Display) -> Self {
        tracing::error!(reason = %reason, raw = raw, "invalid evaluator output");
        Self {
            score: FALLBACK_SCORE,
            comment: format!("invalid evaluator output: {reason}"),
            raw_response: raw.to_string(),
            status: EvaluationStatus::Fallback,
            usage: None,
        }
    }
}

/// Scores a finished transcript on a 1-3 scale with a single model call.
#[derive(Clone)]
pub struct Evaluator {
    provider: Arc<dyn LLMProvider>,
    model: String,
    instructions: String,
    temperature: f32,
    seed: Option<u64>,
    retry: RetryPolicy,
}

impl fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Evaluator")
            .field("provider", &self.provider.name())
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .finish()
    }
}

impl Evaluator {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            instructions: instructions.into(),
            temperature: 0.3,
            seed: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Only transport failures surface as `Err`; anything the model says is
    /// turned into an [`EvaluationResult`].
    pub async fn score(&self, transcript: &Transcript) -> Result<EvaluationResult, LLMError> {
        let messages = vec![
            ChatMessage::system(self.instructions.clone()),
            ChatMessage::user(format_transcript(transcript)),
        ];
        let request = CompletionRequest::new(self.model.clone(), messages)
            .with_actor(ActorRole::Evaluator)
            .with_temperature(self.temperature)
            .with_seed(self.seed)
            .with_response_format(json!({ "type": "json_object" }));

        let response = retry_call(
            &self.retry,
            ActorRole::Evaluator.as_str(),
            || self.provider.complete(request.clone()),
            || true,
        )
        .await?;

        let mut result = parse_evaluation(response.text());
        result.usage = response.usage;
        tracing::info!(score = result.score, status = ?result.status, "conversation evaluated");
        Ok(result)
    }
}

pub fn format_transcript(transcript: &Transcript) -> String {
    let mut out = String::from("=== CONVERSATION FOR EVALUATION ===\n\n");
    for message in transcript {
        out.push_str(&format!(
            "Turn {} - {}: {}\n\n",
            message.turn,
            message.speaker.label(),
            message.text
        ));
    }
    out.push_str("=== END OF CONVERSATION ===");
    out
}

pub fn parse_evaluation(raw: &str) -> EvaluationResult {
    let (value, mut repaired) = match serde_json::from_str::<Value>(raw.trim()) {
        Ok(value) => (value, false),
        Err(_) => match extract_object(raw) {
            Some(value) => (value, true),
            None => return EvaluationResult::fallback(raw, "response is not valid JSON"),
        },
    };

    let Some(object) = value.as_object() else {
        return EvaluationResult::fallback(raw, "response is not a JSON object");
    };

    let score = match object.get("score") {
        None => return EvaluationResult::fallback(raw, "missing field `score`"),
        Some(value) => match coerce_score(value) {
            Some((score, coerced)) => {
                repaired |= coerced;
                score
            }
            None => return EvaluationResult::fallback(raw, format!("score {value} is not one of 1, 2, 3")),
        },
    };

    let comment = match comment_field(object) {
        Some((comment, coerced)) => {
            repaired |= coerced;
            comment
        }
        None => return EvaluationResult::fallback(raw, "missing field `comment`"),
    };

    EvaluationResult {
        score,
        comment,
        raw_response: raw.to_string(),
        status: if repaired {
            EvaluationStatus::Repaired
        } else {
            EvaluationStatus::Parsed
        },
        usage: None,
    }
}

fn extract_object(raw: &str) -> Option<Value> {
    if let Some(captures) = RE_FENCED.captures(raw) {
        if let Ok(value) = serde_json::from_str(&captures[1]) {
            return Some(value);
        }
    }

    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&raw[start..=end]).ok()
}

fn coerce_score(value: &Value) -> Option<(u8, bool)> {
    let (score, coerced) = match value {
        Value::Number(number) => match number.as_i64() {
            Some(int) => (int, false),
            None => {
                let float = number.as_f64()?;
                if float.fract() != 0.0 {
                    return None;
                }
                (float as i64, true)
            }
        },
        Value::String(text) => (text.trim().parse::<i64>().ok()?, true),
        _ => return None,
    };

    match score {
        1..=3 => Some((score as u8, coerced)),
        _ => None,
    }
}

fn comment_field(object: &Map<String, Value>) -> Option<(String, bool)> {
    match object.get("comment")? {
        Value::String(text) if text.trim().is_empty() => Some((NO_COMMENT.to_string(), true)),
        Value::String(text) => Some((text.clone(), false)),
        Value::Null => Some((NO_COMMENT.to_string(), true)),
        other => Some((other.to_string(), true)),
    }
}
