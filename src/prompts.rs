use std::{fs, path::Path};

use handlebars::{no_escape, Handlebars};
use serde_json::{Map, Value};

use crate::error::SimulationError;

const DEFAULT_AGENT: &str = "You are a customer service agent for {{company}}. \
Greet the client, help with their request and say END_CALL when the call is over.";
const DEFAULT_CLIENT: &str = "You are a client calling {{company}}. Stay in character and \
say goodbye when your request is resolved.";
const DEFAULT_EVALUATOR: &str = "You are an expert evaluator of customer service conversations. \
Rate the agent from 1 (poor) to 3 (excellent) and respond with JSON: \
{\"score\": <1|2|3>, \"comment\": \"<explanation>\"}";

/// System prompt templates for the three actors, rendered with handlebars in
/// strict mode so a missing variable is an error rather than an empty string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplates {
    pub agent: String,
    pub client: String,
    pub evaluator: String,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self {
            agent: DEFAULT_AGENT.to_string(),
            client: DEFAULT_CLIENT.to_string(),
            evaluator: DEFAULT_EVALUATOR.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPrompts {
    pub agent: String,
    pub client: String,
    pub evaluator: String,
}

impl PromptTemplates {
    pub fn new(agent: impl Into<String>, client: impl Into<String>, evaluator: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            client: client.into(),
            evaluator: evaluator.into(),
        }
    }

    /// Loads `agent_system.hbs`, `client_system.hbs` and
    /// `evaluator_system.hbs`; any file that is absent keeps its default.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self, SimulationError> {
        let dir = dir.as_ref();
        let mut templates = Self::default();

        for (file, slot) in [
            ("agent_system.hbs", &mut templates.agent),
            ("client_system.hbs", &mut templates.client),
            ("evaluator_system.hbs", &mut templates.evaluator),
        ] {
            let path = dir.join(file);
            if path.is_file() {
                *slot = fs::read_to_string(&path)?;
            } else {
                tracing::warn!(path = %path.display(), "prompt template not found, using default");
            }
        }

        Ok(templates)
    }

    pub fn render(&self, variables: &Map<String, Value>, session_id: &str) -> Result<RenderedPrompts, SimulationError> {
        let mut hb = Handlebars::new();
        hb.set_strict_mode(true);
        hb.register_escape_fn(no_escape);

        let mut data = variables.clone();
        data.insert("session_id".to_string(), Value::String(session_id.to_string()));
        let data = Value::Object(data);

        Ok(RenderedPrompts {
            agent: hb.render_template(&self.agent, &data)?,
            client: hb.render_template(&self.client, &data)?,
            evaluator: hb.render_template(&self.evaluator, &data)?,
        })
    }
}
