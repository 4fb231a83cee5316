use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SimulationError;

/// One named, parameterized conversation to simulate and score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioSpec {
    pub name: String,
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl ScenarioSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            variables: Map::new(),
            seed: None,
        }
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Explicit seed first, then a `SEED` variable holding an integer or an
    /// integer string.
    pub fn effective_seed(&self) -> Option<u64> {
        self.seed.or_else(|| match self.variables.get("SEED")? {
            Value::Number(number) => number.as_u64(),
            Value::String(text) => text.trim().parse().ok(),
            _ => None,
        })
    }

    pub fn validate(&self) -> Result<(), SimulationError> {
        if self.name.trim().is_empty() {
            return Err(SimulationError::InvalidScenario("scenario name is empty".into()));
        }

        for (key, value) in &self.variables {
            if key.trim().is_empty() {
                return Err(SimulationError::InvalidScenario(format!(
                    "scenario '{}' has an empty variable name",
                    self.name
                )));
            }
            if matches!(value, Value::Null) {
                return Err(SimulationError::InvalidScenario(format!(
                    "variable '{key}' of scenario '{}' is null",
                    self.name
                )));
            }
        }

        Ok(())
    }
}

/// Reads an ordered list of scenarios from a `.json`, `.yaml` or `.yml` file.
pub fn load_scenarios(path: impl AsRef<Path>) -> Result<Vec<ScenarioSpec>, SimulationError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)?;
    let is_yaml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map_or(false, |ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));

    if is_yaml {
        Ok(serde_yaml::from_str(&content)?)
    } else {
        Ok(serde_json::from_str(&content)?)
    }
}
