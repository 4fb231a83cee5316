use thiserror::Error;

#[derive(Debug, Error)]
pub enum LLMError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("provider unavailable ({status}): {message}")]
    Unavailable { status: u16, message: String },

    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("transient provider failure: {0}")]
    Transient(String),

    #[error("missing API key: set the {0} environment variable")]
    MissingApiKey(&'static str),

    #[error("invalid response from provider: {0}")]
    InvalidResponse(&'static str),

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
}

impl LLMError {
    /// Rate limits, server-side outages and network hiccups are worth another
    /// attempt; authentication and malformed requests are not.
    pub fn is_transient(&self) -> bool {
        match self {
            LLMError::Http(err) => {
                err.is_timeout()
                    || err.is_connect()
                    || err
                        .status()
                        .map_or(false, |status| status.as_u16() == 429 || status.is_server_error())
            }
            LLMError::RateLimited(_) | LLMError::Unavailable { .. } | LLMError::Transient(_) => true,
            LLMError::Serialization(_)
            | LLMError::Provider(_)
            | LLMError::Rejected { .. }
            | LLMError::MissingApiKey(_)
            | LLMError::InvalidResponse(_)
            | LLMError::Unsupported(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("template render error: {0}")]
    TemplateRender(#[from] handlebars::RenderError),
    #[error("invalid scenario: {0}")]
    InvalidScenario(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown batch: {0}")]
    UnknownBatch(String),
    #[error(transparent)]
    Provider(#[from] LLMError),
}

impl SimulationError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SimulationError::Provider(err) => err.is_transient(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_provider_errors() {
        assert!(LLMError::RateLimited("slow down".into()).is_transient());
        assert!(LLMError::Unavailable { status: 503, message: "busy".into() }.is_transient());
        assert!(!LLMError::Rejected { status: 401, message: "bad key".into() }.is_transient());
        assert!(!LLMError::MissingApiKey("OPENAI_API_KEY").is_transient());
    }

    #[test]
    fn only_transient_provider_failures_are_retryable() {
        assert!(SimulationError::from(LLMError::Transient("reset".into())).is_retryable());
        assert!(!SimulationError::from(LLMError::Provider("nope".into())).is_retryable());
        assert!(!SimulationError::InvalidScenario("empty name".into()).is_retryable());
    }
}
