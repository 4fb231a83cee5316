use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    providers::LLMProvider,
    types::{ActorRole, ChatMessage, CompletionRequest, CompletionResponse, TokenUsage},
    LLMError,
};

#[derive(Debug, Clone)]
enum Outcome {
    Text(String),
    Transient(String),
    Fatal(String),
}

/// One canned answer, optionally delayed to simulate a slow model.
#[derive(Debug, Clone)]
pub struct ScriptedReply {
    outcome: Outcome,
    delay: Option<Duration>,
    usage: Option<TokenUsage>,
}

impl ScriptedReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Text(text.into()),
            delay: None,
            usage: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Transient(message.into()),
            delay: None,
            usage: None,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Fatal(message.into()),
            delay: None,
            usage: None,
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Deterministic provider that replays per-actor queues in call order.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    queues: Mutex<HashMap<ActorRole, VecDeque<ScriptedReply>>>,
    fallbacks: HashMap<ActorRole, ScriptedReply>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_replies<I>(self, actor: ActorRole, replies: I) -> Self
    where
        I: IntoIterator<Item = ScriptedReply>,
    {
        if let Ok(mut queues) = self.queues.lock() {
            queues.entry(actor).or_default().extend(replies);
        }
        self
    }

    pub fn with_texts<I, S>(self, actor: ActorRole, texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with_replies(actor, texts.into_iter().map(ScriptedReply::text))
    }

    /// Reply used once the actor's queue is exhausted.
    pub fn with_fallback(mut self, actor: ActorRole, reply: ScriptedReply) -> Self {
        self.fallbacks.insert(actor, reply);
        self
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn calls_for(&self, actor: ActorRole) -> usize {
        self.requests()
            .iter()
            .filter(|request| request.actor == Some(actor))
            .count()
    }

    fn next_reply(&self, actor: ActorRole) -> Option<ScriptedReply> {
        let queued = self
            .queues
            .lock()
            .ok()
            .and_then(|mut queues| queues.get_mut(&actor).and_then(VecDeque::pop_front));

        queued.or_else(|| self.fallbacks.get(&actor).cloned())
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        let actor = request.actor.unwrap_or(ActorRole::Agent);
        if let Ok(mut log) = self.requests.lock() {
            log.push(request);
        }

        let reply = self
            .next_reply(actor)
            .ok_or_else(|| LLMError::Provider(format!("no more scripted responses for {}", actor.as_str())))?;

        if let Some(delay) = reply.delay {
            tokio::time::sleep(delay).await;
        }

        match reply.outcome {
            Outcome::Text(text) => Ok(CompletionResponse {
                message: ChatMessage::assistant(text),
                usage: reply.usage,
            }),
            Outcome::Transient(message) => Err(LLMError::Transient(message)),
            Outcome::Fatal(message) => Err(LLMError::Provider(message)),
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(actor: ActorRole) -> CompletionRequest {
        CompletionRequest::new("scripted", vec![ChatMessage::user("hi")]).with_actor(actor)
    }

    #[tokio::test]
    async fn replays_queues_per_actor() {
        let provider = ScriptedProvider::new()
            .with_texts(ActorRole::Agent, ["hello", "anything else?"])
            .with_texts(ActorRole::Client, ["hi there"]);

        let first = provider.complete(request(ActorRole::Agent)).await.expect("agent reply");
        let client = provider.complete(request(ActorRole::Client)).await.expect("client reply");
        let second = provider.complete(request(ActorRole::Agent)).await.expect("agent reply");

        assert_eq!(first.text(), "hello");
        assert_eq!(client.text(), "hi there");
        assert_eq!(second.text(), "anything else?");
        assert_eq!(provider.calls_for(ActorRole::Agent), 2);
    }

    #[tokio::test]
    async fn exhausted_queue_uses_fallback_or_errors() {
        let provider = ScriptedProvider::new()
            .with_fallback(ActorRole::Client, ScriptedReply::text("mhm"));

        let reply = provider.complete(request(ActorRole::Client)).await.expect("fallback");
        assert_eq!(reply.text(), "mhm");

        let err = provider.complete(request(ActorRole::Agent)).await.unwrap_err();
        assert!(matches!(err, LLMError::Provider(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn scripted_failures_keep_their_class() {
        let provider = ScriptedProvider::new().with_replies(
            ActorRole::Agent,
            [ScriptedReply::transient("429"), ScriptedReply::fatal("401")],
        );

        assert!(provider.complete(request(ActorRole::Agent)).await.unwrap_err().is_transient());
        assert!(!provider.complete(request(ActorRole::Agent)).await.unwrap_err().is_transient());
    }
}
