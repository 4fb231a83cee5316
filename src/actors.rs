use std::{fmt, sync::Arc};

use async_trait::async_trait;

use crate::{
    transcript::{Speaker, Transcript},
    types::{ActorRole, ChatMessage, CompletionRequest, TokenUsage},
    LLMError, LLMProvider,
};

pub const AGENT_KICKOFF: &str = "Start the conversation with the client.";

/// Per-turn data handed to an actor by the engine.
#[derive(Debug, Clone, Copy)]
pub struct TurnContext {
    pub turn: usize,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct ActorReply {
    pub text: String,
    pub usage: Option<TokenUsage>,
    /// Appended to the transcript as system lines right after `text`.
    pub side_channel: Vec<String>,
}

impl ActorReply {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

/// One conversational party. The engine only sees this capability and is
/// agnostic to how the reply is produced.
#[async_trait]
pub trait Actor: Send + Sync {
    fn role(&self) -> ActorRole;

    async fn respond(&self, transcript: &Transcript, context: TurnContext) -> Result<ActorReply, LLMError>;
}

/// Actor backed by a language model with a rendered system prompt.
#[derive(Clone)]
pub struct ModelActor {
    role: ActorRole,
    instructions: String,
    kickoff: Option<String>,
    provider: Arc<dyn LLMProvider>,
    model: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

impl fmt::Debug for ModelActor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelActor")
            .field("role", &self.role)
            .field("provider", &self.provider.name())
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl ModelActor {
    pub fn new(
        role: ActorRole,
        instructions: impl Into<String>,
        provider: Arc<dyn LLMProvider>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            role,
            instructions: instructions.into(),
            kickoff: None,
            provider,
            model: model.into(),
            temperature: None,
            max_tokens: None,
        }
    }

    /// Agent that opens the call after a fixed kickoff instruction.
    pub fn agent(instructions: impl Into<String>, provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self::new(ActorRole::Agent, instructions, provider, model).with_kickoff(AGENT_KICKOFF)
    }

    pub fn client(instructions: impl Into<String>, provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self::new(ActorRole::Client, instructions, provider, model)
    }

    pub fn with_kickoff(mut self, kickoff: impl Into<String>) -> Self {
        self.kickoff = Some(kickoff.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn instructions(&self) -> &str {
        &self.instructions
    }

    fn own_speaker(&self) -> Speaker {
        match self.role {
            ActorRole::Client => Speaker::Client,
            ActorRole::Agent | ActorRole::Evaluator => Speaker::Agent,
        }
    }

    /// The transcript as this actor sees it: its own lines are `assistant`,
    /// the other party's are `user`.
    pub fn history(&self, transcript: &Transcript) -> Vec<ChatMessage> {
        let own = self.own_speaker();
        let mut messages = Vec::with_capacity(transcript.len() + 2);
        messages.push(ChatMessage::system(self.instructions.clone()));
        if let Some(kickoff) = &self.kickoff {
            messages.push(ChatMessage::user(kickoff.clone()));
        }

        for message in transcript {
            let chat = match message.speaker {
                Speaker::System => ChatMessage::system(message.text.clone()),
                speaker if speaker == own => ChatMessage::assistant(message.text.clone()),
                _ => ChatMessage::user(message.text.clone()),
            };
            messages.push(chat);
        }

        messages
    }
}

#[async_trait]
impl Actor for ModelActor {
    fn role(&self) -> ActorRole {
        self.role
    }

    async fn respond(&self, transcript: &Transcript, context: TurnContext) -> Result<ActorReply, LLMError> {
        let mut request = CompletionRequest::new(self.model.clone(), self.history(transcript))
            .with_actor(self.role)
            .with_seed(context.seed);

        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }

        if let Some(max_tokens) = self.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }

        let response = self.provider.complete(request).await?;
        if let Some(usage) = response.usage {
            tracing::debug!(
                actor = self.role.as_str(),
                turn = context.turn,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "token usage"
            );
        }

        Ok(ActorReply {
            text: response.text().to_string(),
            usage: response.usage,
            side_channel: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use super::*;
    use crate::{
        providers::scripted::ScriptedProvider,
        transcript::Message,
        types::MessageRole,
    };

    fn transcript(lines: &[(Speaker, &str)]) -> Transcript {
        let mut transcript = Transcript::new();
        for (speaker, text) in lines {
            transcript.push(Message {
                turn: 1,
                speaker: *speaker,
                text: text.to_string(),
                timestamp: DateTime::<Utc>::UNIX_EPOCH,
                usage: None,
            });
        }
        transcript
    }

    #[test]
    fn relabels_history_from_each_perspective() {
        let provider: Arc<dyn LLMProvider> = Arc::new(ScriptedProvider::new());
        let agent = ModelActor::agent("You sell pizza.", Arc::clone(&provider), "model");
        let client = ModelActor::client("You are hungry.", provider, "model");
        let transcript = transcript(&[
            (Speaker::Agent, "Hello, pizza place!"),
            (Speaker::System, "menu: 3 items"),
            (Speaker::Client, "One margherita."),
        ]);

        let agent_view = agent.history(&transcript);
        let roles: Vec<_> = agent_view.iter().map(|m| m.role.clone()).collect();
        assert_eq!(
            roles,
            vec![
                MessageRole::System,
                MessageRole::User,
                MessageRole::Assistant,
                MessageRole::System,
                MessageRole::User,
            ]
        );
        assert_eq!(agent_view[1].text(), Some(AGENT_KICKOFF));

        let client_view = client.history(&transcript);
        assert_eq!(client_view.len(), 4);
        assert_eq!(client_view[0].text(), Some("You are hungry."));
        assert_eq!(client_view[1].role, MessageRole::User);
        assert_eq!(client_view[3].role, MessageRole::Assistant);
    }

    #[tokio::test]
    async fn tags_requests_with_role_and_seed() {
        let provider = Arc::new(ScriptedProvider::new().with_texts(ActorRole::Client, ["hi"]));
        let client = ModelActor::client("You are hungry.", provider.clone(), "model").with_temperature(0.7);

        let reply = client
            .respond(&Transcript::new(), TurnContext { turn: 1, seed: Some(42) })
            .await
            .expect("reply");

        assert_eq!(reply.text, "hi");
        let requests = provider.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].actor, Some(ActorRole::Client));
        assert_eq!(requests[0].seed, Some(42));
        assert_eq!(requests[0].temperature, Some(0.7));
    }
}
