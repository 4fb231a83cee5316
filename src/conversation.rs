use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    actors::{Actor, ActorReply, TurnContext},
    retry::{retry_call, RetryPolicy},
    transcript::{Message, Speaker, TerminationReason, Transcript},
    LLMError,
};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Always reports the same instant; makes transcripts reproducible.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Case-insensitive substring matching of end-of-call signals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationPolicy {
    pub agent_end_marker: String,
    pub client_end_phrases: Vec<String>,
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self {
            agent_end_marker: "end_call".to_string(),
            client_end_phrases: ["goodbye", "bye", "that's all", "thank you", "no more questions"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl TerminationPolicy {
    pub fn new<I, S>(agent_end_marker: impl Into<String>, client_end_phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            agent_end_marker: agent_end_marker.into(),
            client_end_phrases: client_end_phrases.into_iter().map(Into::into).collect(),
        }
    }

    pub fn agent_ended(&self, text: &str) -> bool {
        let marker = self.agent_end_marker.trim().to_lowercase();
        !marker.is_empty() && text.to_lowercase().contains(&marker)
    }

    pub fn client_ended(&self, text: &str) -> bool {
        let text = text.to_lowercase();
        self.client_end_phrases
            .iter()
            .map(|phrase| phrase.trim().to_lowercase())
            .any(|phrase| !phrase.is_empty() && text.contains(&phrase))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub max_turns: usize,
    pub timeout: Duration,
    pub seed: Option<u64>,
    pub retry: RetryPolicy,
    pub termination: TerminationPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_turns: 30,
            timeout: Duration::from_secs(90),
            seed: None,
            retry: RetryPolicy::default(),
            termination: TerminationPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
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

    pub fn with_termination(mut self, termination: TerminationPolicy) -> Self {
        self.termination = termination;
        self
    }
}

#[derive(Debug)]
pub struct ConversationOutcome {
    pub transcript: Transcript,
    pub reason: TerminationReason,
    /// Rounds in which the Agent spoke.
    pub turn_count: usize,
    /// Set only when `reason` is [`TerminationReason::EngineError`].
    pub error: Option<LLMError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnState {
    AgentTurn,
    ClientTurn,
}

/// Drives one Agent/Client dialogue to a single termination reason.
pub struct ConversationEngine {
    agent: Arc<dyn Actor>,
    client: Arc<dyn Actor>,
    clock: Arc<dyn Clock>,
}

impl ConversationEngine {
    pub fn new(agent: Arc<dyn Actor>, client: Arc<dyn Actor>) -> Self {
        Self {
            agent,
            client,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub async fn run(&self, config: &EngineConfig, cancel: &CancellationToken) -> ConversationOutcome {
        let started = Instant::now();
        let mut transcript = Transcript::new();
        let mut turn = 0usize;
        let mut state = TurnState::AgentTurn;

        loop {
            if let Some(reason) = interruption(cancel, started, config.timeout) {
                return finish(transcript, reason, turn, None);
            }

            if state == TurnState::AgentTurn {
                if turn >= config.max_turns {
                    return finish(transcript, TerminationReason::MaxTurnsReached, turn, None);
                }
                turn += 1;
            }

            let (actor, speaker) = match state {
                TurnState::AgentTurn => (&self.agent, Speaker::Agent),
                TurnState::ClientTurn => (&self.client, Speaker::Client),
            };

            let context = TurnContext { turn, seed: config.seed };
            let reply = retry_call(
                &config.retry,
                actor.role().as_str(),
                || actor.respond(&transcript, context),
                || interruption(cancel, started, config.timeout).is_none(),
            )
            .await;

            let reply = match reply {
                Ok(reply) => reply,
                Err(err) => {
                    if let Some(reason) = interruption(cancel, started, config.timeout) {
                        return finish(transcript, reason, turn, None);
                    }
                    tracing::error!(turn, speaker = speaker.label(), error = %err, "model call failed");
                    return finish(transcript, TerminationReason::EngineError, turn, Some(err));
                }
            };

            let text = reply.text.clone();
            self.append(&mut transcript, turn, speaker, reply);

            match state {
                TurnState::AgentTurn => {
                    if config.termination.agent_ended(&text) {
                        return finish(transcript, TerminationReason::AgentEndedCall, turn, None);
                    }
                    state = TurnState::ClientTurn;
                }
                TurnState::ClientTurn => {
                    if config.termination.client_ended(&text) {
                        return finish(transcript, TerminationReason::ClientEnded, turn, None);
                    }
                    if turn >= config.max_turns {
                        return finish(transcript, TerminationReason::MaxTurnsReached, turn, None);
                    }
                    state = TurnState::AgentTurn;
                }
            }
        }
    }

    fn append(&self, transcript: &mut Transcript, turn: usize, speaker: Speaker, reply: ActorReply) {
        tracing::debug!(turn, speaker = speaker.label(), content = %reply.text, "conversation turn");
        transcript.push(Message {
            turn,
            speaker,
            text: reply.text,
            timestamp: self.clock.now(),
            usage: reply.usage,
        });

        for note in reply.side_channel {
            transcript.push(Message {
                turn,
                speaker: Speaker::System,
                text: note,
                timestamp: self.clock.now(),
                usage: None,
            });
        }
    }
}

fn interruption(cancel: &CancellationToken, started: Instant, timeout: Duration) -> Option<TerminationReason> {
    if cancel.is_cancelled() {
        Some(TerminationReason::Cancelled)
    } else if started.elapsed() > timeout {
        Some(TerminationReason::TimeoutExceeded)
    } else {
        None
    }
}

fn finish(
    transcript: Transcript,
    reason: TerminationReason,
    turn_count: usize,
    error: Option<LLMError>,
) -> ConversationOutcome {
    tracing::info!(
        turns = turn_count,
        messages = transcript.len(),
        reason = ?reason,
        "conversation finished"
    );
    ConversationOutcome {
        transcript,
        reason,
        turn_count,
        error,
    }
}
