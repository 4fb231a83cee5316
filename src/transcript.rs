use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::TokenUsage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Agent,
    Client,
    /// Side-channel output such as tool results.
    System,
}

impl Speaker {
    pub fn label(&self) -> &'static str {
        match self {
            Speaker::Agent => "AGENT",
            Speaker::Client => "CLIENT",
            Speaker::System => "SYSTEM",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub turn: usize,
    pub speaker: Speaker,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    ClientEnded,
    MaxTurnsReached,
    TimeoutExceeded,
    AgentEndedCall,
    Cancelled,
    EngineError,
}

/// Append-only message log of one simulated call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    messages: Vec<Message>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn count(&self, speaker: Speaker) -> usize {
        self.messages.iter().filter(|m| m.speaker == speaker).count()
    }

    pub fn usage_totals(&self) -> TokenUsage {
        let mut total = TokenUsage::default();
        for usage in self.messages.iter().filter_map(|m| m.usage) {
            total += usage;
        }
        total
    }

    /// Agent and Client strictly alternate, Agent first; system lines may sit
    /// anywhere in between.
    pub fn is_well_formed(&self) -> bool {
        let mut expected = Speaker::Agent;
        for message in &self.messages {
            match message.speaker {
                Speaker::System => continue,
                speaker if speaker == expected => {
                    expected = if speaker == Speaker::Agent {
                        Speaker::Client
                    } else {
                        Speaker::Agent
                    };
                }
                _ => return false,
            }
        }
        true
    }
}

impl<'a> IntoIterator for &'a Transcript {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.iter()
    }
}
