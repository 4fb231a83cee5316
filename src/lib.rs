pub mod actors;
pub mod batch;
pub mod config;
pub mod conversation;
pub mod error;
pub mod evaluator;
pub mod prompts;
pub mod providers;
pub mod retry;
pub mod runner;
pub mod scenario;
pub mod scheduler;
pub mod session;
pub mod telemetry;
pub mod transcript;
pub mod types;

pub use actors::{Actor, ActorReply, ModelActor, TurnContext};
pub use batch::{Batch, BatchRegistry, BatchSnapshot, BatchStatus, BatchSummary, ScoreDistribution};
pub use config::SimulationConfig;
pub use conversation::{
    Clock, ConversationEngine, ConversationOutcome, EngineConfig, FixedClock, SystemClock, TerminationPolicy,
};
pub use error::{LLMError, SimulationError};
pub use evaluator::{EvaluationResult, EvaluationStatus, Evaluator};
pub use prompts::{PromptTemplates, RenderedPrompts};
pub use providers::{
    openai::{OpenAI, OpenAIConfig},
    scripted::{ScriptedProvider, ScriptedReply},
    LLMProvider,
};
pub use retry::RetryPolicy;
pub use runner::{
    FailureKind, ResultRecord, RunnerSettings, ScenarioExecutor, ScenarioFailure, ScenarioResult, ScenarioRunner,
    ScenarioStatus,
};
pub use scenario::{load_scenarios, ScenarioSpec};
pub use scheduler::{BatchEvent, BatchScheduler, SchedulerConfig};
pub use session::{SessionSource, UuidSessions, WebhookSessions};
pub use transcript::{Message, Speaker, TerminationReason, Transcript};
pub use types::{ActorRole, ChatMessage, CompletionRequest, CompletionResponse, MessageRole, TokenUsage};
