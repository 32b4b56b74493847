//! The hosted agent behind the chat endpoints.
//!
//! Routing is a single agent with every configured tool; there is no fast
//! or full-capability split.

use std::fmt;
use std::pin::Pin;

use cooperson_agent_events::RunEvent;
use cooperson_error::CoachError;
use futures::Stream;
use serde::{Deserialize, Serialize};

mod responses;
mod scripted;
mod sse;
mod tools;

pub use responses::{ResponsesRunner, MAX_TOOL_ROUNDS};
pub use scripted::ScriptedRunner;
pub use sse::SseAccumulator;
pub use tools::{ToolExecutor, REEL_TOOL, TAVILY_SEARCH_URL, WEB_SEARCH_TOOL};

pub type RunEventStream = Pin<Box<dyn Stream<Item = Result<RunEvent, CoachError>> + Send>>;

pub trait AgentRunner: Send + Sync + fmt::Debug {
    /// Fails when the runner cannot start at all, before anything is
    /// streamed to the client.
    fn check_ready(&self) -> Result<(), CoachError> {
        Ok(())
    }

    /// Dropping the returned stream abandons the upstream run.
    fn run(&self, request: AgentRunRequest) -> RunEventStream;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
}

/// One piece of the user's message as sent to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputPart {
    Text(String),
    Image { data_url: String },
    File { filename: String, data_url: String },
}

#[derive(Debug, Clone, Default)]
pub struct AgentRunRequest {
    pub session: String,
    pub thread_id: String,
    /// Earlier turns, sent only when the run cannot chain onto a previous
    /// hosted response.
    pub history: Vec<ConversationTurn>,
    pub input: Vec<InputPart>,
    pub previous_response_id: Option<String>,
}
