use std::sync::{Arc, Mutex};
use std::time::Duration;

use cooperson_agent_events::{RunEvent, ToolKind};
use cooperson_error::CoachError;
use futures::stream::{self, StreamExt};

use super::{AgentRunRequest, AgentRunner, InputPart, RunEventStream};

/// Replays a fixed event list. Backs `server --mock-agent` and tests.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRunner {
    events: Vec<RunEvent>,
    fail_after: Option<(usize, String)>,
    delay: Option<Duration>,
    requests: Arc<Mutex<Vec<AgentRunRequest>>>,
}

impl ScriptedRunner {
    pub fn new(events: Vec<RunEvent>) -> Self {
        Self {
            events,
            ..Self::default()
        }
    }

    /// A short coaching answer that exercises a knowledge-base lookup.
    pub fn demo() -> Self {
        Self::new(vec![
            RunEvent::ToolStarted {
                call_id: "fs_demo".to_string(),
                tool: ToolKind::FileSearch,
                query: Some("ICP framework".to_string()),
            },
            RunEvent::ToolCompleted {
                call_id: "fs_demo".to_string(),
                tool: ToolKind::FileSearch,
            },
            RunEvent::text("Start with one buyer: "),
            RunEvent::text("who they are, what keeps them up at night【3:0†icp.pdf】, "),
            RunEvent::text("and where they already hang out online."),
            RunEvent::completed(),
        ])
    }

    /// Emits `count` events, then fails with `message`.
    pub fn failing_after(mut self, count: usize, message: impl Into<String>) -> Self {
        self.fail_after = Some((count, message.into()));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<AgentRunRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    /// The user's text of the most recent request.
    pub fn last_input_text(&self) -> Option<String> {
        self.requests().last().map(|request| {
            request
                .input
                .iter()
                .filter_map(|part| match part {
                    InputPart::Text(text) => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
    }
}

impl AgentRunner for ScriptedRunner {
    fn run(&self, request: AgentRunRequest) -> RunEventStream {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        let mut items: Vec<Result<RunEvent, CoachError>> = match &self.fail_after {
            Some((count, message)) => {
                let mut items: Vec<_> = self.events.iter().take(*count).cloned().map(Ok).collect();
                items.push(Err(CoachError::upstream(message.clone())));
                items
            }
            None => self.events.iter().cloned().map(Ok).collect(),
        };
        if items.is_empty() {
            items.push(Ok(RunEvent::completed()));
        }
        let delay = self.delay;
        stream::iter(items)
            .then(move |item| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                item
            })
            .boxed()
    }
}
