//! Line protocol spoken by the AI SDK `useChat` client: one event per line,
//! prefixed by a single type character.
//!
//! | prefix | payload |
//! |---|---|
//! | `0:` | text delta, JSON string |
//! | `9:` | tool start/end, JSON object |
//! | `e:` | finish metadata, JSON object |
//! | `3:` | error, JSON string |
//! | `d` | done marker |

use cooperson_agent_events::{FinishReason, TokenUsage};
use serde::Serialize;

use crate::adapter::ChatEvent;

pub const CONTENT_TYPE: &str = "text/plain; charset=utf-8";

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ToolLine<'a> {
    ToolStart {
        name: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        query: Option<&'a str>,
    },
    ToolEnd {
        name: &'a str,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FinishLine {
    finish_reason: FinishReason,
    usage: TokenUsage,
}

/// Encodes one event as a newline-terminated line. Events with no
/// representation in this protocol yield `None`.
pub fn encode(event: &ChatEvent) -> Option<String> {
    let line = match event {
        ChatEvent::TextDelta { delta } => format!("0:{}", serde_json::to_string(delta).ok()?),
        ChatEvent::ToolStarted { name, query, .. } => {
            let payload = ToolLine::ToolStart {
                name,
                query: query.as_deref(),
            };
            format!("9:{}", serde_json::to_string(&payload).ok()?)
        }
        ChatEvent::ToolCompleted { name, .. } => {
            let payload = ToolLine::ToolEnd { name };
            format!("9:{}", serde_json::to_string(&payload).ok()?)
        }
        ChatEvent::Finish {
            finish_reason,
            usage,
        } => {
            let payload = FinishLine {
                finish_reason: *finish_reason,
                usage: *usage,
            };
            format!("e:{}", serde_json::to_string(&payload).ok()?)
        }
        ChatEvent::Error { message } => format!("3:{}", serde_json::to_string(message).ok()?),
        ChatEvent::Done => "d".to_string(),
        ChatEvent::Thinking => return None,
    };
    Some(line + "\n")
}
