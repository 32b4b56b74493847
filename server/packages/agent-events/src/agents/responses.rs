use std::collections::HashMap;

use serde_json::Value;

use crate::{query_preview, FinishReason, RunEvent, TokenUsage, ToolKind};

/// A function tool call the hosted run expects the caller to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionCall {
    pub call_id: String,
    pub name: String,
    pub arguments: String,
}

/// Terminal state of one hosted response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseCompletion {
    pub response_id: Option<String>,
    pub finish_reason: FinishReason,
    pub usage: TokenUsage,
}

/// Stateful decoder for the hosted Responses streaming events of a single
/// response. Completion is not emitted as an event because a response that
/// ends in function calls is followed by another one; the runner decides
/// when the run as a whole completes.
#[derive(Debug, Default)]
pub struct ResponsesDecoder {
    response_id: Option<String>,
    hosted_calls: HashMap<String, (String, ToolKind)>,
    function_calls: Vec<FunctionCall>,
    completion: Option<ResponseCompletion>,
}

impl ResponsesDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn response_id(&self) -> Option<&str> {
        self.response_id.as_deref()
    }

    pub fn take_function_calls(&mut self) -> Vec<FunctionCall> {
        std::mem::take(&mut self.function_calls)
    }

    pub fn take_completion(&mut self) -> Option<ResponseCompletion> {
        self.completion.take()
    }

    pub fn decode(&mut self, event: &Value) -> Vec<RunEvent> {
        let mut events = Vec::new();
        match event.get("type").and_then(Value::as_str) {
            Some("response.created") | Some("response.in_progress") => {
                if let Some(id) = response_field(event, "id") {
                    self.response_id = Some(id.to_string());
                }
            }
            Some("response.output_text.delta") => {
                if let Some(delta) = event.get("delta").and_then(Value::as_str) {
                    if !delta.is_empty() {
                        events.push(RunEvent::text(delta));
                    }
                }
            }
            Some("response.output_item.added") => {
                if let Some(item) = event.get("item") {
                    events.extend(self.item_added(item));
                }
            }
            Some("response.output_item.done") => {
                if let Some(item) = event.get("item") {
                    events.extend(self.item_done(item));
                }
            }
            Some("response.completed") => {
                self.complete(event, FinishReason::Stop);
            }
            Some("response.incomplete") => {
                let reason = event
                    .get("response")
                    .and_then(|response| response.get("incomplete_details"))
                    .and_then(|details| details.get("reason"))
                    .and_then(Value::as_str);
                let finish_reason = match reason {
                    Some("max_output_tokens") => FinishReason::Length,
                    Some("content_filter") => FinishReason::ContentFilter,
                    _ => FinishReason::Other,
                };
                self.complete(event, finish_reason);
            }
            Some("response.failed") => {
                let message = event
                    .get("response")
                    .and_then(|response| response.get("error"))
                    .and_then(|error| error.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("response failed")
                    .to_string();
                events.push(RunEvent::Error { message });
            }
            Some("error") => {
                let message = event
                    .get("message")
                    .or_else(|| event.get("error").and_then(|error| error.get("message")))
                    .and_then(Value::as_str)
                    .unwrap_or("upstream error")
                    .to_string();
                events.push(RunEvent::Error { message });
            }
            _ => {}
        }
        events
    }

    fn item_added(&mut self, item: &Value) -> Option<RunEvent> {
        let item_type = item.get("type").and_then(Value::as_str)?;
        // Function calls are announced once their arguments are complete.
        if item_type == "function_call" {
            return None;
        }
        let tool = ToolKind::from_item_type(item_type, None)?;
        let item_id = item.get("id").and_then(Value::as_str)?.to_string();
        self.hosted_calls
            .insert(item_id.clone(), (item_id.clone(), tool.clone()));
        Some(RunEvent::ToolStarted {
            call_id: item_id,
            tool,
            query: hosted_query(item),
        })
    }

    fn item_done(&mut self, item: &Value) -> Option<RunEvent> {
        let item_type = item.get("type").and_then(Value::as_str)?;
        if item_type == "function_call" {
            let name = item.get("name").and_then(Value::as_str)?;
            let call_id = item
                .get("call_id")
                .or_else(|| item.get("id"))
                .and_then(Value::as_str)?
                .to_string();
            let arguments = item
                .get("arguments")
                .and_then(Value::as_str)
                .unwrap_or("{}")
                .to_string();
            let query = query_preview(&Value::String(arguments.clone()));
            self.function_calls.push(FunctionCall {
                call_id: call_id.clone(),
                name: name.to_string(),
                arguments,
            });
            return Some(RunEvent::ToolStarted {
                call_id,
                tool: ToolKind::Function {
                    name: name.to_string(),
                },
                query,
            });
        }

        let item_id = item.get("id").and_then(Value::as_str)?;
        let (call_id, tool) = match self.hosted_calls.remove(item_id) {
            Some(entry) => entry,
            None => (
                item_id.to_string(),
                ToolKind::from_item_type(item_type, None)?,
            ),
        };
        Some(RunEvent::ToolCompleted { call_id, tool })
    }

    fn complete(&mut self, event: &Value, finish_reason: FinishReason) {
        if let Some(id) = response_field(event, "id") {
            self.response_id = Some(id.to_string());
        }
        let usage = event
            .get("response")
            .and_then(|response| response.get("usage"))
            .map(TokenUsage::from_responses)
            .unwrap_or_default();
        self.completion = Some(ResponseCompletion {
            response_id: self.response_id.clone(),
            finish_reason,
            usage,
        });
    }
}

fn response_field<'a>(event: &'a Value, key: &str) -> Option<&'a str> {
    event
        .get("response")
        .and_then(|response| response.get(key))
        .and_then(Value::as_str)
}

fn hosted_query(item: &Value) -> Option<String> {
    if let Some(query) = item
        .get("action")
        .and_then(|action| action.get("query"))
        .and_then(Value::as_str)
    {
        return Some(crate::truncate_preview(query));
    }
    item.get("queries")
        .and_then(Value::as_array)
        .and_then(|queries| queries.first())
        .and_then(Value::as_str)
        .map(crate::truncate_preview)
}
