//! Turns a hosted run's [`RunEvent`]s into client-facing [`ChatEvent`]s.
//!
//! One adapter serves one request and moves forward only:
//! `Idle -> ToolActive* -> Emitting -> Completed | Errored`. Text is
//! sanitized on the way out: citation markers are stripped and tool-call
//! JSON that leaks into the text channel is swallowed.

use std::collections::BTreeMap;

use cooperson_agent_events::{FinishReason, RunEvent, TokenUsage, ToolKind};
use serde::{Deserialize, Serialize};

use crate::citations::{split_pending_marker, strip_citations};

/// Argument keys whose presence marks a `{...}` text fragment as tool-call
/// JSON rather than prose.
pub const TOOL_ARGUMENT_MARKERS: [&str; 4] =
    ["\"reel_url\":", "\"query\":", "\"url\":", "\"search_term\":"];

/// A `{`-prefixed buffer longer than this without closing is treated as
/// prose and flushed.
pub const TOOL_JSON_THRESHOLD: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    TextDelta {
        delta: String,
    },
    Thinking,
    ToolStarted {
        call_id: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        query: Option<String>,
    },
    ToolCompleted {
        call_id: String,
        name: String,
    },
    Finish {
        finish_reason: FinishReason,
        usage: TokenUsage,
    },
    Error {
        message: String,
    },
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Idle,
    ToolActive,
    Emitting,
    Completed,
    Errored,
}

/// A tool invocation observed during the run, kept for the thread log.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolObservation {
    pub call_id: String,
    pub tool: ToolKind,
    pub query: Option<String>,
    pub completed: bool,
}

#[derive(Debug)]
pub struct StreamAdapter {
    state: AdapterState,
    active_tools: BTreeMap<String, ToolKind>,
    buffer: String,
    pending_marker: String,
    transcript: String,
    tools: Vec<ToolObservation>,
    response_id: Option<String>,
}

impl Default for StreamAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamAdapter {
    pub fn new() -> Self {
        Self {
            state: AdapterState::Idle,
            active_tools: BTreeMap::new(),
            buffer: String::new(),
            pending_marker: String::new(),
            transcript: String::new(),
            tools: Vec::new(),
            response_id: None,
        }
    }

    pub fn state(&self) -> AdapterState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, AdapterState::Completed | AdapterState::Errored)
    }

    /// Sanitized text emitted so far.
    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    pub fn tool_calls(&self) -> &[ToolObservation] {
        &self.tools
    }

    pub fn response_id(&self) -> Option<&str> {
        self.response_id.as_deref()
    }

    /// Opening pseudo-event shown while the run warms up.
    pub fn begin(&mut self) -> Vec<ChatEvent> {
        if self.state != AdapterState::Idle || !self.transcript.is_empty() {
            return Vec::new();
        }
        vec![ChatEvent::Thinking]
    }

    pub fn push(&mut self, event: RunEvent) -> Vec<ChatEvent> {
        if self.is_terminal() {
            return Vec::new();
        }
        let mut out = Vec::new();
        match event {
            RunEvent::ToolStarted {
                call_id,
                tool,
                query,
            } => {
                if !self.active_tools.contains_key(&call_id) {
                    out.push(ChatEvent::ToolStarted {
                        call_id: call_id.clone(),
                        name: tool.label().to_string(),
                        query: query.clone(),
                    });
                    self.tools.push(ToolObservation {
                        call_id: call_id.clone(),
                        tool: tool.clone(),
                        query,
                        completed: false,
                    });
                    self.active_tools.insert(call_id, tool);
                }
                self.state = AdapterState::ToolActive;
            }
            RunEvent::ToolCompleted { call_id, .. } => {
                if let Some(tool) = self.active_tools.remove(&call_id) {
                    self.mark_completed(&call_id);
                    out.push(ChatEvent::ToolCompleted {
                        call_id,
                        name: tool.label().to_string(),
                    });
                }
                if self.active_tools.is_empty() && self.state == AdapterState::ToolActive {
                    self.state = if self.transcript.is_empty() {
                        AdapterState::Idle
                    } else {
                        AdapterState::Emitting
                    };
                }
            }
            RunEvent::TextDelta { delta } => {
                self.buffer.push_str(&delta);
                self.drain_buffer(&mut out);
            }
            RunEvent::Completed {
                finish_reason,
                usage,
                response_id,
            } => {
                if response_id.is_some() {
                    self.response_id = response_id;
                }
                self.complete(finish_reason, usage, &mut out);
            }
            RunEvent::Error { message } => {
                out.extend(self.fail(message));
            }
        }
        out
    }

    /// Upstream ran dry without a completion event.
    pub fn finish(&mut self) -> Vec<ChatEvent> {
        let mut out = Vec::new();
        if !self.is_terminal() {
            self.complete(FinishReason::Stop, TokenUsage::default(), &mut out);
        }
        out
    }

    /// Terminates the stream with a single error event and the done marker.
    pub fn fail(&mut self, message: impl Into<String>) -> Vec<ChatEvent> {
        if self.is_terminal() {
            return Vec::new();
        }
        self.state = AdapterState::Errored;
        self.buffer.clear();
        self.pending_marker.clear();
        vec![
            ChatEvent::Error {
                message: message.into(),
            },
            ChatEvent::Done,
        ]
    }

    fn complete(&mut self, finish_reason: FinishReason, usage: TokenUsage, out: &mut Vec<ChatEvent>) {
        // Anything still buffered at the end is either swallowed tool JSON or
        // prose that never reached the threshold.
        let rest = std::mem::take(&mut self.buffer);
        if !rest.is_empty() && !looks_like_tool_json(&rest) {
            self.emit_text(&rest, out);
        }
        let pending = std::mem::take(&mut self.pending_marker);
        if !pending.is_empty() {
            self.emit_sanitized(&pending, out);
        }
        self.end_active_tools(out);
        out.push(ChatEvent::Finish {
            finish_reason,
            usage,
        });
        out.push(ChatEvent::Done);
        self.state = AdapterState::Completed;
    }

    fn drain_buffer(&mut self, out: &mut Vec<ChatEvent>) {
        loop {
            if self.buffer.is_empty() {
                return;
            }
            let leading = self.buffer.len() - self.buffer.trim_start().len();
            if !self.buffer[leading..].starts_with('{') {
                if self.buffer[leading..].is_empty() {
                    // Whitespace only: wait to see what follows.
                    return;
                }
                let text = std::mem::take(&mut self.buffer);
                self.emit_text(&text, out);
                return;
            }

            match object_end(&self.buffer[leading..]) {
                Some(end) => {
                    let end = leading + end;
                    let object = &self.buffer[..end];
                    if looks_like_tool_json(object) {
                        tracing::debug!(fragment = %object.trim(), "dropped tool-call json from text");
                        self.buffer.drain(..end);
                        continue;
                    }
                    let text = std::mem::take(&mut self.buffer);
                    self.emit_text(&text, out);
                    return;
                }
                None if self.buffer.len() > TOOL_JSON_THRESHOLD => {
                    let text = std::mem::take(&mut self.buffer);
                    self.emit_text(&text, out);
                    return;
                }
                None => return,
            }
        }
    }

    fn emit_text(&mut self, text: &str, out: &mut Vec<ChatEvent>) {
        // Text arriving means the tool phase is over, with or without
        // explicit end events.
        self.end_active_tools(out);
        let mut combined = std::mem::take(&mut self.pending_marker);
        combined.push_str(text);
        let (ready, pending) = split_pending_marker(&combined);
        self.pending_marker = pending.to_string();
        let ready = ready.to_string();
        self.emit_sanitized(&ready, out);
    }

    fn emit_sanitized(&mut self, text: &str, out: &mut Vec<ChatEvent>) {
        let clean = strip_citations(text);
        if clean.is_empty() {
            return;
        }
        self.transcript.push_str(&clean);
        self.state = AdapterState::Emitting;
        out.push(ChatEvent::TextDelta {
            delta: clean.into_owned(),
        });
    }

    fn end_active_tools(&mut self, out: &mut Vec<ChatEvent>) {
        let active = std::mem::take(&mut self.active_tools);
        for (call_id, tool) in active {
            self.mark_completed(&call_id);
            out.push(ChatEvent::ToolCompleted {
                call_id,
                name: tool.label().to_string(),
            });
        }
    }

    fn mark_completed(&mut self, call_id: &str) {
        if let Some(observed) = self.tools.iter_mut().find(|tool| tool.call_id == call_id) {
            observed.completed = true;
        }
    }
}

fn looks_like_tool_json(text: &str) -> bool {
    text.trim_start().starts_with('{') && TOOL_ARGUMENT_MARKERS.iter().any(|key| text.contains(key))
}

/// Byte offset just past the `}` closing the object that opens `text`.
fn object_end(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (index, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(index + ch.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_of(events: &[ChatEvent]) -> String {
        events
            .iter()
            .filter_map(|event| match event {
                ChatEvent::TextDelta { delta } => Some(delta.as_str()),
                _ => None,
            })
            .collect()
    }

    fn run(adapter: &mut StreamAdapter, events: Vec<RunEvent>) -> Vec<ChatEvent> {
        let mut out = adapter.begin();
        for event in events {
            out.extend(adapter.push(event));
        }
        out.extend(adapter.finish());
        out
    }

    #[test]
    fn swallows_tool_json_split_across_deltas() {
        let mut adapter = StreamAdapter::new();
        let out = run(
            &mut adapter,
            vec![
                RunEvent::text("{\"query\""),
                RunEvent::text(": \"hooks\"}"),
                RunEvent::text("Here are three hooks."),
            ],
        );
        let text = text_of(&out);
        assert_eq!(text, "Here are three hooks.");
        assert!(!text.contains("query"));
    }

    #[test]
    fn keeps_prose_sharing_a_delta_with_tool_json() {
        let mut adapter = StreamAdapter::new();
        let out = run(
            &mut adapter,
            vec![RunEvent::text("{\"reel_url\":\"https://ig.me/r/1\"} Transcript ready.")],
        );
        assert_eq!(text_of(&out), " Transcript ready.");
    }

    #[test]
    fn flushes_unclosed_brace_past_threshold() {
        let mut adapter = StreamAdapter::new();
        let long = format!("{{ not json {}", "word ".repeat(30));
        let out = run(&mut adapter, vec![RunEvent::text(long.clone())]);
        assert_eq!(text_of(&out), long);
    }

    #[test]
    fn closed_braces_without_tool_keys_are_prose() {
        let mut adapter = StreamAdapter::new();
        let out = run(&mut adapter, vec![RunEvent::text("{name} is the placeholder")]);
        assert_eq!(text_of(&out), "{name} is the placeholder");
    }

    #[test]
    fn strips_citations_split_across_deltas() {
        let mut adapter = StreamAdapter::new();
        let out = run(
            &mut adapter,
            vec![
                RunEvent::text("Lead with pain【4:"),
                RunEvent::text("0†icp.pdf】 every time."),
            ],
        );
        assert_eq!(text_of(&out), "Lead with pain every time.");
        assert_eq!(adapter.transcript(), "Lead with pain every time.");
    }

    #[test]
    fn text_closes_active_tools() {
        let mut adapter = StreamAdapter::new();
        let started = adapter.push(RunEvent::ToolStarted {
            call_id: "fs_1".to_string(),
            tool: ToolKind::FileSearch,
            query: Some("icp".to_string()),
        });
        assert_eq!(adapter.state(), AdapterState::ToolActive);
        assert_eq!(
            started,
            vec![ChatEvent::ToolStarted {
                call_id: "fs_1".to_string(),
                name: "file_search".to_string(),
                query: Some("icp".to_string()),
            }]
        );
        let out = adapter.push(RunEvent::text("Your ICP is..."));
        assert_eq!(
            out,
            vec![
                ChatEvent::ToolCompleted {
                    call_id: "fs_1".to_string(),
                    name: "file_search".to_string(),
                },
                ChatEvent::TextDelta {
                    delta: "Your ICP is...".to_string(),
                },
            ]
        );
        assert_eq!(adapter.state(), AdapterState::Emitting);
        // A late end event for an already closed tool is ignored.
        assert!(adapter
            .push(RunEvent::ToolCompleted {
                call_id: "fs_1".to_string(),
                tool: ToolKind::FileSearch,
            })
            .is_empty());
        assert!(adapter.tool_calls()[0].completed);
    }

    #[test]
    fn completion_ends_with_exactly_one_finish_and_done() {
        let mut adapter = StreamAdapter::new();
        let mut out = run(
            &mut adapter,
            vec![
                RunEvent::text("Hi"),
                RunEvent::Completed {
                    finish_reason: FinishReason::Stop,
                    usage: TokenUsage {
                        prompt_tokens: 3,
                        completion_tokens: 1,
                    },
                    response_id: Some("resp_1".to_string()),
                },
            ],
        );
        out.extend(adapter.push(RunEvent::text("late")));
        assert_eq!(out.first(), Some(&ChatEvent::Thinking));
        let finishes = out
            .iter()
            .filter(|event| matches!(event, ChatEvent::Finish { .. }))
            .count();
        assert_eq!(finishes, 1);
        assert_eq!(out.last(), Some(&ChatEvent::Done));
        assert_eq!(adapter.state(), AdapterState::Completed);
        assert_eq!(adapter.response_id(), Some("resp_1"));
        assert_eq!(adapter.transcript(), "Hi");
    }

    #[test]
    fn upstream_error_is_single_terminal_event() {
        let mut adapter = StreamAdapter::new();
        adapter.push(RunEvent::text("partial "));
        let out = adapter.push(RunEvent::Error {
            message: "rate \"limited\"".to_string(),
        });
        assert_eq!(
            out,
            vec![
                ChatEvent::Error {
                    message: "rate \"limited\"".to_string()
                },
                ChatEvent::Done
            ]
        );
        assert!(adapter.finish().is_empty());
        assert!(adapter.fail("again").is_empty());
        assert_eq!(adapter.state(), AdapterState::Errored);
    }

    #[test]
    fn object_end_ignores_braces_in_strings() {
        assert_eq!(object_end(r#"{"q":"a}b"} tail"#), Some(11));
        assert_eq!(object_end(r#"{"q":{"n":1}}"#), Some(13));
        assert_eq!(object_end(r#"{"q":"open"#), None);
    }
}
