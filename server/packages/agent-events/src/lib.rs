use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

pub mod agents;

pub use agents::responses::{FunctionCall, ResponseCompletion, ResponsesDecoder};

/// Longest tool query preview surfaced to clients, in characters.
pub const QUERY_PREVIEW_CHARS: usize = 60;

/// Argument keys that carry the "query" of a tool call, in lookup order.
pub const QUERY_ARGUMENT_KEYS: [&str; 4] = ["query", "search_term", "reel_url", "url"];

/// One event of a hosted agent run, decoded once at the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    TextDelta {
        delta: String,
    },
    ToolStarted {
        call_id: String,
        tool: ToolKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        query: Option<String>,
    },
    ToolCompleted {
        call_id: String,
        tool: ToolKind,
    },
    Completed {
        finish_reason: FinishReason,
        usage: TokenUsage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
    },
    Error {
        message: String,
    },
}

impl RunEvent {
    pub fn text(delta: impl Into<String>) -> Self {
        Self::TextDelta {
            delta: delta.into(),
        }
    }

    pub fn completed() -> Self {
        Self::Completed {
            finish_reason: FinishReason::Stop,
            usage: TokenUsage::default(),
            response_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolKind {
    FileSearch,
    WebSearch,
    Function { name: String },
}

impl ToolKind {
    /// Maps a hosted output item type to a tool. Function calls need their
    /// declared name; other item types are not tools.
    pub fn from_item_type(item_type: &str, function_name: Option<&str>) -> Option<Self> {
        match item_type {
            "file_search_call" => Some(Self::FileSearch),
            "web_search_call" => Some(Self::WebSearch),
            "function_call" => function_name.map(|name| Self::Function {
                name: name.to_string(),
            }),
            _ => None,
        }
    }

    /// User-facing label.
    pub fn label(&self) -> &str {
        match self {
            Self::FileSearch => "file_search",
            Self::WebSearch => "web_search",
            Self::Function { name } => name.as_str(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    #[default]
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
    Error,
    Other,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn from_responses(usage: &Value) -> Self {
        let read = |key: &str| usage.get(key).and_then(Value::as_u64).unwrap_or(0);
        Self {
            prompt_tokens: read("input_tokens"),
            completion_tokens: read("output_tokens"),
        }
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

/// Truncates a preview to at most [`QUERY_PREVIEW_CHARS`] characters,
/// ending in `...` when shortened.
pub fn truncate_preview(text: &str) -> String {
    let text = text.trim();
    if text.chars().count() <= QUERY_PREVIEW_CHARS {
        return text.to_string();
    }
    let mut preview: String = text.chars().take(QUERY_PREVIEW_CHARS - 3).collect();
    preview.push_str("...");
    preview
}

/// Extracts a query preview from tool-call arguments, either a JSON object
/// or its serialized string form.
pub fn query_preview(arguments: &Value) -> Option<String> {
    let parsed;
    let object = match arguments {
        Value::String(raw) => {
            parsed = serde_json::from_str::<Value>(raw).ok()?;
            &parsed
        }
        other => other,
    };
    QUERY_ARGUMENT_KEYS
        .iter()
        .find_map(|key| object.get(*key).and_then(Value::as_str))
        .filter(|query| !query.trim().is_empty())
        .map(truncate_preview)
}
