use super::*;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn parse(value: Option<&str>) -> Result<Self, CoachError> {
        match value.map(str::to_ascii_lowercase).as_deref() {
            None | Some("asc") => Ok(Self::Asc),
            Some("desc") => Ok(Self::Desc),
            Some(other) => Err(CoachError::invalid_request(format!(
                "invalid order: {other} (expected asc or desc)"
            ))),
        }
    }
}

/// Thread metadata. Never carries items: the item log is the only source of
/// truth for a thread's messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ThreadMetadata {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    #[schema(value_type = Object)]
    pub metadata: Map<String, Value>,
}

impl ThreadMetadata {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: None,
            created_at: Utc::now(),
            metadata: Map::new(),
        }
    }
}

/// A thread as returned to clients: metadata plus a first page of items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct Thread {
    #[serde(flatten)]
    pub metadata: ThreadMetadata,
    pub items: Page<ThreadItem>,
}

impl From<Thread> for ThreadMetadata {
    fn from(thread: Thread) -> Self {
        thread.metadata
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[aliases(ThreadPage = Page<ThreadMetadata>, ItemPage = Page<ThreadItem>)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub has_more: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            data: Vec::new(),
            has_more: false,
            after: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    InputText { text: String },
    OutputText { text: String },
}

impl ContentPart {
    pub fn text(&self) -> &str {
        match self {
            Self::InputText { text } | Self::OutputText { text } => text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct UserMessageItem {
    pub id: String,
    pub thread_id: String,
    pub created_at: DateTime<Utc>,
    pub content: Vec<ContentPart>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct AssistantMessageItem {
    pub id: String,
    pub thread_id: String,
    pub created_at: DateTime<Utc>,
    pub content: Vec<ContentPart>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    InProgress,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ToolCallItem {
    pub id: String,
    pub thread_id: String,
    pub created_at: DateTime<Utc>,
    pub call_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    pub status: ToolCallStatus,
}

/// A tool the client executed on behalf of the agent, with its output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ClientToolCallItem {
    pub id: String,
    pub thread_id: String,
    pub created_at: DateTime<Utc>,
    pub call_id: String,
    pub name: String,
    #[schema(value_type = Object)]
    pub arguments: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub output: Option<Value>,
    pub status: ToolCallStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ThreadItem {
    UserMessage(UserMessageItem),
    AssistantMessage(AssistantMessageItem),
    ToolCall(ToolCallItem),
    ClientToolCall(ClientToolCallItem),
}

impl ThreadItem {
    pub fn id(&self) -> &str {
        match self {
            Self::UserMessage(item) => &item.id,
            Self::AssistantMessage(item) => &item.id,
            Self::ToolCall(item) => &item.id,
            Self::ClientToolCall(item) => &item.id,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Self::UserMessage(item) => item.created_at,
            Self::AssistantMessage(item) => item.created_at,
            Self::ToolCall(item) => item.created_at,
            Self::ClientToolCall(item) => item.created_at,
        }
    }

    /// Joined text of a message item; empty for tool records.
    pub fn text(&self) -> String {
        let parts = match self {
            Self::UserMessage(item) => &item.content,
            Self::AssistantMessage(item) => &item.content,
            Self::ToolCall(_) | Self::ClientToolCall(_) => return String::new(),
        };
        parts
            .iter()
            .map(ContentPart::text)
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
            .trim()
            .to_string()
    }

    pub fn user_message(thread_id: &str, text: impl Into<String>, attachments: Vec<String>) -> Self {
        Self::UserMessage(UserMessageItem {
            id: new_id("msg"),
            thread_id: thread_id.to_string(),
            created_at: Utc::now(),
            content: vec![ContentPart::InputText { text: text.into() }],
            attachments,
        })
    }

    pub fn assistant_message(thread_id: &str, text: impl Into<String>) -> Self {
        Self::AssistantMessage(AssistantMessageItem {
            id: new_id("msg"),
            thread_id: thread_id.to_string(),
            created_at: Utc::now(),
            content: vec![ContentPart::OutputText { text: text.into() }],
        })
    }
}

/// Phase 1 input: declared metadata of an upload.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct AttachmentCreate {
    pub name: String,
    #[serde(rename = "mimeType", alias = "mime_type")]
    pub mime_type: String,
}

/// Attachment metadata as exposed to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct Attachment {
    pub id: String,
    pub name: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub size: u64,
    pub upload_url: String,
}

/// An attachment whose Phase 2 upload has completed.
#[derive(Debug, Clone)]
pub struct StoredAttachment {
    pub metadata: Attachment,
    pub bytes: Bytes,
}

pub fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}
