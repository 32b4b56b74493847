//! Request/response protocol of the ChatKit web widget.
//!
//! Requests are `{"type": "...", "params": {...}}`. Message-producing
//! requests answer with a stream of [`ChatKitEvent`]s sent as SSE `data:`
//! lines; everything else answers with a JSON document.

use cooperson_error::CoachError;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::adapter::ChatEvent;
use crate::chat::{ChatOutput, ChatRequest, ChatService};
use crate::store::{
    AttachmentCreate, Page, SortOrder, Thread, ThreadItem, ThreadMetadata, DEFAULT_PAGE_LIMIT,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "params")]
pub enum ChatKitRequest {
    #[serde(rename = "threads.create")]
    CreateThread { input: UserInput },
    #[serde(rename = "threads.add_user_message")]
    AddUserMessage { thread_id: String, input: UserInput },
    #[serde(rename = "threads.add_client_tool_output")]
    AddClientToolOutput { thread_id: String, result: Value },
    #[serde(rename = "threads.get_by_id")]
    GetThread { thread_id: String },
    #[serde(rename = "threads.list")]
    ListThreads(ListParams),
    #[serde(rename = "items.list")]
    ListItems {
        thread_id: String,
        #[serde(flatten)]
        page: ListParams,
    },
    #[serde(rename = "threads.update")]
    UpdateThread { thread_id: String, title: String },
    #[serde(rename = "threads.delete")]
    DeleteThread { thread_id: String },
    #[serde(rename = "attachments.create")]
    CreateAttachment(AttachmentCreate),
    #[serde(rename = "attachments.delete")]
    DeleteAttachment { attachment_id: String },
    #[serde(rename = "items.feedback")]
    ItemFeedback {
        thread_id: String,
        item_ids: Vec<String>,
        kind: String,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub after: Option<String>,
    #[serde(default)]
    pub order: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserInput {
    #[serde(default)]
    pub content: Vec<InputContent>,
    #[serde(default)]
    pub attachments: Vec<String>,
}

impl UserInput {
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                InputContent::InputText { text } => Some(text.as_str()),
                InputContent::Other => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputContent {
    InputText { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ChatKitEvent {
    #[serde(rename = "thread.created")]
    ThreadCreated { thread: Thread },
    #[serde(rename = "thread.updated")]
    ThreadUpdated { thread: ThreadMetadata },
    #[serde(rename = "thread.item.added")]
    ItemAdded { item: ThreadItem },
    #[serde(rename = "thread.item.updated")]
    ItemUpdated { item_id: String, update: ItemUpdate },
    #[serde(rename = "thread.item.done")]
    ItemDone { item: ThreadItem },
    #[serde(rename = "progress_update")]
    ProgressUpdate { icon: String, text: String },
    #[serde(rename = "error")]
    Error {
        code: String,
        message: String,
        allow_retry: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ItemUpdate {
    #[serde(rename = "assistant_message.content_part.text_delta")]
    TextDelta { content_index: usize, delta: String },
}

pub enum ChatKitResponse {
    Stream(BoxStream<'static, ChatKitEvent>),
    Json(Value),
}

impl std::fmt::Debug for ChatKitResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stream(_) => f.write_str("ChatKitResponse::Stream"),
            Self::Json(value) => f.debug_tuple("ChatKitResponse::Json").field(value).finish(),
        }
    }
}

pub async fn handle(
    chat: &ChatService,
    session_key: &str,
    request: ChatKitRequest,
) -> Result<ChatKitResponse, CoachError> {
    let session = chat.store().get_or_create_session(session_key).await;
    tracing::debug!(session = %session.key(), request = ?request, "chatkit request");
    match request {
        ChatKitRequest::CreateThread { input } => respond(chat, session_key, None, input).await,
        ChatKitRequest::AddUserMessage { thread_id, input } => {
            session.load_thread(&thread_id).await?;
            respond(chat, session_key, Some(thread_id), input).await
        }
        ChatKitRequest::AddClientToolOutput { thread_id, result } => {
            let item = chat
                .record_client_tool_output(session_key, &thread_id, result)
                .await?;
            Ok(ChatKitResponse::Stream(
                stream::iter([ChatKitEvent::ItemDone { item }]).boxed(),
            ))
        }
        ChatKitRequest::GetThread { thread_id } => {
            let metadata = session.load_thread(&thread_id).await?;
            let items = session
                .list_items(&thread_id, DEFAULT_PAGE_LIMIT, None, SortOrder::Asc)
                .await?;
            to_json(&Thread { metadata, items })
        }
        ChatKitRequest::ListThreads(params) => {
            // The widget's history panel lists newest first.
            let order = match params.order.as_deref() {
                None => SortOrder::Desc,
                order => SortOrder::parse(order)?,
            };
            let page = session
                .list_threads(
                    params.limit.unwrap_or(DEFAULT_PAGE_LIMIT),
                    params.after.as_deref(),
                    order,
                )
                .await;
            to_json(&page)
        }
        ChatKitRequest::ListItems { thread_id, page } => {
            let order = SortOrder::parse(page.order.as_deref())?;
            let items: Page<ThreadItem> = session
                .list_items(
                    &thread_id,
                    page.limit.unwrap_or(DEFAULT_PAGE_LIMIT),
                    page.after.as_deref(),
                    order,
                )
                .await?;
            to_json(&items)
        }
        ChatKitRequest::UpdateThread { thread_id, title } => {
            let title = title.trim();
            if title.is_empty() {
                return Err(CoachError::invalid_request("thread title is empty"));
            }
            let mut thread = session.load_thread(&thread_id).await?;
            thread.title = Some(title.to_string());
            session.save_thread(thread.clone()).await;
            to_json(&thread)
        }
        ChatKitRequest::DeleteThread { thread_id } => {
            session.delete_thread(&thread_id).await;
            chat.conversations().remove(session.key(), &thread_id).await;
            Ok(ChatKitResponse::Json(json!({})))
        }
        ChatKitRequest::CreateAttachment(create) => {
            let attachment = session.create_attachment(create).await?;
            to_json(&attachment)
        }
        ChatKitRequest::DeleteAttachment { attachment_id } => {
            session.delete_attachment(&attachment_id).await;
            Ok(ChatKitResponse::Json(json!({})))
        }
        ChatKitRequest::ItemFeedback {
            thread_id,
            item_ids,
            kind,
        } => {
            tracing::info!(session = %session.key(), thread_id = %thread_id, ?item_ids, kind = %kind, "item feedback");
            Ok(ChatKitResponse::Json(json!({})))
        }
    }
}

async fn respond(
    chat: &ChatService,
    session_key: &str,
    thread_id: Option<String>,
    input: UserInput,
) -> Result<ChatKitResponse, CoachError> {
    let outputs = chat
        .respond(ChatRequest {
            session: session_key.to_string(),
            thread_id,
            text: input.text(),
            attachment_ids: input.attachments,
        })
        .await?;
    let mut encoder = ChatKitEncoder::default();
    let events = outputs
        .flat_map(move |output| stream::iter(encoder.encode(output)))
        .boxed();
    Ok(ChatKitResponse::Stream(events))
}

fn to_json<T: Serialize>(value: &T) -> Result<ChatKitResponse, CoachError> {
    serde_json::to_value(value)
        .map(ChatKitResponse::Json)
        .map_err(|err| CoachError::invalid_request(format!("failed to encode response: {err}")))
}

/// Maps chat turn output onto widget events. The assistant item is announced
/// on its first text delta and finalized once persisted.
#[derive(Debug, Default)]
pub struct ChatKitEncoder {
    thread_id: String,
    assistant_item_id: String,
    announced: bool,
}

impl ChatKitEncoder {
    pub fn encode(&mut self, output: ChatOutput) -> Vec<ChatKitEvent> {
        match output {
            ChatOutput::Started {
                thread,
                created,
                user_item,
                assistant_item_id,
            } => {
                self.thread_id = thread.id.clone();
                self.assistant_item_id = assistant_item_id;
                let mut events = Vec::with_capacity(2);
                if created {
                    events.push(ChatKitEvent::ThreadCreated {
                        thread: Thread {
                            metadata: thread,
                            items: Page::empty(),
                        },
                    });
                }
                events.push(ChatKitEvent::ItemDone { item: user_item });
                events
            }
            ChatOutput::Event(ChatEvent::Thinking) => vec![ChatKitEvent::ProgressUpdate {
                icon: "sparkle".to_string(),
                text: "Thinking".to_string(),
            }],
            ChatOutput::Event(ChatEvent::ToolStarted { name, query, .. }) => {
                let (icon, label) = match name.as_str() {
                    "file_search" => ("book-open", "Searching the knowledge base".to_string()),
                    "web_search" => ("globe", "Searching the web".to_string()),
                    "transcribe_reel" => ("video", "Transcribing the reel".to_string()),
                    other => ("bolt", format!("Running {other}")),
                };
                let text = match query {
                    Some(query) => format!("{label}: {query}"),
                    None => label,
                };
                vec![ChatKitEvent::ProgressUpdate {
                    icon: icon.to_string(),
                    text,
                }]
            }
            ChatOutput::Event(ChatEvent::TextDelta { delta }) => {
                let mut events = Vec::with_capacity(2);
                if !self.announced {
                    self.announced = true;
                    let mut item = ThreadItem::assistant_message(&self.thread_id, "");
                    if let ThreadItem::AssistantMessage(message) = &mut item {
                        message.id = self.assistant_item_id.clone();
                    }
                    events.push(ChatKitEvent::ItemAdded { item });
                }
                events.push(ChatKitEvent::ItemUpdated {
                    item_id: self.assistant_item_id.clone(),
                    update: ItemUpdate::TextDelta {
                        content_index: 0,
                        delta,
                    },
                });
                events
            }
            ChatOutput::Event(ChatEvent::Error { message }) => vec![ChatKitEvent::Error {
                code: "stream.error".to_string(),
                message,
                allow_retry: true,
            }],
            ChatOutput::Event(_) => Vec::new(),
            ChatOutput::ThreadUpdated(thread) => vec![ChatKitEvent::ThreadUpdated { thread }],
            ChatOutput::ItemsSaved(items) => items
                .into_iter()
                .map(|item| ChatKitEvent::ItemDone { item })
                .collect(),
        }
    }
}
