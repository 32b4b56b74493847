use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;

use base64::Engine;
use cooperson_agent_events::RunEvent;
use cooperson_error::CoachError;
use futures::stream::{self, Stream, StreamExt};

use crate::adapter::{AdapterState, ChatEvent, StreamAdapter};
use crate::agent::{
    AgentRunRequest, AgentRunner, ConversationTurn, InputPart, Role, RunEventStream,
};
use crate::conversation_cache::ConversationCache;
use crate::store::{
    new_id, ClientToolCallItem, Session, SortOrder, StoredAttachment, ThreadItem, ThreadMetadata,
    ThreadStore, ToolCallItem, ToolCallStatus,
};

/// Earlier messages replayed when a run cannot chain onto a cached
/// response.
const HISTORY_MESSAGES: usize = 20;

const IMAGE_TYPES: [&str; 4] = ["image/png", "image/jpeg", "image/gif", "image/webp"];
const TEXT_TYPES: [&str; 3] = ["text/plain", "text/markdown", "text/csv"];

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub session: String,
    pub thread_id: Option<String>,
    pub text: String,
    pub attachment_ids: Vec<String>,
}

/// What a chat turn produces, in order. Wire encoders pick what they need.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatOutput {
    Started {
        thread: ThreadMetadata,
        created: bool,
        user_item: ThreadItem,
        assistant_item_id: String,
    },
    Event(ChatEvent),
    ThreadUpdated(ThreadMetadata),
    ItemsSaved(Vec<ThreadItem>),
}

pub type ChatStream = Pin<Box<dyn Stream<Item = ChatOutput> + Send>>;

#[derive(Debug, Clone)]
pub struct ChatService {
    store: Arc<ThreadStore>,
    runner: Arc<dyn AgentRunner>,
    conversations: Arc<ConversationCache>,
}

impl ChatService {
    pub fn new(
        store: Arc<ThreadStore>,
        runner: Arc<dyn AgentRunner>,
        conversations: Arc<ConversationCache>,
    ) -> Self {
        Self {
            store,
            runner,
            conversations,
        }
    }

    pub fn store(&self) -> &Arc<ThreadStore> {
        &self.store
    }

    pub fn conversations(&self) -> &Arc<ConversationCache> {
        &self.conversations
    }

    /// Starts one chat turn. Everything that can fail before the first byte
    /// is streamed (configuration, attachments, input validation) fails
    /// here; later failures become an in-band error event.
    pub async fn respond(&self, request: ChatRequest) -> Result<ChatStream, CoachError> {
        let text = request.text.trim().to_string();
        if text.is_empty() && request.attachment_ids.is_empty() {
            return Err(CoachError::invalid_request("message text is empty"));
        }
        self.runner.check_ready()?;

        let session = self.store.get_or_create_session(&request.session).await;

        // Input is resolved before the thread exists so a rejected request
        // leaves no empty thread behind.
        let mut input = Vec::new();
        if !text.is_empty() {
            input.push(InputPart::Text(text.clone()));
        }
        for attachment_id in &request.attachment_ids {
            let stored = session.load_attachment(attachment_id).await?;
            input.push(attachment_input(&stored)?);
        }

        let existed = match request.thread_id.as_deref() {
            Some(id) => session.load_thread(id).await.is_ok(),
            None => false,
        };
        let thread = session
            .get_or_create_thread(request.thread_id.as_deref())
            .await;

        let previous_response_id = self.conversations.get(session.key(), &thread.id).await;
        let history = match previous_response_id {
            Some(_) => Vec::new(),
            None => recent_history(&session, &thread.id).await?,
        };

        let user_item =
            ThreadItem::user_message(&thread.id, text.clone(), request.attachment_ids.clone());
        session.append_item(&thread.id, user_item.clone()).await;
        tracing::info!(
            session = %session.key(),
            thread_id = %thread.id,
            attachments = request.attachment_ids.len(),
            chained = previous_response_id.is_some(),
            "chat turn started"
        );

        let upstream = self.runner.run(AgentRunRequest {
            session: session.key().to_string(),
            thread_id: thread.id.clone(),
            history,
            input,
            previous_response_id,
        });

        let assistant_item_id = new_id("msg");
        let mut adapter = StreamAdapter::new();
        let mut queue = VecDeque::new();
        queue.push_back(ChatOutput::Started {
            thread: thread.clone(),
            created: !existed,
            user_item,
            assistant_item_id: assistant_item_id.clone(),
        });
        queue.extend(adapter.begin().into_iter().map(ChatOutput::Event));

        let run = ChatRun {
            session,
            conversations: self.conversations.clone(),
            thread_id: thread.id,
            user_text: text,
            assistant_item_id,
            adapter,
            upstream,
            queue,
            title_checked: thread.title.is_some(),
            finished: false,
        };
        Ok(stream::unfold(run, |mut run| async move {
            let output = run.next_output().await?;
            Some((output, run))
        })
        .boxed())
    }

    /// Records the output of a client-executed tool on the pending call.
    pub async fn record_client_tool_output(
        &self,
        session_key: &str,
        thread_id: &str,
        output: serde_json::Value,
    ) -> Result<ThreadItem, CoachError> {
        let session = self.store.get_or_create_session(session_key).await;
        let items = session
            .list_items(thread_id, crate::store::MAX_PAGE_LIMIT, None, SortOrder::Desc)
            .await?;
        let pending = items.data.into_iter().find_map(|item| match item {
            ThreadItem::ClientToolCall(call) if call.status == ToolCallStatus::InProgress => {
                Some(call)
            }
            _ => None,
        });
        let Some(call) = pending else {
            return Err(CoachError::invalid_request(format!(
                "thread {thread_id} has no pending client tool call"
            )));
        };
        let completed = ThreadItem::ClientToolCall(ClientToolCallItem {
            output: Some(output),
            status: ToolCallStatus::Completed,
            ..call
        });
        session.upsert_item(thread_id, completed.clone()).await;
        Ok(completed)
    }
}

struct ChatRun {
    session: Arc<Session>,
    conversations: Arc<ConversationCache>,
    thread_id: String,
    user_text: String,
    assistant_item_id: String,
    adapter: StreamAdapter,
    upstream: RunEventStream,
    queue: VecDeque<ChatOutput>,
    title_checked: bool,
    finished: bool,
}

impl ChatRun {
    async fn next_output(&mut self) -> Option<ChatOutput> {
        loop {
            if let Some(output) = self.queue.pop_front() {
                return Some(output);
            }
            if self.finished {
                return None;
            }
            let events = match self.upstream.next().await {
                Some(Ok(RunEvent::Error { message })) => {
                    tracing::error!(
                        session = %self.session.key(),
                        thread_id = %self.thread_id,
                        error = %message,
                        "agent run reported an error"
                    );
                    self.adapter.push(RunEvent::Error { message })
                }
                Some(Ok(event)) => {
                    tracing::debug!(thread_id = %self.thread_id, event = ?event, "upstream event");
                    self.adapter.push(event)
                }
                Some(Err(err)) => {
                    tracing::error!(
                        session = %self.session.key(),
                        thread_id = %self.thread_id,
                        error = %err,
                        "agent run failed"
                    );
                    self.adapter.fail(err.to_string())
                }
                None => self.adapter.finish(),
            };
            for event in events {
                self.absorb(event).await;
            }
        }
    }

    async fn absorb(&mut self, event: ChatEvent) {
        tracing::debug!(thread_id = %self.thread_id, event = ?event, "client event");
        match event {
            ChatEvent::TextDelta { .. } => {
                self.queue.push_back(ChatOutput::Event(event));
                if !self.title_checked {
                    self.title_checked = true;
                    self.generate_title().await;
                }
            }
            ChatEvent::Done => {
                if self.adapter.state() == AdapterState::Completed {
                    let saved = self.persist().await;
                    self.queue.push_back(ChatOutput::ItemsSaved(saved));
                }
                self.queue.push_back(ChatOutput::Event(ChatEvent::Done));
                self.finished = true;
            }
            other => self.queue.push_back(ChatOutput::Event(other)),
        }
    }

    async fn generate_title(&mut self) {
        match self
            .session
            .set_title_if_missing(&self.thread_id, &self.user_text)
            .await
        {
            Ok(true) => {
                if let Ok(thread) = self.session.load_thread(&self.thread_id).await {
                    tracing::debug!(thread_id = %self.thread_id, title = ?thread.title, "thread titled");
                    self.queue.push_back(ChatOutput::ThreadUpdated(thread));
                }
            }
            Ok(false) => {}
            // The thread may be deleted mid-stream; the reply still finishes.
            Err(err) => tracing::debug!(error = %err, "skipping title"),
        }
    }

    async fn persist(&mut self) -> Vec<ThreadItem> {
        let mut saved = Vec::new();
        for observed in self.adapter.tool_calls() {
            saved.push(ThreadItem::ToolCall(ToolCallItem {
                id: new_id("tc"),
                thread_id: self.thread_id.clone(),
                created_at: chrono::Utc::now(),
                call_id: observed.call_id.clone(),
                name: observed.tool.label().to_string(),
                query: observed.query.clone(),
                status: if observed.completed {
                    ToolCallStatus::Completed
                } else {
                    ToolCallStatus::InProgress
                },
            }));
        }
        let transcript = self.adapter.transcript().trim();
        if !transcript.is_empty() {
            let mut message = ThreadItem::assistant_message(&self.thread_id, transcript);
            if let ThreadItem::AssistantMessage(item) = &mut message {
                item.id = self.assistant_item_id.clone();
            }
            saved.push(message);
        }
        for item in &saved {
            self.session.append_item(&self.thread_id, item.clone()).await;
        }
        if let Some(response_id) = self.adapter.response_id() {
            self.conversations
                .insert(self.session.key(), &self.thread_id, response_id)
                .await;
        }
        tracing::info!(
            session = %self.session.key(),
            thread_id = %self.thread_id,
            items = saved.len(),
            "chat turn completed"
        );
        saved
    }
}

async fn recent_history(
    session: &Session,
    thread_id: &str,
) -> Result<Vec<ConversationTurn>, CoachError> {
    let page = session
        .list_items(thread_id, HISTORY_MESSAGES, None, SortOrder::Desc)
        .await?;
    let mut turns: Vec<ConversationTurn> = page
        .data
        .iter()
        .filter_map(|item| {
            let role = match item {
                ThreadItem::UserMessage(_) => Role::User,
                ThreadItem::AssistantMessage(_) => Role::Assistant,
                _ => return None,
            };
            let text = item.text();
            (!text.is_empty()).then_some(ConversationTurn { role, text })
        })
        .collect();
    turns.reverse();
    Ok(turns)
}

/// Maps an uploaded attachment to model input by MIME type.
pub fn attachment_input(stored: &StoredAttachment) -> Result<InputPart, CoachError> {
    let mime = stored
        .metadata
        .mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    let data_url = || {
        format!(
            "data:{mime};base64,{}",
            base64::engine::general_purpose::STANDARD.encode(&stored.bytes)
        )
    };
    if IMAGE_TYPES.contains(&mime.as_str()) {
        return Ok(InputPart::Image {
            data_url: data_url(),
        });
    }
    if mime == "application/pdf" {
        return Ok(InputPart::File {
            filename: stored.metadata.name.clone(),
            data_url: data_url(),
        });
    }
    if TEXT_TYPES.contains(&mime.as_str()) {
        let body = String::from_utf8_lossy(&stored.bytes);
        return Ok(InputPart::Text(format!(
            "Attached file {}:\n{}",
            stored.metadata.name, body
        )));
    }
    Err(CoachError::UnsupportedMediaType {
        mime_type: stored.metadata.mime_type.clone(),
    })
}
