//! Session-partitioned, in-memory conversation state.
//!
//! Nothing here is persisted. A [`Session`] lives for the lifetime of the
//! process once referenced. Every multi-step mutation happens under one lock
//! acquisition with no await in between, so a read-modify-write on a thread's
//! item log is never interleaved with another. Concurrent requests against
//! the same thread still race at the request level (last write wins).

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use chrono::{DateTime, Utc};
use cooperson_error::CoachError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock};
use url::Url;
use utoipa::ToSchema;
use uuid::Uuid;

mod types;

pub use types::*;

pub const DEFAULT_SESSION_KEY: &str = "default";
pub const TITLE_MAX_CHARS: usize = 60;
pub const DEFAULT_PAGE_LIMIT: usize = 20;
pub const MAX_PAGE_LIMIT: usize = 100;

/// Derives a thread title from the first user message.
pub fn generate_title(message: &str) -> String {
    let trimmed = message.trim();
    if trimmed.chars().count() <= TITLE_MAX_CHARS {
        return trimmed.to_string();
    }
    let mut title: String = trimmed.chars().take(TITLE_MAX_CHARS).collect();
    title.push_str("...");
    title
}

#[derive(Debug)]
pub struct ThreadStore {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    upload_base: Url,
}

impl ThreadStore {
    /// `upload_base` is the public base URL that Phase 2 upload URLs are
    /// built from.
    pub fn new(upload_base: Url) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            upload_base,
        }
    }

    pub async fn get_or_create_session(&self, key: &str) -> Arc<Session> {
        let key = if key.trim().is_empty() {
            DEFAULT_SESSION_KEY
        } else {
            key
        };
        if let Some(session) = self.sessions.read().await.get(key) {
            return session.clone();
        }
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(key.to_string())
            .or_insert_with(|| {
                tracing::debug!(session = key, "session created");
                Arc::new(Session::new(key.to_string(), self.upload_base.clone()))
            })
            .clone()
    }
}

#[cfg(test)]
impl ThreadStore {
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[derive(Debug)]
pub struct Session {
    key: String,
    upload_base: Url,
    state: Mutex<SessionState>,
}

#[derive(Debug, Default)]
struct SessionState {
    threads: HashMap<String, ThreadState>,
    attachments: HashMap<String, AttachmentRecord>,
    next_seq: u64,
}

#[derive(Debug)]
struct ThreadState {
    metadata: ThreadMetadata,
    seq: u64,
    items: Vec<ThreadItem>,
}

#[derive(Debug)]
struct AttachmentRecord {
    metadata: Attachment,
    bytes: Option<Bytes>,
}

impl SessionState {
    fn insert_thread(&mut self, metadata: ThreadMetadata) -> &mut ThreadState {
        let seq = self.next_seq;
        self.next_seq += 1;
        let id = metadata.id.clone();
        self.threads.entry(id).or_insert(ThreadState {
            metadata,
            seq,
            items: Vec::new(),
        })
    }

    fn thread_mut(&mut self, thread_id: &str) -> &mut ThreadState {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.threads
            .entry(thread_id.to_string())
            .or_insert_with(|| ThreadState {
                metadata: ThreadMetadata::new(thread_id),
                seq,
                items: Vec::new(),
            })
    }
}

impl Session {
    fn new(key: String, upload_base: Url) -> Self {
        Self {
            key,
            upload_base,
            state: Mutex::new(SessionState::default()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn load_thread(&self, thread_id: &str) -> Result<ThreadMetadata, CoachError> {
        let state = self.state.lock().await;
        state
            .threads
            .get(thread_id)
            .map(|thread| thread.metadata.clone())
            .ok_or_else(|| thread_not_found(thread_id))
    }

    /// Returns the thread with `thread_id`, creating it when absent. A
    /// missing id creates a thread with a fresh id.
    pub async fn get_or_create_thread(&self, thread_id: Option<&str>) -> ThreadMetadata {
        let id = match thread_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => id.to_string(),
            None => new_id("thr"),
        };
        let mut state = self.state.lock().await;
        if let Some(thread) = state.threads.get(&id) {
            return thread.metadata.clone();
        }
        tracing::debug!(session = %self.key, thread_id = %id, "thread created");
        state.insert_thread(ThreadMetadata::new(id)).metadata.clone()
    }

    /// Upserts thread metadata. Items embedded in a full [`Thread`] are
    /// dropped by the conversion; the item log is left untouched.
    pub async fn save_thread(&self, thread: impl Into<ThreadMetadata>) {
        let metadata = thread.into();
        let mut state = self.state.lock().await;
        match state.threads.get_mut(&metadata.id) {
            Some(existing) => existing.metadata = metadata,
            None => {
                state.insert_thread(metadata);
            }
        }
    }

    pub async fn delete_thread(&self, thread_id: &str) {
        let mut state = self.state.lock().await;
        if state.threads.remove(thread_id).is_some() {
            tracing::debug!(session = %self.key, thread_id, "thread deleted");
        }
    }

    /// Sets the title from `message` when the thread has none yet. Returns
    /// whether the title changed.
    pub async fn set_title_if_missing(
        &self,
        thread_id: &str,
        message: &str,
    ) -> Result<bool, CoachError> {
        let mut state = self.state.lock().await;
        let thread = state
            .threads
            .get_mut(thread_id)
            .ok_or_else(|| thread_not_found(thread_id))?;
        if thread.metadata.title.is_some() {
            return Ok(false);
        }
        let title = generate_title(message);
        if title.is_empty() {
            return Ok(false);
        }
        thread.metadata.title = Some(title);
        Ok(true)
    }

    pub async fn list_threads(
        &self,
        limit: usize,
        after: Option<&str>,
        order: SortOrder,
    ) -> Page<ThreadMetadata> {
        let state = self.state.lock().await;
        let mut threads: Vec<&ThreadState> = state.threads.values().collect();
        threads.sort_by(|a, b| {
            a.metadata
                .created_at
                .cmp(&b.metadata.created_at)
                .then(a.seq.cmp(&b.seq))
        });
        if order == SortOrder::Desc {
            threads.reverse();
        }
        let ordered: Vec<ThreadMetadata> = threads
            .into_iter()
            .map(|thread| thread.metadata.clone())
            .collect();
        paginate(ordered, limit, after, |thread| thread.id.as_str())
    }

    pub async fn list_items(
        &self,
        thread_id: &str,
        limit: usize,
        after: Option<&str>,
        order: SortOrder,
    ) -> Result<Page<ThreadItem>, CoachError> {
        let state = self.state.lock().await;
        let thread = state
            .threads
            .get(thread_id)
            .ok_or_else(|| thread_not_found(thread_id))?;
        let mut items = thread.items.clone();
        // Stable: equal timestamps keep arrival order.
        items.sort_by_key(ThreadItem::created_at);
        if order == SortOrder::Desc {
            items.reverse();
        }
        Ok(paginate(items, limit, after, ThreadItem::id))
    }

    /// Appends to the thread's log, creating the thread when absent.
    pub async fn append_item(&self, thread_id: &str, item: ThreadItem) {
        let mut state = self.state.lock().await;
        state.thread_mut(thread_id).items.push(item);
    }

    /// Replaces the item with the same id in place, or appends it.
    pub async fn upsert_item(&self, thread_id: &str, item: ThreadItem) {
        let mut state = self.state.lock().await;
        let thread = state.thread_mut(thread_id);
        match thread
            .items
            .iter_mut()
            .find(|existing| existing.id() == item.id())
        {
            Some(existing) => *existing = item,
            None => thread.items.push(item),
        }
    }

    pub async fn get_item(&self, thread_id: &str, item_id: &str) -> Result<ThreadItem, CoachError> {
        let state = self.state.lock().await;
        let thread = state
            .threads
            .get(thread_id)
            .ok_or_else(|| thread_not_found(thread_id))?;
        thread
            .items
            .iter()
            .find(|item| item.id() == item_id)
            .cloned()
            .ok_or_else(|| CoachError::ItemNotFound {
                thread_id: thread_id.to_string(),
                item_id: item_id.to_string(),
            })
    }

    pub async fn delete_item(&self, thread_id: &str, item_id: &str) -> Result<(), CoachError> {
        let mut state = self.state.lock().await;
        let thread = state
            .threads
            .get_mut(thread_id)
            .ok_or_else(|| thread_not_found(thread_id))?;
        thread.items.retain(|item| item.id() != item_id);
        Ok(())
    }

    /// Phase 1: records metadata with no payload and returns the URL the
    /// bytes must be posted to.
    pub async fn create_attachment(
        &self,
        request: AttachmentCreate,
    ) -> Result<Attachment, CoachError> {
        let id = new_id("atc");
        let mut upload_url = self
            .upload_base
            .join(&format!("api/attachments/{id}/upload"))
            .map_err(|err| CoachError::invalid_request(format!("invalid upload url: {err}")))?;
        upload_url.query_pairs_mut().append_pair("sid", &self.key);

        let attachment = Attachment {
            id: id.clone(),
            name: request.name,
            mime_type: request.mime_type,
            size: 0,
            upload_url: upload_url.to_string(),
        };
        let mut state = self.state.lock().await;
        state.attachments.insert(
            id,
            AttachmentRecord {
                metadata: attachment.clone(),
                bytes: None,
            },
        );
        Ok(attachment)
    }

    /// Phase 2: stores the payload and finalizes the size.
    pub async fn complete_attachment_upload(
        &self,
        attachment_id: &str,
        bytes: Bytes,
    ) -> Result<Attachment, CoachError> {
        let mut state = self.state.lock().await;
        let record = state
            .attachments
            .get_mut(attachment_id)
            .ok_or_else(|| CoachError::AttachmentNotFound {
                attachment_id: attachment_id.to_string(),
                pending_upload: false,
            })?;
        record.metadata.size = bytes.len() as u64;
        record.bytes = Some(bytes);
        Ok(record.metadata.clone())
    }

    /// Fails for unknown attachments and for attachments whose upload has
    /// not completed.
    pub async fn load_attachment(
        &self,
        attachment_id: &str,
    ) -> Result<StoredAttachment, CoachError> {
        let state = self.state.lock().await;
        let record = state
            .attachments
            .get(attachment_id)
            .ok_or_else(|| CoachError::AttachmentNotFound {
                attachment_id: attachment_id.to_string(),
                pending_upload: false,
            })?;
        match &record.bytes {
            Some(bytes) => Ok(StoredAttachment {
                metadata: record.metadata.clone(),
                bytes: bytes.clone(),
            }),
            None => Err(CoachError::AttachmentNotFound {
                attachment_id: attachment_id.to_string(),
                pending_upload: true,
            }),
        }
    }

    pub async fn delete_attachment(&self, attachment_id: &str) {
        self.state.lock().await.attachments.remove(attachment_id);
    }
}

fn thread_not_found(thread_id: &str) -> CoachError {
    CoachError::ThreadNotFound {
        thread_id: thread_id.to_string(),
    }
}

/// Cursor pagination over an already ordered list. An unknown cursor starts
/// from the beginning.
fn paginate<T>(
    ordered: Vec<T>,
    limit: usize,
    after: Option<&str>,
    id_of: impl Fn(&T) -> &str,
) -> Page<T> {
    let limit = limit.clamp(1, MAX_PAGE_LIMIT);
    let start = after
        .and_then(|cursor| ordered.iter().position(|entry| id_of(entry) == cursor))
        .map(|index| index + 1)
        .unwrap_or(0);
    let mut data: Vec<T> = ordered.into_iter().skip(start).take(limit + 1).collect();
    let has_more = data.len() > limit;
    data.truncate(limit);
    let after = if has_more {
        data.last().map(|entry| id_of(entry).to_string())
    } else {
        None
    };
    Page {
        data,
        has_more,
        after,
    }
}
