use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

pub const DEFAULT_CAPACITY: usize = 1024;
pub const DEFAULT_TTL: Duration = Duration::from_secs(6 * 60 * 60);

/// Last hosted response id per `(session, thread)`, so a follow-up turn can
/// chain onto the server-side conversation instead of resending history.
/// Bounded: least recently used entries are evicted past `capacity`, and
/// entries idle longer than `ttl` are dropped when touched.
#[derive(Debug)]
pub struct ConversationCache {
    capacity: usize,
    ttl: Duration,
    entries: Mutex<HashMap<(String, String), CacheEntry>>,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    response_id: String,
    last_used: Instant,
}

impl Default for ConversationCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}

impl ConversationCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, session: &str, thread_id: &str) -> Option<String> {
        let key = (session.to_string(), thread_id.to_string());
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let expired = entries
            .get(&key)
            .map(|entry| now.duration_since(entry.last_used) > self.ttl)?;
        if expired {
            entries.remove(&key);
            return None;
        }
        let entry = entries.get_mut(&key)?;
        entry.last_used = now;
        Some(entry.response_id.clone())
    }

    pub async fn insert(&self, session: &str, thread_id: &str, response_id: impl Into<String>) {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let ttl = self.ttl;
        entries.retain(|_, entry| now.duration_since(entry.last_used) <= ttl);
        let key = (session.to_string(), thread_id.to_string());
        if !entries.contains_key(&key) && entries.len() >= self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                tracing::debug!(session = %oldest.0, thread_id = %oldest.1, "evicting conversation");
                entries.remove(&oldest);
            }
        }
        entries.insert(
            key,
            CacheEntry {
                response_id: response_id.into(),
                last_used: now,
            },
        );
    }

    pub async fn remove(&self, session: &str, thread_id: &str) {
        self.entries
            .lock()
            .await
            .remove(&(session.to_string(), thread_id.to_string()));
    }
}

#[cfg(test)]
impl ConversationCache {
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}
