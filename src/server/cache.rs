use std::sync::Arc;

use tracing::{instrument, warn};

use crate::server::message::ChatMessage;
use crate::store::{SharedStore, StoreError};

/// Bounded per-room buffer of recently created messages.
///
/// Entries are serialized messages kept newest first in the shared store;
/// [`RecentCache::recent`] hands them back oldest first. The cache is
/// ephemeral: callers fall back to the durable store when it is empty.
#[derive(Clone)]
pub struct RecentCache {
    store: Arc<dyn SharedStore>,
    max_len: usize,
}

impl RecentCache {
    pub fn new(store: Arc<dyn SharedStore>, max_len: usize) -> Self {
        Self { store, max_len }
    }

    fn key(room: &str) -> String {
        format!("chat:{}:recent", room)
    }

    /// Prepends a message to `room`'s buffer, evicting the oldest beyond the bound.
    #[instrument(skip(self, message), fields(id = %message.id))]
    pub async fn push(&self, room: &str, message: &ChatMessage) -> Result<(), StoreError> {
        let serialized = serde_json::to_string(message)?;
        self.store
            .push_bounded(&Self::key(room), &serialized, self.max_len)
            .await
    }

    /// Cached messages of `room`, oldest first. Undecodable entries are skipped.
    pub async fn recent(&self, room: &str) -> Result<Vec<ChatMessage>, StoreError> {
        let entries = self.store.list_head(&Self::key(room), self.max_len).await?;
        Ok(entries
            .iter()
            .rev()
            .filter_map(|entry| match serde_json::from_str(entry) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!("Skipping undecodable cache entry in {}: {}", room, e);
                    None
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::message::MessageId;
    use crate::store::MemoryStore;
    use chrono::Utc;

    fn message(id: i64) -> ChatMessage {
        ChatMessage {
            id: MessageId(id),
            room: "lobby".into(),
            username: "alice".into(),
            content: format!("message {}", id),
            avatar: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn keeps_newest_max_len_entries() {
        let cache = RecentCache::new(Arc::new(MemoryStore::new()), 50);
        for id in 1..=51 {
            cache.push("lobby", &message(id)).await.unwrap();
        }

        let recent = cache.recent("lobby").await.unwrap();
        assert_eq!(recent.len(), 50);
        assert_eq!(recent.first().unwrap().id, MessageId(2));
        assert_eq!(recent.last().unwrap().id, MessageId(51));
        assert!(recent.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test]
    async fn rooms_do_not_share_buffers() {
        let cache = RecentCache::new(Arc::new(MemoryStore::new()), 5);
        cache.push("lobby", &message(1)).await.unwrap();
        assert!(cache.recent("garden").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn skips_corrupt_entries() {
        let store = Arc::new(MemoryStore::new());
        let cache = RecentCache::new(store.clone(), 5);
        cache.push("lobby", &message(1)).await.unwrap();
        store.push_bounded("chat:lobby:recent", "{oops", 5).await.unwrap();
        cache.push("lobby", &message(2)).await.unwrap();

        let ids: Vec<_> = cache.recent("lobby").await.unwrap().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![MessageId(1), MessageId(2)]);
    }
}
