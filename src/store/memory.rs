//! In-process backends.
//!
//! `MemoryStore` stands in for the shared counter/set store and the pub/sub
//! channel when a single instance is deployed, and doubles as the test
//! backend. Expiry uses `tokio::time::Instant`, so paused-clock tests can
//! advance through rate-limit windows.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{
    glob_match, MessageStore, PubSub, SharedStore, StoreError, Subscription, SUBSCRIPTION_BUFFER,
};
use crate::server::message::{ChatMessage, MessageId, NewMessage};

const CHANNEL_CAPACITY: usize = 4096;
/// Expired counters are dropped once per this many increments.
const PURGE_EVERY: u64 = 1024;

struct Counter {
    value: i64,
    expires_at: Option<Instant>,
}

impl Counter {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Shared store and pub/sub channel held in process memory.
pub struct MemoryStore {
    counters: DashMap<String, Counter>,
    scored: DashMap<String, HashMap<String, i64>>,
    lists: DashMap<String, VecDeque<String>>,
    sets: DashMap<String, HashSet<String>>,
    channel: broadcast::Sender<(String, String)>,
    disconnects: watch::Sender<u64>,
    increments: AtomicU64,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (channel, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (disconnects, _) = watch::channel(0);
        Self {
            counters: DashMap::new(),
            scored: DashMap::new(),
            lists: DashMap::new(),
            sets: DashMap::new(),
            channel,
            disconnects,
            increments: AtomicU64::new(0),
            available: AtomicBool::new(true),
        }
    }

    /// Ends every live subscription, as a dropped pub/sub connection would.
    ///
    /// Subscribers see their stream end; new subscriptions work as before.
    pub fn disconnect_subscribers(&self) {
        self.disconnects.send_modify(|generation| *generation += 1);
    }

    fn purge_expired(&self, now: Instant) {
        self.counters.retain(|_, counter| counter.is_live(now));
    }

    /// Simulates the backend becoming unreachable (or reachable again).
    ///
    /// While unavailable every operation fails with `StoreError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store marked unavailable".into()))
        }
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn incr_window(&self, key: &str, seconds: u64) -> Result<i64, StoreError> {
        self.check()?;
        let now = Instant::now();
        let count = {
            let mut counter = self.counters.entry(key.to_string()).or_insert(Counter {
                value: 0,
                expires_at: None,
            });
            if !counter.is_live(now) {
                counter.value = 0;
                counter.expires_at = None;
            }
            counter.value += 1;
            if counter.expires_at.is_none() {
                counter.expires_at = Some(now + Duration::from_secs(seconds));
            }
            counter.value
        };

        if self.increments.fetch_add(1, Ordering::Relaxed) % PURGE_EVERY == PURGE_EVERY - 1 {
            self.purge_expired(now);
        }
        Ok(count)
    }

    async fn add_scored(&self, key: &str, member: &str, score: i64) -> Result<(), StoreError> {
        self.check()?;
        self.scored
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn range_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
    ) -> Result<Vec<String>, StoreError> {
        self.check()?;
        let Some(set) = self.scored.get(key) else {
            return Ok(Vec::new());
        };
        let mut members: Vec<(&String, &i64)> = set
            .iter()
            .filter(|(_, score)| (min..=max).contains(*score))
            .collect();
        members.sort_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)));
        Ok(members.into_iter().map(|(m, _)| m.clone()).collect())
    }

    async fn remove_range_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
    ) -> Result<u64, StoreError> {
        self.check()?;
        let removed = match self.scored.get_mut(key) {
            Some(mut set) => {
                let before = set.len();
                set.retain(|_, score| !(min..=max).contains(&*score));
                (before - set.len()) as u64
            }
            None => 0,
        };
        self.scored.remove_if(key, |_, set| set.is_empty());
        Ok(removed)
    }

    async fn push_bounded(
        &self,
        key: &str,
        value: &str,
        max_len: usize,
    ) -> Result<(), StoreError> {
        self.check()?;
        let mut list = self.lists.entry(key.to_string()).or_default();
        list.push_front(value.to_string());
        list.truncate(max_len);
        Ok(())
    }

    async fn list_head(&self, key: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        self.check()?;
        Ok(self
            .lists
            .get(key)
            .map(|list| list.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn add_member(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.check()?;
        self.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn remove_member(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.check()?;
        if let Some(mut set) = self.sets.get_mut(key) {
            set.remove(member);
        }
        self.sets.remove_if(key, |_, set| set.is_empty());
        Ok(())
    }

    async fn members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.check()?;
        Ok(self
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }
}

#[async_trait]
impl PubSub for MemoryStore {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), StoreError> {
        self.check()?;
        // No subscribers is not an error for a fire-and-forget channel.
        let _ = self.channel.send((topic.to_string(), payload.to_string()));
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription, StoreError> {
        self.check()?;
        let mut source = self.channel.subscribe();
        let mut disconnected = self.disconnects.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let pattern = pattern.to_string();

        let pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = disconnected.changed() => break,
                    received = source.recv() => match received {
                        Ok((topic, payload)) => {
                            if glob_match(&pattern, &topic) && tx.send((topic, payload)).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Memory subscription lagged, {} payloads skipped", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });

        Ok(Subscription::new(rx, cancel, pump))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }
}

/// Durable store kept in process memory.
///
/// Identifiers come from one process-wide sequence, so they increase in
/// insertion order within every room.
pub struct MemoryMessageStore {
    next_id: AtomicI64,
    rooms: DashMap<String, Vec<ChatMessage>>,
    available: AtomicBool,
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            rooms: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulates the durable store rejecting writes and reads.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of messages persisted for `room`.
    pub fn count(&self, room: &str) -> usize {
        self.rooms.get(room).map(|m| m.len()).unwrap_or(0)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("message store marked unavailable".into()))
        }
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn insert(&self, message: NewMessage) -> Result<ChatMessage, StoreError> {
        self.check()?;
        let mut room = self.rooms.entry(message.room.clone()).or_default();
        // Assigned under the room's entry lock so per-room order matches id order.
        let id = MessageId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let stored = ChatMessage::persisted(id, message);
        room.push(stored.clone());
        Ok(stored)
    }

    async fn query_recent(
        &self,
        room: &str,
        limit: usize,
        before: Option<MessageId>,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        self.check()?;
        let Some(messages) = self.rooms.get(room) else {
            return Ok(Vec::new());
        };
        Ok(messages
            .iter()
            .rev()
            .filter(|m| before.map_or(true, |cursor| m.id < cursor))
            .take(limit)
            .cloned()
            .collect())
    }
}
