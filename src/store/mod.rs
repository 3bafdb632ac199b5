//! Collaborator seams.
//!
//! The fan-out engine talks to three external collaborators: a shared
//! counter/set store, a shared pub/sub channel and a durable message store.
//! Each is a trait here so the process composition can pick Redis/Postgres for
//! distributed deployments or the in-memory backends for a single instance
//! and for tests.

pub mod memory;
pub mod postgres;
pub mod redis;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::server::message::{ChatMessage, MessageId, NewMessage};

pub use self::memory::{MemoryMessageStore, MemoryStore};
pub use self::postgres::PgMessageStore;
pub use self::redis::RedisStore;

/// Buffered (topic, payload) pairs between a subscription pump and its reader.
pub const SUBSCRIPTION_BUFFER: usize = 1024;

/// Errors raised by store backends.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The backend could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The backend answered with an error.
    #[error("store backend error: {0}")]
    Backend(String),

    /// A stored value could not be encoded or decoded.
    #[error("store serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Shared counter/set store.
///
/// Every operation is atomic on a single key; nothing here spans keys.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Atomically increments `key` and returns the post-increment value.
    ///
    /// In the same atomic step, a key that has no time-to-live (freshly
    /// created, or left without one) gets `seconds` as its expiry. A key that
    /// already expires keeps its deadline.
    async fn incr_window(&self, key: &str, seconds: u64) -> Result<i64, StoreError>;

    /// Adds or rescores `member` in the sorted set at `key`.
    async fn add_scored(&self, key: &str, member: &str, score: i64) -> Result<(), StoreError>;

    /// Members of the sorted set whose score lies in `min..=max`.
    async fn range_by_score(&self, key: &str, min: i64, max: i64)
        -> Result<Vec<String>, StoreError>;

    /// Removes members whose score lies in `min..=max`, returning how many went.
    async fn remove_range_by_score(&self, key: &str, min: i64, max: i64)
        -> Result<u64, StoreError>;

    /// Prepends `value` to the list at `key` and truncates it to `max_len`.
    async fn push_bounded(&self, key: &str, value: &str, max_len: usize)
        -> Result<(), StoreError>;

    /// Up to `limit` entries from the head of the list at `key`.
    async fn list_head(&self, key: &str, limit: usize) -> Result<Vec<String>, StoreError>;

    /// Adds `member` to the plain set at `key`.
    async fn add_member(&self, key: &str, member: &str) -> Result<(), StoreError>;

    /// Removes `member` from the plain set at `key`.
    async fn remove_member(&self, key: &str, member: &str) -> Result<(), StoreError>;

    /// All members of the plain set at `key`.
    async fn members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Round-trips to the backend.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Shared publish/subscribe channel.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Fire-and-forget publish of `payload` on `topic`.
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), StoreError>;

    /// Pattern subscription (`*` wildcard) yielding `(topic, payload)` pairs.
    async fn subscribe(&self, pattern: &str) -> Result<Subscription, StoreError>;

    /// Round-trips to the channel.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Durable message store. Identifiers it assigns are totally ordered.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persists `message` and returns it with its assigned identifier.
    async fn insert(&self, message: NewMessage) -> Result<ChatMessage, StoreError>;

    /// Up to `limit` messages of `room`, newest first, strictly older than
    /// `before` when a cursor is given.
    async fn query_recent(
        &self,
        room: &str,
        limit: usize,
        before: Option<MessageId>,
    ) -> Result<Vec<ChatMessage>, StoreError>;
}

/// A live pattern subscription.
///
/// A pump task owns the backend handle and forwards matching payloads into a
/// bounded queue. [`Subscription::next`] returns `None` once the backend side
/// is gone; [`Subscription::close`] asks the pump to unsubscribe and waits for
/// it to release the handle.
pub struct Subscription {
    receiver: mpsc::Receiver<(String, String)>,
    cancel: CancellationToken,
    pump: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(
        receiver: mpsc::Receiver<(String, String)>,
        cancel: CancellationToken,
        pump: JoinHandle<()>,
    ) -> Self {
        Self {
            receiver,
            cancel,
            pump: Some(pump),
        }
    }

    /// Next `(topic, payload)` pair, or `None` when the channel closed.
    pub async fn next(&mut self) -> Option<(String, String)> {
        self.receiver.recv().await
    }

    /// Unsubscribes and waits for the pump to release its handle.
    pub async fn close(mut self) {
        self.cancel.cancel();
        self.receiver.close();
        if let Some(pump) = self.pump.take() {
            if let Err(e) = pump.await {
                tracing::warn!("Subscription pump ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Glob matching for pattern subscriptions (`*` any run, `?` one byte).
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let pb = pattern.as_bytes();
    let tb = text.as_bytes();
    let (mut pi, mut ti) = (0usize, 0usize);
    let (mut star_p, mut star_t) = (usize::MAX, 0usize);

    while ti < tb.len() {
        if pi < pb.len() && (pb[pi] == b'?' || pb[pi] == tb[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < pb.len() && pb[pi] == b'*' {
            star_p = pi;
            star_t = ti;
            pi += 1;
        } else if star_p != usize::MAX {
            pi = star_p + 1;
            star_t += 1;
            ti = star_t;
        } else {
            return false;
        }
    }
    while pi < pb.len() && pb[pi] == b'*' {
        pi += 1;
    }
    pi == pb.len()
}
