use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::{SharedStore, StoreError};

/// Set of rooms that currently have presence entries, walked by the sweep.
const PRESENCE_ROOMS_KEY: &str = "chat:presence:rooms";

/// Approximate per-room presence built from heartbeats.
///
/// Each room keeps a sorted set of username → last heartbeat (unix seconds).
/// Absence from a snapshot means "not confirmed online", never "offline".
#[derive(Clone)]
pub struct PresenceTracker {
    store: Arc<dyn SharedStore>,
    window_secs: i64,
}

impl PresenceTracker {
    pub fn new(store: Arc<dyn SharedStore>, window_secs: u64) -> Self {
        Self {
            store,
            window_secs: i64::try_from(window_secs).unwrap_or(i64::MAX),
        }
    }

    fn key(room: &str) -> String {
        format!("chat:{}:presence", room)
    }

    fn now() -> i64 {
        Utc::now().timestamp()
    }

    /// Records a heartbeat for `username` in `room` at the current time.
    pub async fn touch(&self, room: &str, username: &str) -> Result<(), StoreError> {
        self.touch_at(room, username, Self::now()).await
    }

    pub async fn touch_at(&self, room: &str, username: &str, now: i64) -> Result<(), StoreError> {
        self.store.add_scored(&Self::key(room), username, now).await?;
        self.store.add_member(PRESENCE_ROOMS_KEY, room).await
    }

    /// Usernames whose last heartbeat is within the window.
    pub async fn snapshot(&self, room: &str) -> Result<Vec<String>, StoreError> {
        self.snapshot_at(room, Self::now()).await
    }

    pub async fn snapshot_at(&self, room: &str, now: i64) -> Result<Vec<String>, StoreError> {
        let oldest = now.saturating_sub(self.window_secs);
        self.store.range_by_score(&Self::key(room), oldest, now).await
    }

    /// Purges stale entries in every room with tracked presence.
    ///
    /// Returns how many entries were removed. A room whose set ends up empty
    /// is dropped from the sweep list. `touch` writes the entry before the
    /// room, so a room that gains an entry during the sweep stays listed.
    pub async fn sweep(&self) -> Result<u64, StoreError> {
        self.sweep_at(Self::now()).await
    }

    pub async fn sweep_at(&self, now: i64) -> Result<u64, StoreError> {
        let cutoff = now.saturating_sub(self.window_secs).saturating_sub(1);
        let mut removed = 0;
        for room in self.store.members(PRESENCE_ROOMS_KEY).await? {
            let key = Self::key(&room);
            removed += self.store.remove_range_by_score(&key, i64::MIN, cutoff).await?;
            if self.is_empty(&key).await? {
                self.store.remove_member(PRESENCE_ROOMS_KEY, &room).await?;
                // A heartbeat may have landed between the check and the removal.
                if !self.is_empty(&key).await? {
                    self.store.add_member(PRESENCE_ROOMS_KEY, &room).await?;
                }
            }
        }
        Ok(removed)
    }

    async fn is_empty(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.store.range_by_score(key, i64::MIN, i64::MAX).await?.is_empty())
    }

    /// Spawns the periodic sweep. It runs until `cancel` fires; a failed pass
    /// is logged and retried on the next tick.
    pub fn spawn_sweeper(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!("Presence sweep running every {:?}", interval);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => match tracker.sweep().await {
                        Ok(0) => {}
                        Ok(removed) => debug!("Presence sweep removed {} stale entries", removed),
                        Err(e) => warn!("Presence sweep failed, retrying next tick: {}", e),
                    },
                }
            }
            info!("Presence sweep stopped");
        })
    }
}
