//! Cross-instance broadcast fabric.
//!
//! Every accepted message is published on `chat:{room}`. One listener per
//! process holds a pattern subscription on `chat:*` and hands each payload to
//! the local [`ConnectionRegistry`], so every instance with members in the
//! room delivers it, whichever instance accepted the write.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tungstenite::Message;

use crate::server::client::ConnectionRegistry;
use crate::server::health::HealthMetrics;
use crate::server::message::ServerMessage;
use crate::store::{PubSub, Subscription};
use crate::utils::error::ChatError;

const TOPIC_PREFIX: &str = "chat:";
const TOPIC_PATTERN: &str = "chat:*";

/// Exponential delay between resubscription attempts.
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Publish side and listener factory for the shared channel.
#[derive(Clone)]
pub struct BroadcastFabric {
    channel: Arc<dyn PubSub>,
}

impl BroadcastFabric {
    pub fn new(channel: Arc<dyn PubSub>) -> Self {
        Self { channel }
    }

    /// Topic carrying `room`'s messages. The prefix keeps room names from
    /// colliding with any other channel.
    pub fn topic(room: &str) -> String {
        format!("{}{}", TOPIC_PREFIX, room)
    }

    /// Room a topic belongs to, or `None` for foreign topics.
    pub fn room_of(topic: &str) -> Option<&str> {
        topic.strip_prefix(TOPIC_PREFIX).filter(|room| !room.is_empty())
    }

    /// Fire-and-forget publish of `message` to every instance serving `room`.
    pub async fn publish(&self, room: &str, message: &ServerMessage) -> Result<(), ChatError> {
        let payload = message.to_json()?;
        self.channel.publish(&Self::topic(room), &payload).await?;
        Ok(())
    }

    /// Polls the channel every `retry` until it answers or `timeout` elapses.
    ///
    /// A ping that hangs counts as a failed attempt once the deadline passes.
    ///
    /// # Errors
    ///
    /// Returns `ChatError::StartupError` if the channel never became reachable.
    pub async fn wait_until_ready(&self, retry: Duration, timeout: Duration) -> Result<(), ChatError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let failure = match tokio::time::timeout(remaining, self.channel.ping()).await {
                Ok(Ok(())) => {
                    info!("Broadcast fabric reachable");
                    return Ok(());
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => "ping did not complete".to_string(),
            };

            if Instant::now() + retry > deadline {
                return Err(ChatError::StartupError(format!(
                    "broadcast fabric unreachable after {:?}: {}",
                    timeout, failure
                )));
            }
            debug!("Broadcast fabric not ready yet: {}", failure);
            sleep(retry).await;
        }
    }

    /// Spawns the supervised listener.
    ///
    /// The listener resubscribes with backoff whenever the subscription fails
    /// or ends. On cancellation it unsubscribes and releases the subscription
    /// before the task exits.
    pub fn spawn_listener(
        &self,
        registry: ConnectionRegistry,
        metrics: HealthMetrics,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let fabric = self.clone();
        tokio::spawn(async move {
            let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(10));

            loop {
                let subscription = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = fabric.channel.subscribe(TOPIC_PATTERN) => result,
                };

                match subscription {
                    Ok(subscription) => {
                        info!("Listening for room broadcasts on {}", TOPIC_PATTERN);
                        backoff.reset();
                        if fabric.pump(subscription, &registry, &metrics, &cancel).await {
                            break;
                        }
                        warn!("Broadcast subscription ended, resubscribing");
                    }
                    Err(e) => error!("Broadcast subscription failed: {}", e),
                }

                let delay = backoff.next_delay();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(delay) => {}
                }
            }
            info!("Broadcast listener stopped");
        })
    }

    /// Forwards payloads until the subscription ends (returns `false`) or
    /// cancellation is requested (closes the subscription, returns `true`).
    async fn pump(
        &self,
        mut subscription: Subscription,
        registry: &ConnectionRegistry,
        metrics: &HealthMetrics,
        cancel: &CancellationToken,
    ) -> bool {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    subscription.close().await;
                    return true;
                }
                received = subscription.next() => match received {
                    Some((topic, payload)) => dispatch(registry, metrics, &topic, payload),
                    None => return false,
                }
            }
        }
    }
}

/// Hands one received payload to the local members of its room.
///
/// Payloads from foreign topics or that do not decode as a server message
/// are dropped and counted.
pub(crate) fn dispatch(
    registry: &ConnectionRegistry,
    metrics: &HealthMetrics,
    topic: &str,
    payload: String,
) {
    let Some(room) = BroadcastFabric::room_of(topic) else {
        warn!("Dropping payload on unexpected topic {}", topic);
        metrics.fabric_payloads_dropped.inc();
        return;
    };

    if let Err(e) = serde_json::from_str::<ServerMessage>(&payload) {
        warn!("Dropping undecodable payload for {}: {}", room, e);
        metrics.fabric_payloads_dropped.inc();
        return;
    }

    let delivered = registry.broadcast(room, &Message::Text(payload));
    metrics.messages_broadcast.inc_by(delivered as u64);
    debug!("Delivered payload in {} to {} connections", room, delivered);
}
