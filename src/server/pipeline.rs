use tracing::{debug, instrument, warn};

use crate::server::message::{ChatMessage, MessageError, PostEvent, ServerMessage};
use crate::server::middleware::validation::validate_post;
use crate::server::ServerState;
use crate::utils::error::ChatError;

/// What became of one candidate post.
#[derive(Debug)]
pub enum IngestOutcome {
    /// Persisted; cache and fan-out were attempted.
    Accepted(ChatMessage),
    /// Failed validation. Nothing was counted, stored or sent.
    Invalid(MessageError),
    /// Over the sender's rate limit. Nothing was stored or sent.
    RateLimited,
}

/// Runs one post through validate → rate-limit → persist → cache → publish → presence.
///
/// Persistence failure aborts the post before anything is cached or
/// published. Once the message is durable, cache, publish and presence
/// failures are logged and do not undo the write.
///
/// # Errors
///
/// Returns `ChatError::StoreError` if the durable store rejects the write.
#[instrument(skip(state, post), fields(username = %post.username))]
pub async fn ingest(
    state: &ServerState,
    room: &str,
    post: &PostEvent,
) -> Result<IngestOutcome, ChatError> {
    let candidate = match validate_post(room, post) {
        Ok(candidate) => candidate,
        Err(e) => {
            debug!("Dropping invalid post: {}", e);
            return Ok(IngestOutcome::Invalid(e));
        }
    };

    if !state.message_limiter.allow(room, &candidate.username).await {
        state.metrics.messages_rejected.inc();
        return Ok(IngestOutcome::RateLimited);
    }

    let stored = state.messages.insert(candidate).await?;
    debug!("Persisted message {}", stored.id);

    if let Err(e) = state.cache.push(room, &stored).await {
        warn!("Failed to cache message {}: {}", stored.id, e);
    }

    let event = ServerMessage::Message {
        item: stored.clone(),
    };
    if let Err(e) = state.fabric.publish(room, &event).await {
        warn!("Failed to publish message {}: {}", stored.id, e);
    }

    if let Err(e) = state.presence.touch(room, &stored.username).await {
        warn!("Failed to refresh presence for {}: {}", stored.username, e);
    }

    Ok(IngestOutcome::Accepted(stored))
}

/// Recent history of `room`, oldest first.
///
/// Served from the recent-message cache; when the cache is empty or
/// unreachable, the newest `history_limit` messages are read from the durable
/// store instead.
pub async fn history(state: &ServerState, room: &str) -> Result<Vec<ChatMessage>, ChatError> {
    match state.cache.recent(room).await {
        Ok(items) if !items.is_empty() => return Ok(items),
        Ok(_) => {}
        Err(e) => warn!("Recent cache unavailable for {}, reading durable store: {}", room, e),
    }

    let mut items = state
        .messages
        .query_recent(room, state.config.history_limit, None)
        .await?;
    items.reverse();
    Ok(items)
}

/// Detail sent to a rate-limited sender.
pub fn rate_limit_detail(state: &ServerState) -> String {
    format!(
        "Rate limit: max {} msgs / {}s",
        state.message_limiter.max_messages(),
        state.message_limiter.window_secs()
    )
}
