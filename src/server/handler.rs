use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::StreamExt;
use percent_encoding::percent_decode_str;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::StatusCode;
use tungstenite::Message;

use crate::server::message::{create_error_message, InboundEvent, MessageId, ServerMessage};
use crate::server::middleware::validation::{validate_room, validate_username};
use crate::server::pipeline::{self, IngestOutcome};
use crate::server::{Client, ServerState};
use crate::utils::error::ChatError;

/// Extracts the percent-decoded room name from a `/ws/{room}` request path.
///
/// Returns `None` for other paths, names that are not valid UTF-8 once
/// decoded, and names that fail [`validate_room`].
pub fn room_from_path(path: &str) -> Option<String> {
    let raw = path.strip_prefix("/ws/")?;
    if raw.contains('/') {
        return None;
    }
    let room = percent_decode_str(raw).decode_utf8().ok()?;
    validate_room(&room).ok()?;
    Some(room.into_owned())
}

fn not_found() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("unknown path".into()));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

/// Handles one connection from the WebSocket handshake until it closes.
///
/// The handshake is refused with 404 unless the path names a room. After
/// admission the room's history is written before any live message, then
/// inbound frames are processed strictly one at a time.
///
/// # Errors
/// Returns `ChatError::ConnectionError` if the handshake or a read fails.
#[instrument(skip(state, stream))]
pub async fn handle_connection<S>(
    stream: S,
    state: Arc<ServerState>,
    addr: SocketAddr,
) -> Result<(), ChatError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut requested = None;
    let callback = |request: &Request, response: Response| match room_from_path(request.uri().path()) {
        Some(room) => {
            requested = Some(room);
            Ok(response)
        }
        None => Err(not_found()),
    };

    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .map_err(|e| {
            debug!("WebSocket handshake failed: {}", e);
            ChatError::ConnectionError(e.to_string())
        })?;
    let room = requested
        .ok_or_else(|| ChatError::ConnectionError("handshake completed without a room".into()))?;

    let (writer, mut reader) = ws_stream.split();
    let (client, mut outbound) = Client::channel(addr);

    if let Some(reason) = refusal(&state, addr) {
        warn!("Refusing {}: {}", addr, reason);
        let frames = vec![create_error_message(reason)?, Message::Close(None)];
        client.start_writer(outbound, writer, frames);
        return Ok(());
    }

    state.registry.admit(&room, client.clone());
    state.metrics.connections.inc();
    info!(
        "{} joined {} ({} members)",
        addr,
        room,
        state.registry.room_size(&room)
    );

    let process_result = async {
        let frames = greeting(&state, &room, &mut outbound).await?;
        client.start_writer(outbound, writer, frames);

        while let Some(msg) = reader.next().await {
            let msg = msg.map_err(|e| {
                debug!("Read error: {}", e);
                ChatError::ConnectionError(e.to_string())
            })?;

            match msg {
                Message::Text(text) => {
                    state.metrics.messages_received.inc();
                    process_text(&text, &room, &client, &state).await?;
                }
                Message::Close(_) => break,
                _ => debug!("Ignoring non-text frame"),
            }
        }
        Ok(())
    }
    .await;

    state.registry.remove(&room, &client.id);
    state.metrics.connections.dec();
    client.close();

    process_result
}

fn refusal(state: &ServerState, addr: SocketAddr) -> Option<&'static str> {
    if !state.connection_limiter.check(addr.ip()) {
        return Some("Connection rate limit exceeded");
    }
    if state.registry.len() >= state.config.max_connections {
        return Some("Server is at capacity");
    }
    None
}

/// First frames of a new member: the room's history, then whatever fan-out
/// queued while history was loading, minus messages the history already holds.
async fn greeting(
    state: &ServerState,
    room: &str,
    outbound: &mut mpsc::Receiver<Message>,
) -> Result<Vec<Message>, ChatError> {
    let items = match pipeline::history(state, room).await {
        Ok(items) => items,
        Err(e) => {
            error!("History unavailable for {}: {}", room, e);
            Vec::new()
        }
    };
    let known: HashSet<MessageId> = items.iter().map(|m| m.id).collect();

    let mut frames: Vec<Message> = vec![ServerMessage::History { items }.try_into()?];
    while let Ok(frame) = outbound.try_recv() {
        if !in_history(&frame, &known) {
            frames.push(frame);
        }
    }
    Ok(frames)
}

fn in_history(frame: &Message, known: &HashSet<MessageId>) -> bool {
    let Message::Text(text) = frame else {
        return false;
    };
    matches!(
        serde_json::from_str::<ServerMessage>(text),
        Ok(ServerMessage::Message { item }) if known.contains(&item.id)
    )
}

/// Processes one inbound text frame.
///
/// Undecodable and invalid frames are dropped. Only a rate-limit rejection
/// is answered, and only to this connection.
#[instrument(skip(text, client, state))]
async fn process_text(
    text: &str,
    room: &str,
    client: &Client,
    state: &ServerState,
) -> Result<(), ChatError> {
    let event = match InboundEvent::parse(text) {
        Ok(event) => event,
        Err(e) => {
            debug!("Dropping frame: {}", e);
            return Ok(());
        }
    };

    match event {
        InboundEvent::Heartbeat { username } => match validate_username(&username) {
            Ok(username) => {
                if let Err(e) = state.presence.touch(room, &username).await {
                    warn!("Failed to record heartbeat for {}: {}", username, e);
                }
            }
            Err(e) => debug!("Dropping heartbeat: {}", e),
        },
        InboundEvent::Post(post) => match pipeline::ingest(state, room, &post).await {
            Ok(IngestOutcome::Accepted(message)) => debug!("Accepted message {}", message.id),
            Ok(IngestOutcome::Invalid(_)) => {}
            Ok(IngestOutcome::RateLimited) => {
                let detail = pipeline::rate_limit_detail(state);
                client.send(create_error_message(&detail)?)?;
            }
            Err(e) => error!("Failed to store message in {}: {}", room, e),
        },
    }

    Ok(())
}
