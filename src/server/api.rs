//! HTTP side surface: presence, paginated history and posting through the
//! same pipeline as the WebSocket path.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use crate::server::health::{healthz, metrics_handler};
use crate::server::message::{ChatMessage, MessageId, PostEvent};
use crate::server::middleware::validation::validate_room;
use crate::server::pipeline::{self, IngestOutcome};
use crate::server::ServerState;
use crate::utils::error::ChatError;

const DEFAULT_PAGE: usize = 50;
const MAX_PAGE: usize = 200;

/// Builds the HTTP router over the shared server state.
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz))
        .route("/rooms/:room/presence", get(presence))
        .route("/rooms/:room/messages", get(list_messages).post(post_message))
        .with_state(state)
}

/// Errors mapped to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    RateLimited(String),
    Unavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::BadRequest(detail) => (StatusCode::BAD_REQUEST, detail),
            ApiError::RateLimited(detail) => (StatusCode::TOO_MANY_REQUESTS, detail),
            ApiError::Unavailable(detail) => (StatusCode::SERVICE_UNAVAILABLE, detail),
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        error!("Request failed: {}", err);
        ApiError::Unavailable("temporarily unavailable".into())
    }
}

fn checked_room(room: &str) -> Result<(), ApiError> {
    validate_room(room).map_err(|e| ApiError::BadRequest(format!("invalid room: {}", e)))
}

async fn presence(
    State(state): State<Arc<ServerState>>,
    Path(room): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    checked_room(&room)?;
    let online = state.presence.snapshot(&room).await.map_err(ChatError::from)?;
    Ok(Json(json!({ "online": online })))
}

#[derive(Debug, Deserialize)]
struct PageParams {
    limit: Option<usize>,
    before_id: Option<String>,
}

async fn list_messages(
    State(state): State<Arc<ServerState>>,
    Path(room): Path<String>,
    Query(params): Query<PageParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    checked_room(&room)?;
    let limit = params.limit.unwrap_or(DEFAULT_PAGE);
    if !(1..=MAX_PAGE).contains(&limit) {
        return Err(ApiError::BadRequest(format!("limit must be within 1..={}", MAX_PAGE)));
    }

    let before = params
        .before_id
        .as_deref()
        .map(str::parse::<MessageId>)
        .transpose()
        .map_err(|_| ApiError::BadRequest("invalid before_id".into()))?;

    let mut items: Vec<ChatMessage> = state
        .messages
        .query_recent(&room, limit, before)
        .await
        .map_err(ChatError::from)?;
    items.reverse();

    let next_cursor = items.first().map(|m| m.id);
    Ok(Json(json!({ "items": items, "next_cursor": next_cursor })))
}

async fn post_message(
    State(state): State<Arc<ServerState>>,
    Path(room): Path<String>,
    Json(post): Json<PostEvent>,
) -> Result<(StatusCode, Json<ChatMessage>), ApiError> {
    checked_room(&room)?;
    match pipeline::ingest(&state, &room, &post).await? {
        IngestOutcome::Accepted(message) => Ok((StatusCode::CREATED, Json(message))),
        IngestOutcome::Invalid(e) => Err(ApiError::BadRequest(e.to_string())),
        IngestOutcome::RateLimited => Err(ApiError::RateLimited(pipeline::rate_limit_detail(&state))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServerConfig, StoreBackend};
    use crate::server::Backends;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    fn state() -> Arc<ServerState> {
        let config = ServerConfig {
            store_backend: StoreBackend::Memory,
            message_rate_limit: 2,
            ..ServerConfig::default()
        };
        Arc::new(ServerState::new(config, Backends::in_memory()).unwrap())
    }

    async fn call(state: &Arc<ServerState>, request: Request<Body>) -> (StatusCode, Value) {
        let response = router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn post(room: &str, body: Value) -> Request<Body> {
        Request::post(format!("/rooms/{}/messages", room))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn post_then_page_history() {
        let state = state();
        for (user, text) in [("alice", "one"), ("bob", "two")] {
            let (status, body) =
                call(&state, post("lobby", json!({"username": user, "content": text}))).await;
            assert_eq!(status, StatusCode::CREATED);
            assert_eq!(body["room"], "lobby");
        }

        let (status, body) = call(&state, get("/rooms/lobby/messages?limit=1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["items"][0]["content"], "two");
        let cursor = body["next_cursor"].as_str().unwrap().to_string();

        let (_, older) = call(&state, get(&format!("/rooms/lobby/messages?before_id={}", cursor))).await;
        assert_eq!(older["items"].as_array().unwrap().len(), 1);
        assert_eq!(older["items"][0]["content"], "one");
    }

    #[tokio::test]
    async fn rejects_bad_input() {
        let state = state();
        let (status, _) =
            call(&state, post("lobby", json!({"username": "alice", "content": "   "}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&state, get("/rooms/lobby/messages?before_id=abc")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&state, get("/rooms/lobby/messages?limit=0")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn encoded_room_names_match_the_socket_path() {
        let state = state();
        let room = crate::server::handler::room_from_path("/ws/my%20room").unwrap();
        state.presence.touch(&room, "alice").await.unwrap();

        let (status, body) = call(&state, get("/rooms/my%20room/presence")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"online": ["alice"]}));

        let (status, body) =
            call(&state, post("my%20room", json!({"username": "bob", "content": "hi"}))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["room"], "my room");
    }

    #[tokio::test]
    async fn invalid_room_names_are_400() {
        let state = state();
        let long = "r".repeat(101);
        let (status, _) = call(&state, get(&format!("/rooms/{}/presence", long))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&state, get("/rooms/a%2Fb/messages")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) =
            call(&state, post(&long, json!({"username": "alice", "content": "hi"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn rate_limited_post_is_429() {
        let state = state();
        for _ in 0..2 {
            let (status, _) =
                call(&state, post("lobby", json!({"username": "alice", "content": "hi"}))).await;
            assert_eq!(status, StatusCode::CREATED);
        }
        let (status, body) =
            call(&state, post("lobby", json!({"username": "alice", "content": "hi"}))).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["detail"], "Rate limit: max 2 msgs / 60s");
    }

    #[tokio::test]
    async fn presence_lists_posters() {
        let state = state();
        call(&state, post("lobby", json!({"username": "alice", "content": "hi"}))).await;

        let (status, body) = call(&state, get("/rooms/lobby/presence")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"online": ["alice"]}));
    }
}
