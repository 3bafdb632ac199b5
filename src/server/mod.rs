// src/server/mod.rs
pub mod api;
pub mod cache;
pub mod client;
pub mod fabric;
pub mod handler;
pub mod health;
pub mod message;
pub mod middleware;
pub mod pipeline;
pub mod presence;

// Re-export public components
pub use cache::RecentCache;
pub use client::{Client, ConnectionRegistry};
pub use fabric::BroadcastFabric;
pub use handler::handle_connection;
pub use health::HealthMetrics;
pub use message::{ChatMessage, InboundEvent, ServerMessage};
pub use middleware::rate_limit::{ConnectionRateLimiter, MessageRateLimiter};
pub use presence::PresenceTracker;

use std::sync::Arc;
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{ServerConfig, StoreBackend};
use crate::store::{
    MemoryMessageStore, MemoryStore, MessageStore, PgMessageStore, PubSub, RedisStore,
    SharedStore,
};
use crate::utils::error::ChatError;

/// The external collaborators, constructed once by the process and shared
/// with every component that needs them.
#[derive(Clone)]
pub struct Backends {
    pub shared: Arc<dyn SharedStore>,
    pub channel: Arc<dyn PubSub>,
    pub messages: Arc<dyn MessageStore>,
}

impl Backends {
    /// Single-process backends held entirely in memory.
    pub fn in_memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            shared: store.clone(),
            channel: store,
            messages: Arc::new(MemoryMessageStore::new()),
        }
    }

    /// Backends selected by `config`.
    ///
    /// # Errors
    /// Returns `ChatError::StoreError` if the Redis URL is invalid or the
    /// durable store cannot be reached.
    pub async fn from_config(config: &ServerConfig) -> Result<Self, ChatError> {
        let (shared, channel) = match config.store_backend {
            StoreBackend::Redis => {
                let redis = Arc::new(RedisStore::new(&config.redis_url)?);
                let shared: Arc<dyn SharedStore> = redis.clone();
                let channel: Arc<dyn PubSub> = redis;
                (shared, channel)
            }
            StoreBackend::Memory => {
                warn!("Using in-memory shared store; state is not shared across instances");
                let memory = Arc::new(MemoryStore::new());
                let shared: Arc<dyn SharedStore> = memory.clone();
                let channel: Arc<dyn PubSub> = memory;
                (shared, channel)
            }
        };

        let messages: Arc<dyn MessageStore> = match &config.database_url {
            Some(url) => Arc::new(PgMessageStore::connect(url).await?),
            None => {
                warn!("No database_url configured; message history is kept in memory");
                Arc::new(MemoryMessageStore::new())
            }
        };

        Ok(Self {
            shared,
            channel,
            messages,
        })
    }
}

/// Everything a connection handler, the HTTP API and the background tasks share.
pub struct ServerState {
    pub config: Arc<ServerConfig>,
    pub registry: ConnectionRegistry,
    pub metrics: HealthMetrics,
    pub connection_limiter: ConnectionRateLimiter,
    pub message_limiter: MessageRateLimiter,
    pub presence: PresenceTracker,
    pub cache: RecentCache,
    pub fabric: BroadcastFabric,
    pub messages: Arc<dyn MessageStore>,
    pub tls_acceptor: Option<Arc<TlsAcceptor>>,
}

impl ServerState {
    /// Wires the components over `backends`.
    ///
    /// # Errors
    /// Returns `ChatError::ConfigurationError` for invalid limits or TLS setup.
    pub fn new(config: ServerConfig, backends: Backends) -> Result<Self, ChatError> {
        Ok(Self {
            connection_limiter: ConnectionRateLimiter::new(config.connection_rate_limit)?,
            message_limiter: MessageRateLimiter::new(
                backends.shared.clone(),
                config.message_rate_limit,
                config.rate_limit_window_secs,
            ),
            presence: PresenceTracker::new(backends.shared.clone(), config.presence_window_secs),
            cache: RecentCache::new(backends.shared, config.recent_cache_size),
            fabric: BroadcastFabric::new(backends.channel),
            messages: backends.messages,
            registry: ConnectionRegistry::new(),
            metrics: HealthMetrics::new(),
            tls_acceptor: config.create_tls_acceptor()?,
            config: Arc::new(config),
        })
    }
}

/// The long-lived tasks of one process, cancelled together and joined on shutdown.
pub struct BackgroundTasks {
    cancel: CancellationToken,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl BackgroundTasks {
    /// Starts the broadcast listener and the presence sweep.
    pub fn start(state: &Arc<ServerState>) -> Self {
        let cancel = CancellationToken::new();
        let listener = state.fabric.spawn_listener(
            state.registry.clone(),
            state.metrics.clone(),
            cancel.child_token(),
        );
        let sweeper = state
            .presence
            .spawn_sweeper(state.config.presence_sweep_interval(), cancel.child_token());

        Self {
            cancel,
            handles: vec![("broadcast listener", listener), ("presence sweep", sweeper)],
        }
    }

    /// Token that fires when shutdown begins.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancels every task and waits for each to finish its cleanup.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for (name, handle) in self.handles {
            match handle.await {
                Ok(()) => info!("{} stopped", name),
                Err(e) => error!("{} ended abnormally: {}", name, e),
            }
        }
    }
}

/// Accepts incoming TCP connections until the listener fails permanently.
///
/// Each connection gets its own task. If TLS is enabled, the connection is
/// upgraded using `tokio-rustls` before being handled.
pub async fn accept_connections(listener: TcpListener, state: Arc<ServerState>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    let result = match &state.tls_acceptor {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls_stream) => handle_connection(tls_stream, state.clone(), addr).await,
                            Err(e) => {
                                error!("TLS handshake failed: {}", e);
                                return;
                            }
                        },
                        None => handle_connection(stream, state.clone(), addr).await,
                    };
                    match result {
                        Ok(()) => info!("Connection closed: {}", addr),
                        Err(e) => error!("Connection error from {}: {}", addr, e),
                    }
                });
            }
            Err(e) => error!("Accept error: {}", e),
        }
    }
}
