use std::{fs, path::PathBuf, sync::Arc, time::Duration};
use serde::{Deserialize, Serialize};
use config::Config;
use rustls::{Certificate, PrivateKey, ServerConfig as RustlsServerConfig};
use tokio_rustls::TlsAcceptor;
use rustls_pemfile::{certs, pkcs8_private_keys};
use crate::utils::error::ChatError;

/// Which backend provides the shared store and the broadcast channel.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Redis, shared by every instance of the deployment.
    Redis,
    /// Process memory; only correct for a single instance.
    Memory,
}

/// Configuration settings for the chat server.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    /// The port on which the WebSocket listener accepts connections.
    pub port: u16,
    /// The port serving the HTTP API and metrics.
    pub http_port: u16,
    /// The maximum number of simultaneous connections allowed across all rooms.
    pub max_connections: usize,
    /// The maximum number of new connections per second from one IP.
    pub connection_rate_limit: u32,
    /// Backend for rate-limit counters, presence, recent cache and pub/sub.
    pub store_backend: StoreBackend,
    /// Redis URL, used when `store_backend` is `redis`.
    pub redis_url: String,
    /// PostgreSQL URL for durable history. Unset keeps history in memory.
    pub database_url: Option<String>,
    /// The maximum number of messages per window for one user in one room.
    pub message_rate_limit: u32,
    /// Length of the fixed rate-limit window.
    pub rate_limit_window_secs: u64,
    /// How long after a heartbeat a user still counts as online.
    pub presence_window_secs: u64,
    /// Period of the stale-presence sweep.
    pub presence_sweep_interval_secs: u64,
    /// Entries kept per room in the recent-message cache.
    pub recent_cache_size: usize,
    /// Messages sent as history on join.
    pub history_limit: usize,
    /// Delay between broadcast fabric readiness probes at startup.
    pub fabric_retry_interval_ms: u64,
    /// Deadline for the broadcast fabric to become reachable at startup.
    pub fabric_startup_timeout_ms: u64,
    /// Path to the TLS certificate file.
    pub tls_cert_path: PathBuf,
    /// Path to the TLS private key file.
    pub tls_key_path: PathBuf,
    /// Whether TLS is enabled on the WebSocket listener.
    pub enable_tls: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            http_port: 9080,
            max_connections: 10_000,
            connection_rate_limit: 20,
            store_backend: StoreBackend::Redis,
            redis_url: "redis://127.0.0.1:6379/0".into(),
            database_url: None,
            message_rate_limit: 5,
            rate_limit_window_secs: 60,
            presence_window_secs: 60,
            presence_sweep_interval_secs: 10,
            recent_cache_size: 50,
            history_limit: 50,
            fabric_retry_interval_ms: 500,
            fabric_startup_timeout_ms: 10_000,
            tls_cert_path: PathBuf::from("certs/cert.pem"),
            tls_key_path: PathBuf::from("certs/key.pem"),
            enable_tls: false,
        }
    }
}

impl ServerConfig {
    /// Loads the server configuration from environment variables.
    ///
    /// Environment variables should be prefixed with `CHAT_`; anything unset
    /// keeps its default.
    ///
    /// # Errors
    /// Returns a `ChatError::ConfigurationError` if the configuration cannot be loaded.
    pub fn from_env() -> Result<Self, ChatError> {
        let defaults = Config::try_from(&ServerConfig::default())
            .map_err(|e| ChatError::ConfigurationError(e.to_string()))?;

        Config::builder()
            .add_source(defaults)
            .add_source(config::Environment::with_prefix("CHAT").try_parsing(true))
            .build()
            .map_err(|e| ChatError::ConfigurationError(e.to_string()))?
            .try_deserialize()
            .map_err(|e| ChatError::ConfigurationError(e.to_string()))
    }

    /// Validates the configuration settings.
    ///
    /// Ensures that limits, windows and cache sizes are non-zero, that
    /// `max_connections` stays within bounds and that TLS files exist if TLS
    /// is enabled.
    ///
    /// # Errors
    /// Returns a `ChatError::ConfigurationError` if validation fails.
    pub fn validate(&self) -> Result<(), ChatError> {
        if self.enable_tls {
            if !self.tls_cert_path.exists() {
                return Err(ChatError::ConfigurationError(format!(
                    "Certificate file not found: {:?}",
                    self.tls_cert_path
                )));
            }

            if !self.tls_key_path.exists() {
                return Err(ChatError::ConfigurationError(format!(
                    "Key file not found: {:?}",
                    self.tls_key_path
                )));
            }
        }

        if self.max_connections == 0 {
            return Err(ChatError::ConfigurationError(
                "max_connections must be greater than 0".into()
            ));
        }

        if self.max_connections > 100_000 {
            return Err(ChatError::ConfigurationError(
                "max_connections cannot exceed 100,000".into()
            ));
        }

        let non_zero = [
            ("connection_rate_limit", self.connection_rate_limit as u64),
            ("message_rate_limit", self.message_rate_limit as u64),
            ("rate_limit_window_secs", self.rate_limit_window_secs),
            ("presence_window_secs", self.presence_window_secs),
            ("presence_sweep_interval_secs", self.presence_sweep_interval_secs),
            ("recent_cache_size", self.recent_cache_size as u64),
            ("history_limit", self.history_limit as u64),
            ("fabric_retry_interval_ms", self.fabric_retry_interval_ms),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(ChatError::ConfigurationError(format!(
                "{} must be greater than 0",
                name
            )));
        }

        Ok(())
    }

    pub fn presence_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.presence_sweep_interval_secs)
    }

    pub fn fabric_retry_interval(&self) -> Duration {
        Duration::from_millis(self.fabric_retry_interval_ms)
    }

    pub fn fabric_startup_timeout(&self) -> Duration {
        Duration::from_millis(self.fabric_startup_timeout_ms)
    }

    /// Creates a TLS acceptor for secure WebSocket connections.
    ///
    /// If TLS is disabled, returns `None`. Otherwise, loads the TLS certificate and private key,
    /// and initializes a Rustls TLS acceptor.
    ///
    /// # Errors
    /// Returns a `ChatError::ConfigurationError` if any part of the TLS setup fails.
    pub fn create_tls_acceptor(&self) -> Result<Option<Arc<TlsAcceptor>>, ChatError> {
        if !self.enable_tls {
            return Ok(None);
        }

        let cert_chain = fs::read(&self.tls_cert_path)
            .map_err(|e| ChatError::ConfigurationError(format!(
                "Certificate error: {} (path: {:?})",
                e, self.tls_cert_path
            )))?;

        let key_der = fs::read(&self.tls_key_path)
            .map_err(|e| ChatError::ConfigurationError(format!(
                "Key error: {} (path: {:?})",
                e, self.tls_key_path
            )))?;

        let certs = certs(&mut cert_chain.as_slice())
            .map_err(|e| ChatError::ConfigurationError(format!(
                "Cert parse error: {}", e
            )))?;

        let key = pkcs8_private_keys(&mut key_der.as_slice())
            .map_err(|e| ChatError::ConfigurationError(format!(
                "Key parse error: {}", e
            )))?
            .into_iter()
            .next()
            .ok_or_else(|| ChatError::ConfigurationError(format!(
                "No PKCS#8 private key in {:?}", self.tls_key_path
            )))?;

        let config = RustlsServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(
                certs.into_iter().map(Certificate).collect(),
                PrivateKey(key),
            )
            .map_err(|e| ChatError::ConfigurationError(format!(
                "TLS config error: {}", e
            )))?;

        Ok(Some(Arc::new(TlsAcceptor::from(Arc::new(config)))))
    }
}
