//! Centralized configuration for the quadrant transport.
//!
//! Wire constants live on unit structs with associated consts; runtime
//! settings for the client and server are plain structs with builders.

use crate::error::{Result, RpcError};
use std::time::Duration;

/// Wire-level names shared by the client and the dispatcher.
pub struct WireConfig;

impl WireConfig {
    pub const API_PREFIX: &'static str = "/_api";
    pub const PAYLOAD_PARAM: &'static str = "payload";
    pub const DATA_FIELD: &'static str = "data";
    /// Key of the application-level failure payload sent over duplex connections.
    pub const ERROR_FIELD: &'static str = "_error";
    pub const HEALTH_PATH: &'static str = "/health";
    pub const WEBHOOK_PATH: &'static str = "/_webhook";
    pub const SCHEMA_PATH: &'static str = "/_api/_schema";
    pub const MAX_DUPLEX_FRAME_SIZE: usize = 1_048_576; // 1MB
}

/// Server-push stream settings.
pub struct StreamConfig;

impl StreamConfig {
    pub const MESSAGE_EVENT: &'static str = "message";
    pub const CLOSE_EVENT: &'static str = "close";
    pub const ERROR_EVENT: &'static str = "error";
    pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);
    pub const CLIENT_EVENT_BUFFER: usize = 256;
}

/// Network-related defaults.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    pub const API_URL_ENV: &'static str = "QUADRANT_API_URL";
    pub const DEFAULT_HOST: &'static str = "127.0.0.1";
}

/// Settings for [`RpcClient`](crate::client::RpcClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    base_url: String,
    request_timeout: Option<Duration>,
    headers: Vec<(String, String)>,
}

impl ClientConfig {
    /// Create a config for the server at `base_url` (e.g. `http://127.0.0.1:8080`).
    pub fn new(base_url: &str) -> Result<Self> {
        let parsed = url::Url::parse(base_url).map_err(|e| RpcError::Config {
            message: format!("Invalid base URL {}: {}", base_url, e),
        })?;

        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(RpcError::Config {
                message: format!("Unsupported URL scheme: {}", parsed.scheme()),
            });
        }

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            request_timeout: Some(NetworkConfig::REQUEST_TIMEOUT),
            headers: Vec::new(),
        })
    }

    /// Read the base URL from `QUADRANT_API_URL`.
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var(NetworkConfig::API_URL_ENV).map_err(|_| RpcError::Config {
            message: format!("{} environment variable is not set", NetworkConfig::API_URL_ENV),
        })?;
        Self::new(&base_url)
    }

    /// Override the per-request timeout for query and mutation calls.
    ///
    /// `None` disables the timeout. Streams are never subject to it.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Attach a header to every request and handshake.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// HTTP endpoint of a procedure.
    pub(crate) fn endpoint(&self, service: &str, procedure: &str) -> String {
        format!(
            "{}{}",
            self.base_url,
            crate::wire::procedure_path(service, procedure)
        )
    }

    /// WebSocket endpoint of a procedure (`http` -> `ws`, `https` -> `wss`).
    pub(crate) fn socket_endpoint(&self, service: &str, procedure: &str) -> String {
        let endpoint = self.endpoint(service, procedure);
        match endpoint.strip_prefix("https://") {
            Some(rest) => format!("wss://{}", rest),
            None => endpoint.replacen("http://", "ws://", 1),
        }
    }
}

/// Settings for [`RpcServer::start`](crate::server::RpcServer::start).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    /// Port to listen on (0 = auto-assign)
    pub port: u16,
    /// Interval between SSE keep-alive comments
    pub keep_alive: Duration,
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            keep_alive: StreamConfig::KEEP_ALIVE_INTERVAL,
        }
    }

    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive = interval;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(NetworkConfig::DEFAULT_HOST, 0)
    }
}
