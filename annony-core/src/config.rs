use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub chat: ChatConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub gateway: GatewayConfig,
    pub rate_limit: RateLimitConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Message instance settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Upper bound for `GET /messages` and the history sent on attach
    pub history_limit: usize,
    /// Maximum characters of a trimmed message body
    pub max_message_length: usize,
    /// Append a welcome message when the store is empty at startup
    pub seed_welcome: bool,
    /// Maximum concurrently attached connections per instance
    pub max_connections: usize,
    /// Broadcast channel name on the bus
    pub topic: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            history_limit: 100,
            max_message_length: 500,
            seed_welcome: true,
            max_connections: 10_000,
            topic: "annony:chat".to_string(),
        }
    }
}

/// Persistence backend. An empty URL selects the in-memory store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
            connect_timeout_seconds: 10,
        }
    }
}

/// Pub/sub backplane. An empty URL selects the in-process bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub connect_timeout_seconds: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            connect_timeout_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Message instances behind the gateway (`http://host:port`)
    pub backend_urls: Vec<String>,
    /// Path of the upgraded streaming endpoint
    pub stream_path: String,
    pub handshake_timeout_seconds: u64,
    /// Trust the first `X-Forwarded-For` hop as the client address
    pub trust_forwarded_for: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            backend_urls: vec!["http://127.0.0.1:3001".to_string()],
            stream_path: "/socket".to_string(),
            handshake_timeout_seconds: 10,
            trust_forwarded_for: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Deployment variables (`PORT`, `CHAT_SERVICE_URL`, `REDIS_URL`, `MONGO_URL`/`DATABASE_URL`)
    /// 2. Prefixed environment variables (`ANNONY_SERVER__PORT`, ...)
    /// 3. Config file (if provided)
    /// 4. Defaults
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("ANNONY")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("gateway.backend_urls")
                .try_parsing(true),
        );

        let mut config: Self = builder.build()?.try_deserialize()?;
        config.apply_deployment_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Apply the unprefixed variables used by container deployments.
    pub fn apply_deployment_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(port) = non_empty("PORT") {
            self.server.port = port
                .trim()
                .parse()
                .map_err(|_| ConfigError::Message(format!("PORT is not a valid port: {port}")))?;
        }
        if let Some(url) = non_empty("CHAT_SERVICE_URL") {
            self.gateway.backend_urls = url.split(',').map(|u| u.trim().to_string()).collect();
        }
        if let Some(url) = non_empty("REDIS_URL") {
            self.redis.url = url;
        }
        if let Some(url) = non_empty("DATABASE_URL").or_else(|| non_empty("MONGO_URL")) {
            self.database.url = url;
        }
        Ok(())
    }

    /// Check the configuration, collecting every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be greater than 0".to_string());
        }
        if self.chat.history_limit == 0 {
            errors.push("chat.history_limit must be greater than 0".to_string());
        }
        if self.chat.max_message_length == 0 {
            errors.push("chat.max_message_length must be greater than 0".to_string());
        }
        if self.chat.topic.is_empty() {
            errors.push("chat.topic must not be empty".to_string());
        }
        if self.rate_limit.max_requests == 0 {
            errors.push("rate_limit.max_requests must be greater than 0".to_string());
        }
        if self.rate_limit.window_seconds == 0 {
            errors.push("rate_limit.window_seconds must be greater than 0".to_string());
        }
        if self.gateway.handshake_timeout_seconds == 0 {
            errors.push("gateway.handshake_timeout_seconds must be greater than 0".to_string());
        }
        if !self.gateway.stream_path.starts_with('/') {
            errors.push(format!(
                "gateway.stream_path must start with '/': {}",
                self.gateway.stream_path
            ));
        }
        for backend in &self.gateway.backend_urls {
            match url::Url::parse(backend) {
                // Backends are reached over plain HTTP/1.1 connections
                Ok(url) if url.scheme() == "http" => {}
                Ok(url) => errors.push(format!(
                    "gateway.backend_urls entry has unsupported scheme '{}': {backend}",
                    url.scheme()
                )),
                Err(e) => errors.push(format!("gateway.backend_urls entry is invalid ({e}): {backend}")),
            }
        }
        if self.redis.connect_timeout_seconds == 0 {
            errors.push("redis.connect_timeout_seconds must be greater than 0".to_string());
        }
        if !self.redis.url.is_empty() && url::Url::parse(&self.redis.url).is_err() {
            errors.push(format!("redis.url is invalid: {}", self.redis.url));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Get HTTP address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
