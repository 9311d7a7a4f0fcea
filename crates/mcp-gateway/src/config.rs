//! Configuration for the gateway process.
//!
//! Everything is driven by environment variables (see `defaults` for the
//! fallbacks); `Settings::for_testing` builds a fast-timeout configuration
//! for integration tests.

use std::time::Duration;

/// Default values and tuning constants.
pub mod defaults {
    use std::time::Duration;

    /// Gateway listen address.
    pub const GATEWAY_BIND: &str = "0.0.0.0:3000";

    /// Management API listen address (served by the management process).
    pub const API_BIND: &str = "0.0.0.0:3001";

    /// Per-request upstream call timeout.
    pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);

    /// Session idle timeout: no client activity for this long closes it.
    pub const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

    /// How often the idle sweeper scans live sessions.
    pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

    /// Bounded capacity of each session's message channel. A full channel
    /// blocks producers, propagating backpressure to upstream readers.
    pub const CHANNEL_CAPACITY: usize = 64;

    /// Redis key namespace.
    pub const REDIS_PREFIX: &str = "mcpgw";

    /// Redis fan-out topic suffix.
    pub const REDIS_TOPIC: &str = "events";

    /// TTL on session metadata hashes.
    pub const REDIS_TTL: Duration = Duration::from_secs(3600);

    /// Cookie the identity adapter reads.
    pub const SESSION_COOKIE: &str = "gateway_session";

    /// Timeout applied to each transport close during manager stop.
    pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

    /// Cached upstream tool lists expire after this long.
    pub const TOOL_CACHE_TTL: Duration = Duration::from_secs(300);

    /// Server name advertised in `initialize` responses.
    pub const SERVER_NAME: &str = "mcp-gateway";
}

/// Connection settings for the Redis session store and notifier.
#[derive(Debug, Clone)]
pub struct RedisSettings {
    /// Full connection URL (`redis://[user:pass@]host:port/db`).
    pub url: String,
    /// Key namespace prepended to every key and the topic.
    pub key_prefix: String,
    /// Pub/sub topic suffix for cross-replica fan-out.
    pub topic: String,
    /// TTL on session metadata hashes.
    pub ttl: Duration,
}

impl RedisSettings {
    /// Build settings for a URL with default namespace and TTL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            key_prefix: defaults::REDIS_PREFIX.to_string(),
            topic: defaults::REDIS_TOPIC.to_string(),
            ttl: defaults::REDIS_TTL,
        }
    }
}

/// Which notifier variant distributes config-change events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotifierKind {
    /// In-process channel; single-replica deployments.
    #[default]
    Signal,
    /// Redis pub/sub topic shared by all replicas.
    Redis,
    /// Management API POSTs to each replica's reload endpoint.
    Api,
}

impl NotifierKind {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "signal" => Some(Self::Signal),
            "redis" => Some(Self::Redis),
            "api" => Some(Self::Api),
            _ => None,
        }
    }
}

/// Process configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Gateway listen address.
    pub gateway_bind: String,

    /// Management API listen address (informational; the API itself is a
    /// separate process).
    pub api_bind: String,

    /// Relational store URL, passed through to the management layer.
    pub database_url: Option<String>,

    /// Base URL of the management REST API the gateway reconciles from.
    pub management_url: Option<String>,

    /// Redis settings; absent means the in-memory store.
    pub redis: Option<RedisSettings>,

    /// Notifier variant.
    pub notifier: NotifierKind,

    /// Replica reload endpoints for the `api` notifier.
    pub notifier_replicas: Vec<String>,

    /// Per-request upstream call timeout.
    pub call_timeout: Duration,

    /// Session idle timeout.
    pub idle_timeout: Duration,

    /// Bounded session channel capacity.
    pub channel_capacity: usize,

    /// Name of the identity cookie.
    pub session_cookie: String,
}

impl Settings {
    /// Read configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error for unparseable numeric values or an unknown
    /// notifier variant.
    pub fn from_env() -> anyhow::Result<Self> {
        let redis = std::env::var("REDIS_URL").ok().map(|url| {
            let mut settings = RedisSettings::new(url);
            if let Ok(prefix) = std::env::var("REDIS_PREFIX") {
                settings.key_prefix = prefix;
            }
            if let Ok(topic) = std::env::var("REDIS_TOPIC") {
                settings.topic = topic;
            }
            if let Ok(ttl) = std::env::var("REDIS_TTL_SECS") {
                if let Ok(secs) = ttl.parse::<u64>() {
                    settings.ttl = Duration::from_secs(secs);
                }
            }
            settings
        });

        let notifier = match std::env::var("NOTIFIER") {
            Ok(value) => NotifierKind::parse(&value)
                .ok_or_else(|| anyhow::anyhow!("unknown notifier variant '{value}'"))?,
            Err(_) => NotifierKind::default(),
        };

        let notifier_replicas = std::env::var("NOTIFIER_REPLICAS")
            .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();

        Ok(Self {
            gateway_bind: std::env::var("MCP_GATEWAY_BIND")
                .unwrap_or_else(|_| defaults::GATEWAY_BIND.to_string()),
            api_bind: std::env::var("MCP_GATEWAY_API_BIND")
                .unwrap_or_else(|_| defaults::API_BIND.to_string()),
            database_url: std::env::var("DATABASE_URL").ok(),
            management_url: std::env::var("MANAGEMENT_API_URL").ok(),
            redis,
            notifier,
            notifier_replicas,
            call_timeout: env_duration("CALL_TIMEOUT_SECS", defaults::CALL_TIMEOUT)?,
            idle_timeout: env_duration("SESSION_IDLE_TIMEOUT_SECS", defaults::IDLE_TIMEOUT)?,
            channel_capacity: env_usize("SESSION_CHANNEL_CAPACITY", defaults::CHANNEL_CAPACITY)?,
            session_cookie: std::env::var("SESSION_COOKIE_NAME")
                .unwrap_or_else(|_| defaults::SESSION_COOKIE.to_string()),
        })
    }

    /// Fast-timeout configuration for tests.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            gateway_bind: "127.0.0.1:0".to_string(),
            api_bind: "127.0.0.1:0".to_string(),
            database_url: None,
            management_url: None,
            redis: None,
            notifier: NotifierKind::Signal,
            notifier_replicas: vec![],
            call_timeout: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(1),
            channel_capacity: 16,
            session_cookie: defaults::SESSION_COOKIE.to_string(),
        }
    }
}

fn env_duration(var: &str, default: Duration) -> anyhow::Result<Duration> {
    match std::env::var(var) {
        Ok(value) => {
            let secs = value
                .parse::<u64>()
                .map_err(|_| anyhow::anyhow!("{var} must be an integer number of seconds"))?;
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(default),
    }
}

fn env_usize(var: &str, default: usize) -> anyhow::Result<usize> {
    match std::env::var(var) {
        Ok(value) => value.parse::<usize>().map_err(|_| anyhow::anyhow!("{var} must be an integer")),
        Err(_) => Ok(default),
    }
}
