//! Stream Configuration Settings
//!
//! Configuration types for the streaming session, loaded from environment
//! variables.

use std::time::Duration;

use crate::domain::subscription::DEFAULT_SUBSCRIPTION_LIMIT;
use crate::infrastructure::kiwoom::auth::{AccessToken, DEFAULT_LOGIN_TIMEOUT};

/// Production WebSocket endpoint.
pub const PRODUCTION_WS_URL: &str = "wss://api.kiwoom.com:10000/api/dostk/websocket";

/// Sandbox (mock trading) WebSocket endpoint.
pub const SANDBOX_WS_URL: &str = "wss://mockapi.kiwoom.com:10000/api/dostk/websocket";

/// Default capacity of the read-loop → dispatcher queue.
pub const DEFAULT_DISPATCH_QUEUE_CAPACITY: usize = 10_000;

/// Default health server port.
pub const DEFAULT_HEALTH_PORT: u16 = 8083;

/// Brokerage environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    /// Real trading.
    Production,
    /// Mock trading.
    #[default]
    Sandbox,
}

impl Environment {
    /// Parse environment from string. Anything but `PRODUCTION` is sandbox.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "PRODUCTION" | "PROD" | "REAL" => Self::Production,
            _ => Self::Sandbox,
        }
    }

    /// Check if this is the production environment.
    #[must_use]
    pub const fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }

    /// Get the environment name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Production => "production",
            Self::Sandbox => "sandbox",
        }
    }

    /// Default WebSocket endpoint.
    #[must_use]
    pub const fn ws_url(&self) -> &'static str {
        match self {
            Self::Production => PRODUCTION_WS_URL,
            Self::Sandbox => SANDBOX_WS_URL,
        }
    }
}

/// Complete session configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Bearer access token.
    pub token: AccessToken,
    /// Brokerage environment.
    pub environment: Environment,
    /// Endpoint override; `None` uses the environment default.
    pub url: Option<String>,
    /// Reconnect after an unexpected drop.
    pub auto_reconnect: bool,
    /// Maximum reconnection attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Ceiling on distinct (symbol, data type) pairs.
    pub subscription_limit: usize,
    /// Time allowed for the login ack.
    pub login_timeout: Duration,
    /// Heartbeat ping interval.
    pub heartbeat_interval: Duration,
    /// Grace window after a ping before the link is considered dead.
    pub heartbeat_timeout: Duration,
    /// Capacity of the dispatch queue.
    pub dispatch_queue_capacity: usize,
    /// Health check HTTP port (0 = disabled).
    pub health_port: u16,
    /// Symbols the binary subscribes at startup.
    pub symbols: Vec<String>,
}

impl StreamConfig {
    /// Create a configuration with defaults for everything but the token.
    #[must_use]
    pub fn new(token: AccessToken) -> Self {
        Self {
            token,
            environment: Environment::default(),
            url: None,
            auto_reconnect: true,
            max_reconnect_attempts: 5,
            reconnect_delay_initial: Duration::from_millis(1000),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            subscription_limit: DEFAULT_SUBSCRIPTION_LIMIT,
            login_timeout: DEFAULT_LOGIN_TIMEOUT,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
            dispatch_queue_capacity: DEFAULT_DISPATCH_QUEUE_CAPACITY,
            health_port: DEFAULT_HEALTH_PORT,
            symbols: Vec::new(),
        }
    }

    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `KIWOOM_ACCESS_TOKEN` is missing or empty.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if `KIWOOM_ACCESS_TOKEN` is missing or empty.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw_token = lookup("KIWOOM_ACCESS_TOKEN")
            .ok_or_else(|| ConfigError::MissingEnvVar("KIWOOM_ACCESS_TOKEN".to_string()))?;
        let token = AccessToken::new(raw_token)
            .map_err(|_| ConfigError::EmptyValue("KIWOOM_ACCESS_TOKEN".to_string()))?;

        let defaults = Self::new(token);
        let env = Env(&lookup);

        Ok(Self {
            environment: lookup("KIWOOM_ENV")
                .map(|s| Environment::from_str_case_insensitive(&s))
                .unwrap_or_default(),
            url: lookup("KIWOOM_WS_URL").filter(|s| !s.trim().is_empty()),
            auto_reconnect: env.bool("KIWOOM_AUTO_RECONNECT", defaults.auto_reconnect),
            max_reconnect_attempts: env.parse(
                "KIWOOM_MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            ),
            reconnect_delay_initial: env.millis(
                "KIWOOM_RECONNECT_DELAY_INITIAL_MS",
                defaults.reconnect_delay_initial,
            ),
            reconnect_delay_max: env.secs(
                "KIWOOM_RECONNECT_DELAY_MAX_SECS",
                defaults.reconnect_delay_max,
            ),
            reconnect_delay_multiplier: env.parse(
                "KIWOOM_RECONNECT_DELAY_MULTIPLIER",
                defaults.reconnect_delay_multiplier,
            ),
            subscription_limit: env.parse("KIWOOM_SUBSCRIPTION_LIMIT", defaults.subscription_limit),
            login_timeout: env.secs("KIWOOM_LOGIN_TIMEOUT_SECS", defaults.login_timeout),
            heartbeat_interval: env.secs(
                "KIWOOM_HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval,
            ),
            heartbeat_timeout: env.secs("KIWOOM_HEARTBEAT_TIMEOUT_SECS", defaults.heartbeat_timeout),
            dispatch_queue_capacity: env
                .parse(
                    "KIWOOM_DISPATCH_QUEUE_CAPACITY",
                    defaults.dispatch_queue_capacity,
                )
                .max(1),
            health_port: env.parse("KIWOOM_HEALTH_PORT", defaults.health_port),
            symbols: lookup("KIWOOM_SYMBOLS")
                .map(|s| parse_symbols(&s))
                .unwrap_or_default(),
            ..defaults
        })
    }

    /// Endpoint to connect to.
    #[must_use]
    pub fn ws_url(&self) -> &str {
        self.url
            .as_deref()
            .unwrap_or_else(|| self.environment.ws_url())
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
}

/// Load `.env` from the current directory or the nearest ancestor holding one.
pub fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

fn parse_symbols(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Optional-variable parsing with fallback to defaults.
struct Env<'a, F>(&'a F);

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        (self.0)(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn bool(&self, key: &str, default: bool) -> bool {
        match (self.0)(key).map(|v| v.trim().to_lowercase()).as_deref() {
            Some("1" | "true" | "yes" | "on") => true,
            Some("0" | "false" | "no" | "off") => false,
            _ => default,
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        (self.0)(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        (self.0)(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }
}
