//! Configuration Module
//!
//! Configuration loading for the streaming session.

mod settings;

pub use settings::{
    ConfigError, DEFAULT_DISPATCH_QUEUE_CAPACITY, DEFAULT_HEALTH_PORT, Environment,
    PRODUCTION_WS_URL, SANDBOX_WS_URL, StreamConfig, load_dotenv,
};
