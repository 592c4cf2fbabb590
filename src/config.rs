use std::time::Duration;
use serde::{Deserialize, Serialize};
use tracing::{info, error};

use crate::models::MessageClass;

/// Application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Environment (dev, staging, prod)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// CORS allowed origins (comma separated)
    pub cors_origins: Option<String>,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Identifier of this instance in the fleet. Generated when absent.
    pub instance_id: Option<String>,

    /// JWT secret key used to verify bearer tokens
    pub auth_jwt_secret: Option<String>,

    /// Redis URL. When absent the process-local store is used.
    pub redis_url: Option<String>,

    /// Largest accepted inbound text frame in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Capacity of each connection's outbound queue
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,

    #[serde(default = "default_max_users_per_room")]
    pub max_users_per_room: usize,

    #[serde(default = "default_max_rooms_per_connection")]
    pub max_rooms_per_connection: usize,

    // Rate limiting, fixed window per (user, class)
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,
    #[serde(default = "default_rate_limit_room")]
    pub rate_limit_room: u64,
    #[serde(default = "default_rate_limit_cursor")]
    pub rate_limit_cursor: u64,
    #[serde(default = "default_rate_limit_activity")]
    pub rate_limit_activity: u64,
    #[serde(default = "default_rate_limit_content")]
    pub rate_limit_content: u64,
    #[serde(default = "default_rate_limit_heartbeat")]
    pub rate_limit_heartbeat: u64,

    // Expiry of store records
    #[serde(default = "default_cursor_ttl_secs")]
    pub cursor_ttl_secs: u64,
    #[serde(default = "default_connection_ttl_secs")]
    pub connection_ttl_secs: u64,
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    #[serde(default = "default_room_ttl_secs")]
    pub room_ttl_secs: u64,

    /// Empty rooms older than this are deleted by the sweeper
    #[serde(default = "default_room_cleanup_after_secs")]
    pub room_cleanup_after_secs: u64,

    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Interval between websocket pings and connection record refreshes
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    /// Connections silent for longer than this are closed
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Upper bound for flushing outbound queues on shutdown
    #[serde(default = "default_shutdown_drain_secs")]
    pub shutdown_drain_secs: u64,

    #[serde(default = "default_question_history_len")]
    pub question_history_len: usize,
    #[serde(default = "default_question_history_ttl_secs")]
    pub question_history_ttl_secs: u64,

    /// Check form permissions carried in the token claims
    #[serde(default = "default_true")]
    pub enforce_form_permissions: bool,

    /// How long a verified token stays in the verifier cache
    #[serde(default = "default_auth_cache_ttl_secs")]
    pub auth_cache_ttl_secs: u64,
}

impl Config {
    /// Load configuration from environment variables or app.env file
    pub fn load() -> Result<Self, ConfigError> {
        // Try to load from app.env file first
        if std::path::Path::new("app.env").exists() {
            dotenvy::from_filename("app.env").ok();
        } else {
            // Fallback to .env file
            dotenvy::dotenv().ok();
        }

        // Load from environment variables using envy
        match envy::from_env::<Config>() {
            Ok(config) => {
                config.validate()?;
                info!("✅ Configuration loaded successfully");
                Ok(config)
            }
            Err(e) => {
                error!("❌ Failed to load configuration: {}", e);
                Err(ConfigError::EnvError(e))
            }
        }
    }

    /// Reject values the engine can not run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&str, u64); 9] = [
            ("MAX_MESSAGE_SIZE", self.max_message_size as u64),
            ("OUTBOUND_QUEUE_CAPACITY", self.outbound_queue_capacity as u64),
            ("MAX_USERS_PER_ROOM", self.max_users_per_room as u64),
            ("MAX_ROOMS_PER_CONNECTION", self.max_rooms_per_connection as u64),
            ("RATE_LIMIT_WINDOW_SECS", self.rate_limit_window_secs),
            ("CURSOR_TTL_SECS", self.cursor_ttl_secs),
            ("CONNECTION_TTL_SECS", self.connection_ttl_secs),
            ("PING_INTERVAL_SECS", self.ping_interval_secs),
            ("CLEANUP_INTERVAL_SECS", self.cleanup_interval_secs),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be greater than zero", name)));
            }
        }
        Ok(())
    }

    /// Get the full server address
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if running in development mode
    pub fn is_development(&self) -> bool {
        self.environment.to_lowercase() == "dev" || self.environment.to_lowercase() == "development"
    }

    /// Check if running in production mode
    pub fn is_production(&self) -> bool {
        self.environment.to_lowercase() == "prod" || self.environment.to_lowercase() == "production"
    }

    /// Limit per window for a message class
    pub fn rate_limit_for(&self, class: MessageClass) -> u64 {
        match class {
            MessageClass::Room => self.rate_limit_room,
            MessageClass::Cursor => self.rate_limit_cursor,
            MessageClass::Activity => self.rate_limit_activity,
            MessageClass::Content => self.rate_limit_content,
            MessageClass::Heartbeat => self.rate_limit_heartbeat,
        }
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn cursor_ttl(&self) -> Duration {
        Duration::from_secs(self.cursor_ttl_secs)
    }

    pub fn connection_ttl(&self) -> Duration {
        Duration::from_secs(self.connection_ttl_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn room_ttl(&self) -> Duration {
        Duration::from_secs(self.room_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn shutdown_drain(&self) -> Duration {
        Duration::from_secs(self.shutdown_drain_secs)
    }

    pub fn question_history_ttl(&self) -> Duration {
        Duration::from_secs(self.question_history_ttl_secs)
    }

    /// Allowed CORS origins, empty when unset
    pub fn cors_origin_list(&self) -> Vec<String> {
        self.cors_origins
            .as_deref()
            .map(|origins| {
                origins
                    .split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            environment: default_environment(),
            cors_origins: None,
            log_level: default_log_level(),
            service_name: default_service_name(),
            instance_id: None,
            auth_jwt_secret: None,
            redis_url: None,
            max_message_size: default_max_message_size(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            max_users_per_room: default_max_users_per_room(),
            max_rooms_per_connection: default_max_rooms_per_connection(),
            rate_limit_window_secs: default_rate_limit_window_secs(),
            rate_limit_room: default_rate_limit_room(),
            rate_limit_cursor: default_rate_limit_cursor(),
            rate_limit_activity: default_rate_limit_activity(),
            rate_limit_content: default_rate_limit_content(),
            rate_limit_heartbeat: default_rate_limit_heartbeat(),
            cursor_ttl_secs: default_cursor_ttl_secs(),
            connection_ttl_secs: default_connection_ttl_secs(),
            session_ttl_secs: default_session_ttl_secs(),
            room_ttl_secs: default_room_ttl_secs(),
            room_cleanup_after_secs: default_room_cleanup_after_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            ping_interval_secs: default_ping_interval_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            shutdown_drain_secs: default_shutdown_drain_secs(),
            question_history_len: default_question_history_len(),
            question_history_ttl_secs: default_question_history_ttl_secs(),
            enforce_form_permissions: default_true(),
            auth_cache_ttl_secs: default_auth_cache_ttl_secs(),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    EnvError(envy::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::EnvError(e) => write!(f, "Environment variable error: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8083
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_service_name() -> String {
    "form-collab".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_max_message_size() -> usize {
    16 * 1024
}

fn default_outbound_queue_capacity() -> usize {
    256
}

fn default_max_users_per_room() -> usize {
    100
}

fn default_max_rooms_per_connection() -> usize {
    10
}

fn default_rate_limit_window_secs() -> u64 {
    60
}

fn default_rate_limit_room() -> u64 {
    30
}

fn default_rate_limit_cursor() -> u64 {
    1200
}

fn default_rate_limit_activity() -> u64 {
    300
}

fn default_rate_limit_content() -> u64 {
    120
}

fn default_rate_limit_heartbeat() -> u64 {
    120
}

fn default_cursor_ttl_secs() -> u64 {
    300
}

fn default_connection_ttl_secs() -> u64 {
    120
}

fn default_session_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_room_ttl_secs() -> u64 {
    60 * 60
}

fn default_room_cleanup_after_secs() -> u64 {
    60 * 60
}

fn default_cleanup_interval_secs() -> u64 {
    30
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    90
}

fn default_shutdown_drain_secs() -> u64 {
    10
}

fn default_question_history_len() -> usize {
    50
}

fn default_question_history_ttl_secs() -> u64 {
    60 * 60
}

fn default_true() -> bool {
    true
}

fn default_auth_cache_ttl_secs() -> u64 {
    300
}
