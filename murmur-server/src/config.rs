//! Server configuration.

use std::time::Duration;

use clap::Parser;

/// Secret used when none is configured. Fine for local runs only.
pub const DEV_TOKEN_SECRET: &str = "murmur-dev-secret-change-me";

#[derive(Parser, Debug, Clone)]
#[command(name = "murmur-server", about = "Real-time direct-messaging relay")]
pub struct ServerConfig {
    /// Address for the HTTP/WebSocket listener.
    #[arg(long, env = "MURMUR_LISTEN_ADDR", default_value = "127.0.0.1:8080")]
    pub listen_addr: String,

    /// SQLite database path. In-memory when omitted.
    #[arg(long, env = "MURMUR_DB_PATH")]
    pub db_path: Option<String>,

    /// HMAC secret for bearer tokens.
    #[arg(long, env = "MURMUR_TOKEN_SECRET", default_value = DEV_TOKEN_SECRET, hide_env_values = true)]
    pub token_secret: String,

    /// Messages replayed to a connection when it joins.
    #[arg(long, env = "MURMUR_HISTORY_LIMIT", default_value_t = 50)]
    pub history_limit: usize,

    /// Maximum message length in bytes (after trimming).
    #[arg(long, env = "MURMUR_MAX_MESSAGE_LEN", default_value_t = 4096)]
    pub max_message_len: usize,

    /// Outbound events queued per connection before it is considered stuck.
    #[arg(long, env = "MURMUR_OUTBOUND_BUFFER", default_value_t = 256)]
    pub outbound_buffer: usize,

    /// Seconds between WebSocket pings.
    #[arg(long, env = "MURMUR_PING_INTERVAL_SECS", default_value_t = 30)]
    pub ping_interval_secs: u64,

    /// Close a connection after this many seconds without inbound frames.
    #[arg(long, env = "MURMUR_IDLE_TIMEOUT_SECS", default_value_t = 90)]
    pub idle_timeout_secs: u64,

    /// Events per second a joined connection may send (token bucket).
    #[arg(long, env = "MURMUR_RATE_LIMIT", default_value_t = 10)]
    pub rate_limit: u32,

    /// Allowed CORS origin. Any origin when omitted.
    #[arg(long, env = "MURMUR_CORS_ORIGIN")]
    pub cors_origin: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            db_path: None,
            token_secret: DEV_TOKEN_SECRET.to_string(),
            history_limit: 50,
            max_message_len: 4096,
            outbound_buffer: 256,
            ping_interval_secs: 30,
            idle_timeout_secs: 90,
            rate_limit: 10,
            cors_origin: None,
        }
    }
}

impl ServerConfig {
    pub fn uses_dev_secret(&self) -> bool {
        self.token_secret == DEV_TOKEN_SECRET
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.max(1))
    }
}
