use std::time::Duration;

/// Secret shipped in `.env.example`; refusing it keeps dev tokens out of production.
const PLACEHOLDER_SECRET: &str = "your-secret-key";

/// Upper bound on either token lifetime (one year).
const MAX_TTL_SECS: u64 = 365 * 24 * 3600;

/// Realm API configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HMAC secret used to sign access and refresh tokens.
    pub jwt_secret: String,
    /// Redis connection string. `None` selects the in-memory token store.
    pub redis_url: Option<String>,
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Access-token lifetime in seconds.
    pub access_ttl_secs: u64,
    /// Refresh-token lifetime in seconds.
    pub refresh_ttl_secs: u64,
    /// Capacity of each connection's outbound queue.
    pub outbound_queue: usize,
    /// Interval between server pings on an idle gateway connection.
    pub ping_interval_secs: u64,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        Self {
            jwt_secret: required_var("JWT_SECRET"),
            redis_url: std::env::var("REDIS_URL").ok().filter(|s| !s.is_empty()),
            port: parsed_var("PORT", 4002),
            access_ttl_secs: parsed_var("JWT_ACCESS_TTL_SECS", 15 * 60),
            refresh_ttl_secs: parsed_var("JWT_REFRESH_TTL_SECS", 7 * 24 * 3600),
            outbound_queue: parsed_var("WS_OUTBOUND_QUEUE", 256),
            ping_interval_secs: parsed_var("WS_PING_INTERVAL_SECS", 30),
        }
    }

    /// Reject settings that would make the service insecure or inert.
    pub fn validate(&self) -> Result<(), String> {
        if self.jwt_secret.is_empty() || self.jwt_secret == PLACEHOLDER_SECRET {
            return Err("JWT_SECRET must be set to a non-default value".to_string());
        }
        if self.access_ttl_secs == 0 || self.refresh_ttl_secs == 0 {
            return Err("token TTLs must be positive".to_string());
        }
        if self.access_ttl_secs > MAX_TTL_SECS || self.refresh_ttl_secs > MAX_TTL_SECS {
            return Err(format!("token TTLs must not exceed {MAX_TTL_SECS} seconds"));
        }
        if self.outbound_queue == 0 {
            return Err("WS_OUTBOUND_QUEUE must be at least 1".to_string());
        }
        if self.ping_interval_secs == 0 {
            return Err("WS_PING_INTERVAL_SECS must be positive".to_string());
        }
        Ok(())
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    /// A connection that stays silent this long is considered dead.
    pub fn idle_timeout(&self) -> Duration {
        self.ping_interval() * 2
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}

fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
