/// Relay configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string.
    pub database_url: String,
    /// Redis connection string (shared presence/membership store and broker).
    pub redis_url: String,
    /// HMAC secret used to validate bearer credentials on the handshake.
    pub auth_secret: String,
    /// Identity of this server process in the fleet. Presence records and
    /// instance client sets are keyed by it, so it must survive restarts of
    /// the same deployment slot for startup reconciliation to work.
    pub instance_id: String,
    /// Port the server binds to.
    pub port: u16,
    /// Optional Expo access token for the push API.
    pub expo_access_token: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        Self {
            database_url: required_var("DATABASE_URL"),
            redis_url: required_var("REDIS_URL"),
            auth_secret: required_var("AUTH_SECRET"),
            instance_id: std::env::var("INSTANCE_ID")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| cove_common::id::prefixed_ulid("ins")),
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4010),
            expo_access_token: std::env::var("EXPO_ACCESS_TOKEN")
                .ok()
                .filter(|s| !s.is_empty()),
        }
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}
