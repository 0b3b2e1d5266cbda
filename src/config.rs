// Process configuration loaded from environment variables

//! Environment-driven settings.
//!
//! Every recognized variable has a default so a bare `cargo run` starts a
//! working single-node instance against the in-memory store. Durations are
//! configured in milliseconds (`*_MS` suffix) and surfaced as
//! [`std::time::Duration`].

use std::env;
use std::time::Duration;

/// Top-level settings, one sub-struct per subsystem
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub store: StoreSettings,
    pub auth: AuthSettings,
    pub rate_limit: RateLimitSettings,
    pub engine: EngineSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub port: u16,
    pub log_level: String,
    /// Per-HTTP-request timeout
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Backend URI. `memory://` selects the in-memory document store
    pub uri: String,
    pub pool_min: usize,
    pub pool_max: usize,
    pub connect_timeout: Duration,
    pub monitor_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub signing_secret: String,
    pub token_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub window: Duration,
    pub max_per_window: u64,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub default_agent_timeout: Duration,
    pub cancel_grace: Duration,
    pub retry_max_attempts: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                port: 3000,
                log_level: "info".to_string(),
                request_timeout: Duration::from_secs(30),
            },
            store: StoreSettings {
                uri: "memory://".to_string(),
                pool_min: 2,
                pool_max: 10,
                connect_timeout: Duration::from_secs(10),
                monitor_interval: Duration::from_secs(60),
            },
            auth: AuthSettings {
                signing_secret: "flowforge-dev-secret".to_string(),
                token_ttl: Duration::from_secs(24 * 60 * 60),
            },
            rate_limit: RateLimitSettings {
                window: Duration::from_secs(60),
                max_per_window: 100,
            },
            engine: EngineSettings {
                default_agent_timeout: Duration::from_secs(60),
                cancel_grace: Duration::from_secs(30),
                retry_max_attempts: 5,
            },
        }
    }
}

impl Settings {
    /// Read settings from the process environment, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Settings::default();
        Settings {
            server: ServerSettings {
                port: env_parse("PORT", defaults.server.port),
                log_level: env_string("LOG_LEVEL", &defaults.server.log_level),
                request_timeout: env_millis("HTTP_REQUEST_TIMEOUT_MS", defaults.server.request_timeout),
            },
            store: StoreSettings {
                uri: env_string("STORE_URI", &defaults.store.uri),
                pool_min: env_parse("STORE_POOL_MIN", defaults.store.pool_min),
                pool_max: env_parse("STORE_POOL_MAX", defaults.store.pool_max),
                connect_timeout: env_millis("STORE_CONNECT_TIMEOUT_MS", defaults.store.connect_timeout),
                monitor_interval: env_millis(
                    "STORE_MONITOR_INTERVAL_MS",
                    defaults.store.monitor_interval,
                ),
            },
            auth: AuthSettings {
                signing_secret: env_string("AUTH_SIGNING_SECRET", &defaults.auth.signing_secret),
                token_ttl: env_millis("AUTH_TOKEN_TTL_MS", defaults.auth.token_ttl),
            },
            rate_limit: RateLimitSettings {
                window: env_millis("RATE_LIMIT_WINDOW_MS", defaults.rate_limit.window),
                max_per_window: env_parse("RATE_LIMIT_MAX_PER_WINDOW", defaults.rate_limit.max_per_window),
            },
            engine: EngineSettings {
                default_agent_timeout: env_millis(
                    "AGENT_DEFAULT_TIMEOUT_MS",
                    defaults.engine.default_agent_timeout,
                ),
                cancel_grace: env_millis("EXECUTION_CANCEL_GRACE_MS", defaults.engine.cancel_grace),
                retry_max_attempts: env_parse("RETRY_MAX_ATTEMPTS", defaults.engine.retry_max_attempts),
            },
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = Settings::default();
        assert_eq!(settings.rate_limit.max_per_window, 100);
        assert_eq!(settings.engine.retry_max_attempts, 5);
        assert_eq!(settings.engine.default_agent_timeout, Duration::from_secs(60));
        assert!(settings.store.pool_min <= settings.store.pool_max);
    }

    #[test]
    fn env_overrides_apply() {
        std::env::set_var("RATE_LIMIT_MAX_PER_WINDOW", "7");
        std::env::set_var("AGENT_DEFAULT_TIMEOUT_MS", "1500");
        let settings = Settings::from_env();
        assert_eq!(settings.rate_limit.max_per_window, 7);
        assert_eq!(
            settings.engine.default_agent_timeout,
            Duration::from_millis(1500)
        );
        std::env::remove_var("RATE_LIMIT_MAX_PER_WINDOW");
        std::env::remove_var("AGENT_DEFAULT_TIMEOUT_MS");
    }
}
