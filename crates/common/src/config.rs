use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{TurnstileError, TurnstileResult};

/// Longest accepted rate limit window: one week.
pub const MAX_WINDOW_SECS: u64 = 7 * 24 * 60 * 60;

/// Top-level configuration for the throttling front.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Base URL of the protected application, e.g. `http://127.0.0.1:3000`.
    #[serde(default = "default_upstream")]
    pub upstream: String,
    #[serde(default = "default_body_limit")]
    pub body_limit: usize,
    #[serde(default)]
    pub admin: AdminConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            upstream: default_upstream(),
            body_limit: default_body_limit(),
            admin: AdminConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_admin_listen")]
    pub listen: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_admin_listen(),
        }
    }
}

/// Rate limiting settings as written in the config file.
///
/// Two limiters are built from these: a lenient `general` one guarding every
/// route and a strict `auth` one guarding the paths in `auth_paths`. Both share
/// the window and the trusted proxy list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Requests per window for all routes.
    #[serde(default = "default_general_rpw")]
    pub general_rpw: u64,
    /// Requests per window for authentication routes.
    #[serde(default = "default_auth_rpw")]
    pub auth_rpw: u64,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Exact peer addresses allowed to supply `X-Forwarded-For` / `X-Real-IP`.
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_auth_paths")]
    pub auth_paths: Vec<String>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            general_rpw: default_general_rpw(),
            auth_rpw: default_auth_rpw(),
            window_secs: default_window_secs(),
            trusted_proxies: Vec::new(),
            sweep_interval_secs: default_sweep_interval_secs(),
            auth_paths: default_auth_paths(),
        }
    }
}

// Default value helpers
fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_upstream() -> String {
    "http://127.0.0.1:3000".to_string()
}
fn default_body_limit() -> usize {
    10 * 1024 * 1024
}
fn default_true() -> bool {
    true
}
fn default_admin_listen() -> String {
    "127.0.0.1:9090".to_string()
}
fn default_general_rpw() -> u64 {
    100
}
fn default_auth_rpw() -> u64 {
    5
}
fn default_window_secs() -> u64 {
    60
}
fn default_sweep_interval_secs() -> u64 {
    300
}
fn default_auth_paths() -> Vec<String> {
    vec!["/api/auth".to_string(), "/web/auth".to_string()]
}

impl AppConfig {
    /// Load configuration from a YAML file, then apply environment overrides.
    pub fn load(path: &str) -> TurnstileResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Self = serde_yaml::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `RATE_LIMIT_GENERAL`, `RATE_LIMIT_AUTH`, `RATE_LIMIT_WINDOW` and
    /// `TRUSTED_PROXIES` from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    ///
    /// Numeric values that fail to parse are logged and ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let rl = &mut self.rate_limit;
        override_u64(&lookup, "RATE_LIMIT_GENERAL", &mut rl.general_rpw);
        override_u64(&lookup, "RATE_LIMIT_AUTH", &mut rl.auth_rpw);
        override_u64(&lookup, "RATE_LIMIT_WINDOW", &mut rl.window_secs);

        if let Some(raw) = lookup("TRUSTED_PROXIES") {
            rl.trusted_proxies = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> TurnstileResult<()> {
        let server = &self.server;
        if server.listen.trim().is_empty() {
            return Err(config_err("server.listen must not be empty"));
        }
        if !(server.upstream.starts_with("http://") || server.upstream.starts_with("https://")) {
            return Err(config_err(format!(
                "server.upstream must be an http(s) URL, got '{}'",
                server.upstream
            )));
        }
        if server.admin.enabled && server.admin.listen.trim().is_empty() {
            return Err(config_err("server.admin.listen must not be empty"));
        }

        let rl = &self.rate_limit;
        if rl.general_rpw == 0 {
            return Err(config_err("rate_limit.general_rpw must be greater than zero"));
        }
        if rl.auth_rpw == 0 {
            return Err(config_err("rate_limit.auth_rpw must be greater than zero"));
        }
        if rl.window_secs == 0 {
            return Err(config_err("rate_limit.window_secs must be greater than zero"));
        }
        if rl.window_secs > MAX_WINDOW_SECS {
            return Err(config_err(format!(
                "rate_limit.window_secs must be at most {}, got {}",
                MAX_WINDOW_SECS, rl.window_secs
            )));
        }
        if rl.sweep_interval_secs == 0 {
            return Err(config_err(
                "rate_limit.sweep_interval_secs must be greater than zero",
            ));
        }

        for path in &rl.auth_paths {
            if !path.starts_with('/') || path == "/" || path.ends_with('/') {
                return Err(config_err(format!(
                    "rate_limit.auth_paths entry '{}' must start with '/', not be '/', and have no trailing '/'",
                    path
                )));
            }
        }

        Ok(())
    }
}

fn override_u64<F>(lookup: &F, name: &str, target: &mut u64)
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return;
    };
    match raw.trim().parse::<u64>() {
        Ok(value) => *target = value,
        Err(e) => warn!(variable = name, value = %raw, error = %e, "ignoring invalid override"),
    }
}

fn config_err(msg: impl Into<String>) -> TurnstileError {
    TurnstileError::Config(msg.into())
}
