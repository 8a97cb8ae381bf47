pub mod config;
pub mod error;

pub use config::{AdminConfig, AppConfig, RateLimitSettings, ServerConfig, MAX_WINDOW_SECS};
pub use error::{TurnstileError, TurnstileResult};
