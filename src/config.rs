use std::env;
use std::time::Duration;
#[cfg(test)]
use std::sync::Mutex;

pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;

/// Bedside client configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the translation backend (defaults to localhost:8000)
    pub backend_url: String,
    /// Delay between steady-state message polls
    pub poll_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let backend = env::var("BEDSIDE_BACKEND_URL")
            .unwrap_or_else(|_| DEFAULT_BACKEND_URL.to_string());
        // Normalize localhost to IPv4 to avoid IPv6 (::1) preference on macOS
        let backend = if backend.contains("//localhost") {
            backend.replacen("//localhost", "//127.0.0.1", 1)
        } else if backend.starts_with("localhost") {
            backend.replacen("localhost", "127.0.0.1", 1)
        } else {
            backend
        };
        let poll_interval = env::var("BEDSIDE_POLL_INTERVAL_MS")
            .ok()
            .and_then(|raw| raw.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(DEFAULT_POLL_INTERVAL_MS));
        Self { backend_url: backend, poll_interval }
    }

    /// Apply a command-line override on top of the environment values
    pub fn with_backend_url(mut self, backend: Option<String>) -> Self {
        if let Some(backend) = backend {
            self.backend_url = backend;
        }
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}
