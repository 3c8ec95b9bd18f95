use std::time::Duration;

use crate::errors::ChatError;

/// Default request timeout for chat streams (ten minutes).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(600_000);

/// Configuration for [`HttpChatTransport`](crate::transport::HttpChatTransport).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportConfig {
    /// Backend origin, for example `http://localhost:8080`.
    pub base_url: String,
    /// Path of the streaming chat endpoint.
    pub chat_path: String,
    /// Path of the multipart upload endpoint.
    pub upload_path: String,
    /// Sent as `Authorization: Bearer <token>` when present.
    pub bearer_token: Option<String>,
    /// Whole-request timeout, including the time spent streaming.
    pub timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            chat_path: "/api/chat".to_string(),
            upload_path: "/api/upload".to_string(),
            bearer_token: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl TransportConfig {
    /// Creates a config for the given backend origin.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Builds a config from the environment.
    ///
    /// - `CHAT_API_BASE_URL`: backend origin (default `http://localhost:8080`).
    /// - `CHAT_API_TOKEN`: optional bearer token.
    /// - `CHAT_API_TIMEOUT_MS`: optional timeout in milliseconds.
    pub fn from_env() -> Result<Self, ChatError> {
        let mut config = Self::default();
        if let Ok(base_url) = std::env::var("CHAT_API_BASE_URL")
            && !base_url.trim().is_empty()
        {
            config.base_url = base_url.trim().to_string();
        }
        if let Ok(token) = std::env::var("CHAT_API_TOKEN") {
            config = config.bearer_token(token);
        }
        if let Ok(raw) = std::env::var("CHAT_API_TIMEOUT_MS") {
            let ms = raw.trim().parse::<u64>().map_err(|e| {
                ChatError::Config(format!("invalid CHAT_API_TIMEOUT_MS {raw:?}: {e}"))
            })?;
            config.timeout = Duration::from_millis(ms);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn chat_path(mut self, path: impl Into<String>) -> Self {
        self.chat_path = path.into();
        self
    }

    pub fn upload_path(mut self, path: impl Into<String>) -> Self {
        self.upload_path = path.into();
        self
    }

    /// Sets the bearer token. Blank tokens clear it.
    pub fn bearer_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.bearer_token = Some(token.trim().to_string()).filter(|t| !t.is_empty());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ChatError> {
        if self.base_url.trim().is_empty() {
            return Err(ChatError::Config("base_url must not be empty".into()));
        }
        if self.timeout.is_zero() {
            return Err(ChatError::Config("timeout must be greater than 0".into()));
        }
        Ok(())
    }

    pub(crate) fn chat_url(&self) -> String {
        join_url(&self.base_url, &self.chat_path)
    }

    pub(crate) fn upload_url(&self) -> String {
        join_url(&self.base_url, &self.upload_path)
    }

    pub(crate) fn timeout_ms(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_backend_layout() {
        let config = TransportConfig::default();
        assert_eq!(config.chat_url(), "http://localhost:8080/api/chat");
        assert_eq!(config.upload_url(), "http://localhost:8080/api/upload");
        assert_eq!(config.timeout_ms(), 600_000);
        assert!(config.bearer_token.is_none());
    }

    #[test]
    fn builders_normalize_paths_and_tokens() {
        let config = TransportConfig::new("https://legal.example/")
            .chat_path("v1/chat/stream")
            .bearer_token("  ")
            .timeout(Duration::from_secs(5));
        assert_eq!(config.chat_url(), "https://legal.example/v1/chat/stream");
        assert_eq!(config.bearer_token, None);
        assert_eq!(config.timeout_ms(), 5_000);
        assert_eq!(
            TransportConfig::default().bearer_token(" t0k ").bearer_token.as_deref(),
            Some("t0k")
        );
    }

    #[test]
    fn validate_rejects_zero_timeout_and_blank_base_url() {
        assert!(TransportConfig::default().timeout(Duration::ZERO).validate().is_err());
        assert!(TransportConfig::new(" ").validate().is_err());
    }
}
