use std::time::Duration;

use harvest_core::error::AppError;
use url::Url;

const DEFAULT_API_TIMEOUT_SECS: u64 = 10;

/// Connection settings for the Store and callback endpoints.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Base URL of the Store API, without a trailing slash.
    pub api_url: String,
    pub hmac_secret: Option<String>,
    pub callback_token: Option<String>,
    /// Callback endpoint; defaults to `{api_url}/internal/parser/callback`.
    pub callback_url: String,
    /// Timeout of every control-plane request.
    pub timeout: Duration,
}

impl ApiConfig {
    pub fn new(api_url: &str) -> Result<Self, AppError> {
        let api_url = normalize_base(api_url)?;
        Ok(Self {
            callback_url: format!("{api_url}/internal/parser/callback"),
            api_url,
            hmac_secret: None,
            callback_token: None,
            timeout: Duration::from_secs(DEFAULT_API_TIMEOUT_SECS),
        })
    }

    /// Load from `PARSER_*` environment variables.
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let api_url = get("PARSER_API_URL")
            .ok_or_else(|| AppError::ConfigError("PARSER_API_URL is not set".into()))?;
        let mut config = Self::new(&api_url)?;

        config.hmac_secret = get("PARSER_HMAC_SECRET");
        config.callback_token = get("PARSER_CALLBACK_TOKEN");
        if let Some(url) = get("PARSER_CALLBACK_URL") {
            Url::parse(&url).map_err(|e| {
                AppError::ConfigError(format!("PARSER_CALLBACK_URL is invalid: {e}"))
            })?;
            config.callback_url = url;
        }
        if let Some(raw) = get("PARSER_API_TIMEOUT_SECS") {
            let secs: u64 = raw.parse().map_err(|_| {
                AppError::ConfigError(format!("PARSER_API_TIMEOUT_SECS must be an integer, got '{raw}'"))
            })?;
            if secs == 0 {
                return Err(AppError::ConfigError(
                    "PARSER_API_TIMEOUT_SECS must be at least 1".into(),
                ));
            }
            config.timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }

    pub fn with_hmac_secret(mut self, secret: impl Into<String>) -> Self {
        self.hmac_secret = Some(secret.into());
        self
    }

    pub fn with_callback_token(mut self, token: impl Into<String>) -> Self {
        self.callback_token = Some(token.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Validate and strip a trailing `/` and a legacy `/parsing/save-urls` suffix.
fn normalize_base(raw: &str) -> Result<String, AppError> {
    Url::parse(raw)
        .map_err(|e| AppError::ConfigError(format!("PARSER_API_URL is invalid: {e}")))?;
    let trimmed = raw.trim_end_matches('/');
    let trimmed = trimmed.strip_suffix("/parsing/save-urls").unwrap_or(trimmed);
    Ok(trimmed.to_string())
}
