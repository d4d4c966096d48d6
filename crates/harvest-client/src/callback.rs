use harvest_core::callback::CallbackEnvelope;
use harvest_core::error::AppError;
use harvest_core::traits::CallbackTransport;
use reqwest::Client;

use crate::config::ApiConfig;

/// Posts callback envelopes to the orchestrator as JSON.
#[derive(Clone)]
pub struct HttpCallbackTransport {
    client: Client,
    url: String,
    timeout_secs: u64,
}

impl HttpCallbackTransport {
    pub fn new(config: &ApiConfig) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AppError::ConfigError(format!("Cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: config.callback_url.clone(),
            timeout_secs: config.timeout.as_secs(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl CallbackTransport for HttpCallbackTransport {
    async fn deliver(&self, envelope: &CallbackEnvelope) -> Result<(), AppError> {
        let response = self
            .client
            .post(&self.url)
            .header("X-Parser-Token", &envelope.token)
            .bearer_auth(&envelope.token)
            .json(envelope)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Timeout(self.timeout_secs)
                } else {
                    AppError::NetworkError(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(AppError::HttpStatus {
            status: status.as_u16(),
            message: body.chars().take(200).collect(),
        })
    }
}
