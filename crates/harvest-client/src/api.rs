//! HTTP client for the Store API: URL intake, task queue, material saves and
//! session state.

use harvest_core::chunk::UrlChunk;
use harvest_core::error::AppError;
use harvest_core::models::ProductRecord;
use harvest_core::session::{ResetOutcome, SessionState};
use harvest_core::task::{ClaimRequest, SaveSummary, UrlResult, UrlTask};
use harvest_core::traits::{SessionApi, TaskStore, UrlSink};
use hmac::{Hmac, Mac};
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use sha2::Sha256;

use crate::config::ApiConfig;

type HmacSha256 = Hmac<Sha256>;

const USER_AGENT: &str = concat!("harvest/", env!("CARGO_PKG_VERSION"));

/// Longest response body excerpt kept in an error message.
const BODY_EXCERPT_CHARS: usize = 200;

#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    config: ApiConfig,
    session_id: Option<String>,
    supplier: String,
}

#[derive(Debug, Deserialize)]
struct ClaimResponse {
    #[serde(default = "assume_success")]
    success: bool,
    #[serde(default)]
    urls: Vec<UrlTask>,
}

fn assume_success() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct SaveResponse {
    #[serde(default)]
    summary: SaveSummary,
}

#[derive(Debug, Deserialize)]
struct StateResponse {
    data: Option<SessionState>,
}

impl ApiClient {
    pub fn new(config: ApiConfig) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.timeout)
            .build()
            .map_err(|e| AppError::ConfigError(format!("Cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            config,
            session_id: None,
            supplier: String::new(),
        })
    }

    /// Session attached to material saves.
    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    /// Supplier named in material saves.
    pub fn with_supplier(mut self, supplier: impl Into<String>) -> Self {
        self.supplier = supplier.into();
        self
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.callback_token {
            Some(token) => request
                .header("X-Parser-Token", token)
                .bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, AppError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, self.config.timeout.as_secs()))?;
        check_status(response).await
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, AppError> {
        let response = self
            .send(self.client.post(self.endpoint(path)).json(body))
            .await?;
        read_json(response).await
    }
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, AppError> {
    let body = response
        .text()
        .await
        .map_err(|e| AppError::NetworkError(format!("Failed to read response body: {e}")))?;
    Ok(serde_json::from_str(&body)?)
}

/// Hex HMAC-SHA256 of `body` under `secret`.
pub fn sign(body: &[u8], secret: &str) -> Result<String, AppError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::ConfigError(format!("Invalid HMAC secret: {e}")))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn map_reqwest_error(e: reqwest::Error, timeout_secs: u64) -> AppError {
    if e.is_timeout() {
        AppError::Timeout(timeout_secs)
    } else if e.is_connect() {
        AppError::NetworkError(format!("Connection failed: {e}"))
    } else {
        AppError::NetworkError(e.to_string())
    }
}

async fn check_status(response: Response) -> Result<Response, AppError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(AppError::HttpStatus {
        status: status.as_u16(),
        message: body.chars().take(BODY_EXCERPT_CHARS).collect(),
    })
}

impl UrlSink for ApiClient {
    async fn send_chunk(&self, chunk: &UrlChunk) -> Result<u16, AppError> {
        let secret = self.config.hmac_secret.as_deref().ok_or_else(|| {
            AppError::ConfigError("save-urls requires an HMAC secret (PARSER_HMAC_SECRET)".into())
        })?;
        // The signature covers the exact bytes on the wire.
        let body = chunk.canonical_bytes()?;
        let request = self
            .client
            .post(self.endpoint("parsing/save-urls"))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header("X-HMAC-Signature", sign(&body, secret)?);
        let response = self.send(request.body(body)).await?;
        Ok(response.status().as_u16())
    }
}

impl TaskStore for ApiClient {
    async fn claim(&self, request: &ClaimRequest) -> Result<Vec<UrlTask>, AppError> {
        let body = serde_json::to_value(request)?;
        let response: ClaimResponse = self.post_json("parser/urls/claim", &body).await?;
        if !response.success {
            return Ok(Vec::new());
        }
        Ok(response.urls)
    }

    async fn report(&self, results: &[UrlResult]) -> Result<(), AppError> {
        if results.is_empty() {
            return Ok(());
        }
        let body = json!({ "results": results });
        self.send(self.client.post(self.endpoint("parser/urls/report")).json(&body))
            .await?;
        Ok(())
    }

    async fn release(&self, worker_id: &str) -> Result<(), AppError> {
        let body = json!({ "worker_id": worker_id });
        self.send(self.client.post(self.endpoint("parser/urls/release")).json(&body))
            .await?;
        Ok(())
    }

    async fn save_materials(&self, records: &[ProductRecord]) -> Result<SaveSummary, AppError> {
        let body = json!({
            "session_id": self.session_id,
            "supplier": self.supplier,
            "materials": records,
        });
        let response: SaveResponse = self.post_json("parser/materials/batch", &body).await?;
        Ok(response.summary)
    }
}

impl SessionApi for ApiClient {
    async fn session_state(&self, session_id: &str) -> Result<SessionState, AppError> {
        let path = format!("parsing/sessions/{session_id}/state");
        let request = self
            .client
            .get(self.endpoint(&path))
            .header(reqwest::header::ACCEPT, "application/json");
        let response: StateResponse = read_json(self.send(request).await?).await?;
        response
            .data
            .ok_or_else(|| AppError::SessionError(format!("No state for session {session_id}")))
    }

    async fn full_scan_reset(&self, supplier: &str) -> Result<ResetOutcome, AppError> {
        let body = json!({ "supplier_name": supplier });
        self.post_json("parser/urls/full-scan-reset", &body).await
    }
}
