use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::ExecutionMode;
use crate::error::{AppError, ErrorCode, ExtractError};
use crate::models::ProductRecord;

/// Hard ceiling on concurrent execution contexts per worker.
pub const MAX_CONCURRENCY: usize = 5;

/// Outcome status reported to the Store for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Done,
    Failed,
    Blocked,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Done => "done",
            ResultStatus::Failed => "failed",
            ResultStatus::Blocked => "blocked",
        }
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ResultStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "done" => Ok(ResultStatus::Done),
            "failed" => Ok(ResultStatus::Failed),
            "blocked" => Ok(ResultStatus::Blocked),
            _ => Err(format!("Unknown result status: {}", s)),
        }
    }
}

/// A claimed unit of extraction work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlTask {
    #[serde(alias = "supplier_url_id")]
    pub id: u64,
    pub url: String,
    #[serde(default, alias = "supplier_name")]
    pub supplier: String,
    #[serde(default)]
    pub material_type: Option<String>,
}

/// Result of one extraction attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrlResult {
    pub id: u64,
    pub status: ResultStatus,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
    pub parsed_at: DateTime<Utc>,
    /// Record to persist; never part of the report payload.
    #[serde(skip)]
    pub record: Option<ProductRecord>,
}

impl UrlResult {
    /// Map a successful extraction. A record without a usable price is still
    /// kept for saving but reported as `PRICE_PARSE_FAILED`.
    pub fn from_record(task: &UrlTask, record: ProductRecord) -> Self {
        let parsed_at = record.parsed_at;
        if record.has_price() {
            Self {
                id: task.id,
                status: ResultStatus::Done,
                error_code: None,
                error_message: None,
                parsed_at,
                record: Some(record),
            }
        } else {
            Self {
                id: task.id,
                status: ResultStatus::Failed,
                error_code: Some(ErrorCode::PriceParseFailed),
                error_message: Some("Price not found or unparseable".to_string()),
                parsed_at,
                record: Some(record),
            }
        }
    }

    /// Map a page-level failure. Callers must route environment failures to
    /// fail-fast instead.
    pub fn from_error(task: &UrlTask, error: &ExtractError) -> Self {
        let code = error.code();
        let status = if code.is_blocking() {
            ResultStatus::Blocked
        } else {
            ResultStatus::Failed
        };
        Self {
            id: task.id,
            status,
            error_code: Some(code),
            error_message: Some(error.to_string()),
            parsed_at: Utc::now(),
            record: None,
        }
    }

    /// Failure report for an item whose batch save was rejected.
    pub fn save_error(&self, message: &str) -> Self {
        Self {
            id: self.id,
            status: ResultStatus::Failed,
            error_code: Some(ErrorCode::SaveError),
            error_message: Some(message.to_string()),
            parsed_at: self.parsed_at,
            record: None,
        }
    }

    /// Copy of this result without the record, ready for reporting.
    pub fn to_report(&self) -> Self {
        Self {
            record: None,
            ..self.clone()
        }
    }
}

/// Request body of a claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub supplier: String,
    pub batch_size: usize,
    pub worker_id: String,
    pub reparse_days: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub material_type: Option<String>,
}

/// Summary returned by a batch save.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveSummary {
    #[serde(default)]
    pub success: u64,
    #[serde(default)]
    pub failed: u64,
}

/// Configuration for a queue worker run.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub supplier: String,
    pub batch_size: usize,
    /// Concurrent execution contexts.
    pub concurrency: usize,
    /// In-flight requests allowed per domain; defaults to `concurrency`.
    pub domain_limit: Option<usize>,
    pub material_type: Option<String>,
    pub reparse_days: u32,
    pub max_batches: Option<u32>,
    /// A strict run fails when its very first claim comes back empty.
    pub strict: bool,
    pub max_empty_claims: u32,
    pub empty_claim_delay: Duration,
    pub nav_timeout: Duration,
    /// Extra navigation attempts, spent on timeouts only.
    pub nav_retries: u32,
    pub flush_threshold: usize,
    pub execution_mode: ExecutionMode,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new("default")
    }
}

impl WorkerConfig {
    pub fn new(supplier: impl Into<String>) -> Self {
        let supplier = supplier.into();
        Self {
            worker_id: format!("{}_{}", supplier, &Uuid::new_v4().simple().to_string()[..8]),
            supplier,
            batch_size: 20,
            concurrency: 3,
            domain_limit: None,
            material_type: None,
            reparse_days: 7,
            max_batches: None,
            strict: false,
            max_empty_claims: 3,
            empty_claim_delay: Duration::from_secs(5),
            nav_timeout: Duration::from_millis(15_000),
            nav_retries: 1,
            flush_threshold: 50,
            execution_mode: ExecutionMode::default(),
        }
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_domain_limit(mut self, limit: usize) -> Self {
        self.domain_limit = Some(limit);
        self
    }

    pub fn with_material_type(mut self, material_type: Option<String>) -> Self {
        self.material_type = material_type;
        self
    }

    pub fn with_reparse_days(mut self, days: u32) -> Self {
        self.reparse_days = days;
        self
    }

    pub fn with_max_batches(mut self, max_batches: Option<u32>) -> Self {
        self.max_batches = max_batches;
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_empty_claim_delay(mut self, delay: Duration) -> Self {
        self.empty_claim_delay = delay;
        self
    }

    pub fn with_nav_timeout(mut self, timeout: Duration) -> Self {
        self.nav_timeout = timeout;
        self
    }

    pub fn with_nav_retries(mut self, retries: u32) -> Self {
        self.nav_retries = retries;
        self
    }

    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    pub fn effective_domain_limit(&self) -> usize {
        self.domain_limit.unwrap_or(self.concurrency)
    }

    /// Reject inconsistent settings instead of silently clamping them.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.batch_size == 0 {
            return Err(AppError::ConfigError("batch_size must be at least 1".into()));
        }
        if self.concurrency == 0 {
            return Err(AppError::ConfigError("concurrency must be at least 1".into()));
        }
        if self.concurrency > MAX_CONCURRENCY {
            return Err(AppError::ConfigError(format!(
                "concurrency {} exceeds the ceiling of {}",
                self.concurrency, MAX_CONCURRENCY
            )));
        }
        let domain_limit = self.effective_domain_limit();
        if domain_limit == 0 || domain_limit > self.concurrency {
            return Err(AppError::ConfigError(format!(
                "domain_limit {} must be between 1 and concurrency ({})",
                domain_limit, self.concurrency
            )));
        }
        if self.max_empty_claims == 0 {
            return Err(AppError::ConfigError(
                "max_empty_claims must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn claim_request(&self) -> ClaimRequest {
        ClaimRequest {
            supplier: self.supplier.clone(),
            batch_size: self.batch_size,
            worker_id: self.worker_id.clone(),
            reparse_days: self.reparse_days,
            material_type: self.material_type.clone(),
        }
    }
}
