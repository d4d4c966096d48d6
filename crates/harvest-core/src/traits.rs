use std::future::Future;
use std::time::Duration;

use crate::callback::CallbackEnvelope;
use crate::chunk::UrlChunk;
use crate::error::{AppError, ExtractError};
use crate::models::ProductRecord;
use crate::session::{ResetOutcome, SessionState};
use crate::task::{ClaimRequest, SaveSummary, UrlResult, UrlTask};

/// Timings and sub-resource counters of the last extraction, as far as the
/// extractor can observe them.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PageMetrics {
    pub goto_ms: Option<f64>,
    pub parse_ms: Option<f64>,
    pub requests_blocked: u64,
    pub requests_allowed: u64,
}

/// One supplier adapter bound to one execution context.
///
/// Page-scan methods operate on the page most recently loaded with
/// [`Extractor::open`] and return raw hrefs as found in the markup.
pub trait Extractor: Send {
    fn setup(&mut self) -> impl Future<Output = Result<(), AppError>> + Send;

    fn teardown(&mut self) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Navigate to a product page and extract its record.
    fn extract(
        &mut self,
        url: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<ProductRecord, ExtractError>> + Send;

    /// Load a catalog page for scanning.
    fn open(&mut self, url: &str) -> impl Future<Output = Result<(), ExtractError>> + Send;

    fn scan_products(
        &mut self,
        selector: &str,
    ) -> impl Future<Output = Result<Vec<String>, ExtractError>> + Send;

    fn scan_subcategories(
        &mut self,
        selector: &str,
    ) -> impl Future<Output = Result<Vec<String>, ExtractError>> + Send;

    /// Href of the "next page" control, if the page has one.
    fn next_link(
        &mut self,
        selector: &str,
    ) -> impl Future<Output = Result<Option<String>, ExtractError>> + Send;

    /// Load more content on the current page. Returns false when nothing
    /// more can be loaded.
    fn scroll_more(&mut self) -> impl Future<Output = Result<bool, ExtractError>> + Send;

    /// Drain the metrics recorded since the last call.
    fn take_metrics(&mut self) -> PageMetrics {
        PageMetrics::default()
    }
}

/// Receiver of discovered URL chunks (`save-urls`).
pub trait UrlSink: Send + Sync + Clone {
    /// Deliver one chunk. Returns the HTTP status on success.
    fn send_chunk(&self, chunk: &UrlChunk) -> impl Future<Output = Result<u16, AppError>> + Send;
}

/// Claim/report side of the Store.
pub trait TaskStore: Send + Sync + Clone {
    /// Atomically claim up to `batch_size` tasks. Empty means no work.
    fn claim(
        &self,
        request: &ClaimRequest,
    ) -> impl Future<Output = Result<Vec<UrlTask>, AppError>> + Send;

    fn report(&self, results: &[UrlResult]) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Release every task still held by `worker_id`.
    fn release(&self, worker_id: &str) -> impl Future<Output = Result<(), AppError>> + Send;

    fn save_materials(
        &self,
        records: &[ProductRecord],
    ) -> impl Future<Output = Result<SaveSummary, AppError>> + Send;
}

/// Read-only view of the externally owned session, plus the reset phase.
pub trait SessionApi: Send + Sync + Clone {
    fn session_state(
        &self,
        session_id: &str,
    ) -> impl Future<Output = Result<SessionState, AppError>> + Send;

    fn full_scan_reset(
        &self,
        supplier: &str,
    ) -> impl Future<Output = Result<ResetOutcome, AppError>> + Send;
}

/// Delivers one callback envelope. Retries are the caller's business.
pub trait CallbackTransport: Send + Sync + Clone {
    fn deliver(
        &self,
        envelope: &CallbackEnvelope,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}
