//! Test utilities: mock implementations of all core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use crate::callback::CallbackEnvelope;
use crate::chunk::UrlChunk;
use crate::collector::{CollectEvent, CollectReporter};
use crate::error::{AppError, ExtractError};
use crate::models::{Availability, ProductRecord};
use crate::session::{QueueCounts, ResetOutcome, SessionState};
use crate::task::{ClaimRequest, SaveSummary, UrlResult, UrlTask};
use crate::traits::{CallbackTransport, Extractor, SessionApi, TaskStore, UrlSink};
use crate::worker::{WorkerEvent, WorkerReporter};

// ---------------------------------------------------------------------------
// MockExtractor
// ---------------------------------------------------------------------------

/// Scripted catalog page served by [`MockExtractor`].
#[derive(Debug, Clone, Default)]
pub struct MockPage {
    products: Vec<String>,
    subcategories: Vec<String>,
    next: Option<String>,
    /// Product hrefs visible after each successive scroll.
    scrolls: Vec<Vec<String>>,
}

impl MockPage {
    pub fn products(products: Vec<String>) -> Self {
        Self {
            products,
            ..Self::default()
        }
    }

    pub fn with_subcategories(mut self, subcategories: Vec<String>) -> Self {
        self.subcategories = subcategories;
        self
    }

    pub fn with_next(mut self, href: &str) -> Self {
        self.next = Some(href.to_string());
        self
    }

    pub fn with_scrolls(mut self, scrolls: Vec<Vec<String>>) -> Self {
        self.scrolls = scrolls;
        self
    }
}

/// Mock extractor serving scripted pages and records.
///
/// Unknown catalog pages fail with HTTP 404; unknown product URLs extract
/// [`make_test_record`]. Clones share their call log.
#[derive(Clone, Default)]
pub struct MockExtractor {
    pages: HashMap<String, MockPage>,
    open_errors: HashMap<String, ExtractError>,
    records: HashMap<String, Result<ProductRecord, ExtractError>>,
    open_delay: Duration,
    extract_delay: Duration,
    current: Option<String>,
    scroll_round: usize,
    opened: Arc<Mutex<Vec<String>>>,
    extracted: Arc<Mutex<Vec<String>>>,
    setups: Arc<Mutex<usize>>,
    teardowns: Arc<Mutex<usize>>,
}

impl MockExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: &str, page: MockPage) -> Self {
        self.pages.insert(url.to_string(), page);
        self
    }

    /// Make `open(url)` fail.
    pub fn with_error(mut self, url: &str, error: ExtractError) -> Self {
        self.open_errors.insert(url.to_string(), error);
        self
    }

    pub fn with_record(mut self, url: &str, record: ProductRecord) -> Self {
        self.records.insert(url.to_string(), Ok(record));
        self
    }

    /// Make every `extract(url)` attempt fail.
    pub fn with_extract_error(mut self, url: &str, error: ExtractError) -> Self {
        self.records.insert(url.to_string(), Err(error));
        self
    }

    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub fn with_extract_delay(mut self, delay: Duration) -> Self {
        self.extract_delay = delay;
        self
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }

    /// Every extraction attempt, retries included.
    pub fn extracted(&self) -> Vec<String> {
        self.extracted.lock().unwrap().clone()
    }

    pub fn setup_count(&self) -> usize {
        *self.setups.lock().unwrap()
    }

    pub fn teardown_count(&self) -> usize {
        *self.teardowns.lock().unwrap()
    }

    fn current_page(&self) -> Result<&MockPage, ExtractError> {
        self.current
            .as_ref()
            .and_then(|url| self.pages.get(url))
            .ok_or_else(|| ExtractError::SelectorNotFound("no page loaded".into()))
    }
}

impl Extractor for MockExtractor {
    async fn setup(&mut self) -> Result<(), AppError> {
        *self.setups.lock().unwrap() += 1;
        Ok(())
    }

    async fn teardown(&mut self) -> Result<(), AppError> {
        *self.teardowns.lock().unwrap() += 1;
        Ok(())
    }

    async fn extract(&mut self, url: &str, _timeout: Duration) -> Result<ProductRecord, ExtractError> {
        self.extracted.lock().unwrap().push(url.to_string());
        if !self.extract_delay.is_zero() {
            tokio::time::sleep(self.extract_delay).await;
        }
        match self.records.get(url) {
            Some(outcome) => outcome.clone(),
            None => Ok(make_test_record(url)),
        }
    }

    async fn open(&mut self, url: &str) -> Result<(), ExtractError> {
        self.opened.lock().unwrap().push(url.to_string());
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        if let Some(error) = self.open_errors.get(url) {
            return Err(error.clone());
        }
        if !self.pages.contains_key(url) {
            return Err(ExtractError::HttpStatus(404));
        }
        self.current = Some(url.to_string());
        self.scroll_round = 0;
        Ok(())
    }

    async fn scan_products(&mut self, _selector: &str) -> Result<Vec<String>, ExtractError> {
        let round = self.scroll_round;
        let page = self.current_page()?;
        if round == 0 {
            Ok(page.products.clone())
        } else {
            Ok(page.scrolls[round - 1].clone())
        }
    }

    async fn scan_subcategories(&mut self, _selector: &str) -> Result<Vec<String>, ExtractError> {
        Ok(self.current_page()?.subcategories.clone())
    }

    async fn next_link(&mut self, _selector: &str) -> Result<Option<String>, ExtractError> {
        Ok(self.current_page()?.next.clone())
    }

    async fn scroll_more(&mut self) -> Result<bool, ExtractError> {
        let available = self.current_page()?.scrolls.len();
        if self.scroll_round < available {
            self.scroll_round += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

// ---------------------------------------------------------------------------
// MockStore
// ---------------------------------------------------------------------------

/// Mock Store that hands out scripted batches and records every call.
#[derive(Clone, Default)]
pub struct MockStore {
    batches: Arc<Mutex<VecDeque<Vec<UrlTask>>>>,
    claims: Arc<Mutex<Vec<ClaimRequest>>>,
    reported: Arc<Mutex<Vec<UrlResult>>>,
    released: Arc<Mutex<Vec<String>>>,
    saved: Arc<Mutex<Vec<Vec<ProductRecord>>>>,
    save_error: Arc<Mutex<Option<u16>>>,
}

impl MockStore {
    /// Creates a store with no work.
    pub fn new() -> Self {
        Self::default()
    }

    /// Each claim pops the next batch; an exhausted queue claims nothing.
    pub fn with_batches(batches: Vec<Vec<UrlTask>>) -> Self {
        Self {
            batches: Arc::new(Mutex::new(batches.into())),
            ..Self::default()
        }
    }

    /// Make every `save_materials` call fail with this HTTP status.
    pub fn with_save_error(self, status: u16) -> Self {
        *self.save_error.lock().unwrap() = Some(status);
        self
    }

    pub fn claim_count(&self) -> usize {
        self.claims.lock().unwrap().len()
    }

    pub fn claims(&self) -> Vec<ClaimRequest> {
        self.claims.lock().unwrap().clone()
    }

    pub fn reported(&self) -> Vec<UrlResult> {
        self.reported.lock().unwrap().clone()
    }

    pub fn released(&self) -> Vec<String> {
        self.released.lock().unwrap().clone()
    }

    /// Batches passed to `save_materials`, failed attempts included.
    pub fn saved_batches(&self) -> Vec<Vec<ProductRecord>> {
        self.saved.lock().unwrap().clone()
    }
}

impl TaskStore for MockStore {
    async fn claim(&self, request: &ClaimRequest) -> Result<Vec<UrlTask>, AppError> {
        self.claims.lock().unwrap().push(request.clone());
        Ok(self.batches.lock().unwrap().pop_front().unwrap_or_default())
    }

    async fn report(&self, results: &[UrlResult]) -> Result<(), AppError> {
        self.reported
            .lock()
            .unwrap()
            .extend(results.iter().map(UrlResult::to_report));
        Ok(())
    }

    async fn release(&self, worker_id: &str) -> Result<(), AppError> {
        self.released.lock().unwrap().push(worker_id.to_string());
        Ok(())
    }

    async fn save_materials(&self, records: &[ProductRecord]) -> Result<SaveSummary, AppError> {
        self.saved.lock().unwrap().push(records.to_vec());
        if let Some(status) = *self.save_error.lock().unwrap() {
            return Err(AppError::HttpStatus {
                status,
                message: "save rejected".into(),
            });
        }
        Ok(SaveSummary {
            success: records.len() as u64,
            failed: 0,
        })
    }
}

// ---------------------------------------------------------------------------
// MockSink
// ---------------------------------------------------------------------------

/// Mock URL sink. Each call pops the first scripted response; an empty
/// queue answers 200.
#[derive(Clone, Default)]
pub struct MockSink {
    responses: Arc<Mutex<Vec<Result<u16, AppError>>>>,
    attempted: Arc<Mutex<Vec<UrlChunk>>>,
    sent: Arc<Mutex<Vec<UrlChunk>>>,
}

impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses(responses: Vec<Result<u16, AppError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            ..Self::default()
        }
    }

    /// Chunks that were accepted.
    pub fn sent_chunks(&self) -> Vec<UrlChunk> {
        self.sent.lock().unwrap().clone()
    }

    /// Every chunk handed to the sink, failed sends included.
    pub fn attempted_chunks(&self) -> Vec<UrlChunk> {
        self.attempted.lock().unwrap().clone()
    }
}

impl UrlSink for MockSink {
    async fn send_chunk(&self, chunk: &UrlChunk) -> Result<u16, AppError> {
        self.attempted.lock().unwrap().push(chunk.clone());
        let response = {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(200)
            } else {
                responses.remove(0)
            }
        };
        if response.is_ok() {
            self.sent.lock().unwrap().push(chunk.clone());
        }
        response
    }
}

// ---------------------------------------------------------------------------
// MockTransport
// ---------------------------------------------------------------------------

/// Mock callback transport with the same response-queue semantics as
/// [`MockSink`].
#[derive(Clone, Default)]
pub struct MockTransport {
    responses: Arc<Mutex<Vec<Result<(), AppError>>>>,
    attempts: Arc<Mutex<usize>>,
    delivered: Arc<Mutex<Vec<CallbackEnvelope>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses(responses: Vec<Result<(), AppError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            ..Self::default()
        }
    }

    pub fn delivered(&self) -> Vec<CallbackEnvelope> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        *self.attempts.lock().unwrap()
    }
}

impl CallbackTransport for MockTransport {
    async fn deliver(&self, envelope: &CallbackEnvelope) -> Result<(), AppError> {
        *self.attempts.lock().unwrap() += 1;
        let response = {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(())
            } else {
                responses.remove(0)
            }
        };
        if response.is_ok() {
            self.delivered.lock().unwrap().push(envelope.clone());
        }
        response
    }
}

// ---------------------------------------------------------------------------
// MockSessionApi
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MockSessionApi {
    state: Arc<Mutex<SessionState>>,
    pending_after_reset: u64,
    resets: Arc<Mutex<Vec<String>>>,
}

impl MockSessionApi {
    pub fn new(state: SessionState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
            pending_after_reset: 0,
            resets: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_pending_after_reset(mut self, pending: u64) -> Self {
        self.pending_after_reset = pending;
        self
    }

    pub fn resets(&self) -> Vec<String> {
        self.resets.lock().unwrap().clone()
    }
}

impl SessionApi for MockSessionApi {
    async fn session_state(&self, _session_id: &str) -> Result<SessionState, AppError> {
        Ok(*self.state.lock().unwrap())
    }

    async fn full_scan_reset(&self, supplier: &str) -> Result<ResetOutcome, AppError> {
        self.resets.lock().unwrap().push(supplier.to_string());
        Ok(ResetOutcome {
            after: QueueCounts {
                pending: self.pending_after_reset,
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Recording reporters
// ---------------------------------------------------------------------------

/// Worker reporter that keeps a log of event names and batch timeout ratios.
#[derive(Clone, Default)]
pub struct RecordingWorkerReporter {
    events: Arc<Mutex<Vec<String>>>,
    timeout_ratios: Arc<Mutex<Vec<f64>>>,
}

impl RecordingWorkerReporter {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn timeout_ratios(&self) -> Vec<f64> {
        self.timeout_ratios.lock().unwrap().clone()
    }
}

impl WorkerReporter for RecordingWorkerReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        if let WorkerEvent::BatchFinished { timeout_ratio, .. } = &event {
            self.timeout_ratios.lock().unwrap().push(*timeout_ratio);
        }
        self.events.lock().unwrap().push(event.name().to_string());
    }
}

/// Collect reporter that keeps the reasons categories were retired for.
#[derive(Clone, Default)]
pub struct RecordingCollectReporter {
    retired: Arc<Mutex<Vec<String>>>,
}

impl RecordingCollectReporter {
    pub fn retired(&self) -> Vec<String> {
        self.retired.lock().unwrap().clone()
    }
}

impl CollectReporter for RecordingCollectReporter {
    fn report(&self, event: CollectEvent<'_>) {
        if let CollectEvent::CategoryRetired { reason, .. } = event {
            self.retired.lock().unwrap().push(reason.to_string());
        }
    }
}

// ---------------------------------------------------------------------------
// Factory helpers
// ---------------------------------------------------------------------------

/// A priced, in-stock record for `url`.
pub fn make_test_record(url: &str) -> ProductRecord {
    ProductRecord {
        article: "SKM-1001".to_string(),
        name: "Test board 2800x2070".to_string(),
        price_per_unit: Some(1250.0),
        material_type: "plate".to_string(),
        unit: "м²".to_string(),
        availability_status: Availability::InStock,
        source_url: url.to_string(),
        currency: None,
        origin: "parser".to_string(),
        parsed_at: Utc::now(),
    }
}

pub fn make_test_task(id: u64, url: &str) -> UrlTask {
    UrlTask {
        id,
        url: url.to_string(),
        supplier: "acme".to_string(),
        material_type: None,
    }
}

/// `count` tasks with ids starting at `first_id`.
pub fn make_test_batch(first_id: u64, count: u64) -> Vec<UrlTask> {
    (first_id..first_id + count)
        .map(|id| make_test_task(id, &format!("https://shop.example/product/{id}")))
        .collect()
}
