//! Bounded breadth-first catalog traversal.
//!
//! Pages are visited from a FIFO queue of `(url, depth)`. Before each fetch
//! the run checks its hard time ceiling, its soft-exit window and the URL
//! ceiling. Product links found on a page are filtered, normalized and handed
//! to the [`ChunkSender`] immediately; the collector never holds the result
//! set itself. Categories whose pages repeat, stop producing new URLs or come
//! back empty are retired and their queued pages skipped.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use url::Url;

use crate::callback::{CallbackChannel, CallbackEvent};
use crate::chunk::{ChunkSender, ChunkStats};
use crate::context::RunContext;
use crate::error::{AppError, ExtractError};
use crate::filter::{FilterStats, KeywordFilter};
use crate::loop_detector::{LoopDetector, PageVerdict, page_fingerprint};
use crate::metrics::RunStatus;
use crate::normalize::{category_key, normalize_url, resolve_href};
use crate::traits::{Extractor, UrlSink};

/// Why a collect run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopReason {
    TimeLimitReached,
    SoftExitTimeLimit,
    UrlLimitReached,
    PaginationLoopDetected,
    NoNewUniqueUrls,
    Exception,
    /// External shutdown (Ctrl-C).
    Interrupted,
    #[serde(rename = "completed")]
    Completed,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::TimeLimitReached => "TIME_LIMIT_REACHED",
            StopReason::SoftExitTimeLimit => "SOFT_EXIT_TIME_LIMIT",
            StopReason::UrlLimitReached => "URL_LIMIT_REACHED",
            StopReason::PaginationLoopDetected => "PAGINATION_LOOP_DETECTED",
            StopReason::NoNewUniqueUrls => "NO_NEW_UNIQUE_URLS",
            StopReason::Exception => "EXCEPTION",
            StopReason::Interrupted => "INTERRUPTED",
            StopReason::Completed => "completed",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a category is paginated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pagination {
    None,
    /// From a category's first page, enqueue `param=2..=max_pages`.
    PageParam { param: String, max_pages: u32 },
    /// Follow the href of the element matching `selector`.
    NextLink { selector: String },
    /// Load more on the same page, re-scanning after each round.
    Scroll { max_scrolls: u32 },
}

impl Pagination {
    pub fn param(&self) -> Option<&str> {
        match self {
            Pagination::PageParam { param, .. } => Some(param),
            _ => None,
        }
    }
}

/// Ceilings of one collect run.
#[derive(Debug, Clone)]
pub struct CollectLimits {
    pub max_depth: u32,
    pub max_urls: usize,
    pub max_time: Duration,
    /// Stop gracefully once less than this remains of `max_time`.
    pub soft_exit_window: Duration,
    pub max_pages_per_category: u32,
}

impl Default for CollectLimits {
    fn default() -> Self {
        Self {
            max_depth: 2,
            max_urls: 10_000,
            max_time: Duration::from_secs(600),
            soft_exit_window: Duration::from_secs(10),
            max_pages_per_category: 100,
        }
    }
}

impl CollectLimits {
    pub fn with_max_depth(mut self, depth: u32) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_max_urls(mut self, max_urls: usize) -> Self {
        self.max_urls = max_urls;
        self
    }

    pub fn with_max_time(mut self, max_time: Duration) -> Self {
        self.max_time = max_time;
        self
    }

    pub fn with_soft_exit_window(mut self, window: Duration) -> Self {
        self.soft_exit_window = window;
        self
    }

    pub fn with_max_pages_per_category(mut self, pages: u32) -> Self {
        self.max_pages_per_category = pages;
        self
    }
}

/// What to traverse and which selectors to scan with.
#[derive(Debug, Clone)]
pub struct CollectPlan {
    pub root: String,
    pub product_selector: String,
    pub subcategory_selector: Option<String>,
    /// Category slugs (the path segment after `/category/`) allowed for
    /// subcategory links. Empty allows everything.
    pub allowed_categories: Vec<String>,
    pub pagination: Pagination,
}

impl CollectPlan {
    pub fn new(root: impl Into<String>, product_selector: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            product_selector: product_selector.into(),
            subcategory_selector: None,
            allowed_categories: Vec::new(),
            pagination: Pagination::None,
        }
    }

    pub fn with_subcategories(mut self, selector: impl Into<String>) -> Self {
        self.subcategory_selector = Some(selector.into());
        self
    }

    pub fn with_allowed_categories(mut self, categories: Vec<String>) -> Self {
        self.allowed_categories = categories;
        self
    }

    pub fn with_pagination(mut self, pagination: Pagination) -> Self {
        self.pagination = pagination;
        self
    }
}

/// Collect statistics, reported with the `finish` event.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CollectStats {
    pub pages_visited: u64,
    pub page_errors: u64,
    pub page_duplicates_dropped: u64,
    pub categories_retired: u64,
    #[serde(flatten)]
    pub chunk: ChunkStats,
    pub filter: FilterStats,
    pub elapsed_seconds: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectOutcome {
    pub stop_reason: StopReason,
    pub stats: CollectStats,
}

impl CollectOutcome {
    /// A collect run succeeds iff at least one URL reached the Store.
    pub fn is_success(&self) -> bool {
        self.stats.chunk.urls_sent_total > 0
    }
}

/// Events emitted by the collector for monitoring/logging.
#[derive(Debug, Clone)]
pub enum CollectEvent<'a> {
    Started {
        root: &'a str,
    },
    PageStarted {
        url: &'a str,
        depth: u32,
    },
    PageFailed {
        url: &'a str,
        error: &'a ExtractError,
    },
    PageScanned {
        url: &'a str,
        found: usize,
        new_unique: usize,
    },
    CategoryRetired {
        category: &'a str,
        reason: &'a str,
    },
    Stopped {
        reason: StopReason,
        stats: &'a CollectStats,
    },
}

/// Trait for receiving collector events (decoupled logging).
pub trait CollectReporter: Send + Sync {
    fn report(&self, event: CollectEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingCollectReporter;

impl CollectReporter for TracingCollectReporter {
    fn report(&self, event: CollectEvent<'_>) {
        match event {
            CollectEvent::Started { root } => {
                tracing::info!(%root, "Collect started");
            }
            CollectEvent::PageStarted { url, depth } => {
                tracing::info!(%url, depth, "Loading page");
            }
            CollectEvent::PageFailed { url, error } => {
                tracing::warn!(%url, %error, "Page failed, continuing");
            }
            CollectEvent::PageScanned {
                url,
                found,
                new_unique,
            } => {
                tracing::info!(%url, found, new_unique, "Page scanned");
            }
            CollectEvent::CategoryRetired { category, reason } => {
                tracing::info!(%category, %reason, "Category retired");
            }
            CollectEvent::Stopped { reason, stats } => {
                tracing::info!(
                    stop_reason = %reason,
                    pages = stats.pages_visited,
                    unique = stats.chunk.urls_unique_total,
                    sent = stats.chunk.urls_sent_total,
                    "Collect finished"
                );
            }
        }
    }
}

/// Mutable state of one traversal.
struct Traversal {
    started: Instant,
    queue: VecDeque<(String, u32)>,
    visited: HashSet<String>,
    pages_per_category: HashMap<String, u32>,
    detector: LoopDetector,
    filter_stats: FilterStats,
    pages_visited: u64,
    page_errors: u64,
    page_duplicates: u64,
    retired: u64,
    last_retirement: Option<StopReason>,
}

impl Traversal {
    /// Visits are keyed by the normalized URL.
    fn is_visited(&self, url: &str) -> bool {
        self.visited.contains(&normalize_url(url))
    }

    fn mark_visited(&mut self, url: &str) {
        self.visited.insert(normalize_url(url));
    }
}

pub struct Collector {
    plan: CollectPlan,
    limits: CollectLimits,
    filter: KeywordFilter,
}

impl Collector {
    pub fn new(plan: CollectPlan, limits: CollectLimits, filter: KeywordFilter) -> Self {
        Self {
            plan,
            limits,
            filter,
        }
    }

    pub fn limits(&self) -> &CollectLimits {
        &self.limits
    }

    /// Run the traversal to completion. Never fails: errors end the run with
    /// `StopReason::Exception` after a final flush.
    pub async fn collect<E, S, R>(
        &self,
        extractor: &mut E,
        sender: &ChunkSender<S>,
        ctx: &RunContext,
        callbacks: &CallbackChannel,
        reporter: &R,
    ) -> CollectOutcome
    where
        E: Extractor,
        S: UrlSink,
        R: CollectReporter,
    {
        reporter.report(CollectEvent::Started {
            root: &self.plan.root,
        });
        callbacks.send(CallbackEvent::PhaseStarted {
            phase: "collect".into(),
        });

        let mut state = Traversal {
            started: Instant::now(),
            queue: VecDeque::from([(self.plan.root.clone(), 0)]),
            visited: HashSet::new(),
            pages_per_category: HashMap::new(),
            detector: LoopDetector::new(),
            filter_stats: FilterStats::default(),
            pages_visited: 0,
            page_errors: 0,
            page_duplicates: 0,
            retired: 0,
            last_retirement: None,
        };

        let stop_reason = match self
            .traverse(&mut state, extractor, sender, ctx, callbacks, reporter)
            .await
        {
            Ok(reason) => reason,
            Err(e) => {
                tracing::error!(error = %e, "Collect aborted");
                callbacks.log("error", format!("Collect aborted: {e}"));
                StopReason::Exception
            }
        };

        sender.flush(true).await;

        let stats = CollectStats {
            pages_visited: state.pages_visited,
            page_errors: state.page_errors,
            page_duplicates_dropped: state.page_duplicates,
            categories_retired: state.retired,
            chunk: sender.stats(),
            filter: state.filter_stats,
            elapsed_seconds: state.started.elapsed().as_secs_f64(),
        };
        reporter.report(CollectEvent::Stopped {
            reason: stop_reason,
            stats: &stats,
        });

        let outcome = CollectOutcome { stop_reason, stats };
        let status = if outcome.is_success() {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        let mut summary = serde_json::to_value(&outcome.stats).unwrap_or_default();
        if let Some(map) = summary.as_object_mut() {
            map.insert("stop_reason".into(), stop_reason.as_str().into());
        }
        callbacks.send(CallbackEvent::Finish { status, summary });
        outcome
    }

    async fn traverse<E, S, R>(
        &self,
        state: &mut Traversal,
        extractor: &mut E,
        sender: &ChunkSender<S>,
        ctx: &RunContext,
        callbacks: &CallbackChannel,
        reporter: &R,
    ) -> Result<StopReason, AppError>
    where
        E: Extractor,
        S: UrlSink,
        R: CollectReporter,
    {
        let pagination_param = self.plan.pagination.param();

        loop {
            if ctx.is_halted() {
                return Ok(StopReason::Interrupted);
            }
            if sender.unique_count() >= self.limits.max_urls {
                return Ok(StopReason::UrlLimitReached);
            }
            let Some((url, depth)) = state.queue.pop_front() else {
                return Ok(state.last_retirement.unwrap_or(StopReason::Completed));
            };
            if state.is_visited(&url) || depth > self.limits.max_depth {
                continue;
            }
            let category = category_key(&url, pagination_param);
            if state.detector.is_retired(&category) {
                continue;
            }
            let pages_seen = state.pages_per_category.entry(category.clone()).or_insert(0);
            if *pages_seen >= self.limits.max_pages_per_category {
                continue;
            }

            let elapsed = state.started.elapsed();
            if elapsed >= self.limits.max_time {
                return Ok(StopReason::TimeLimitReached);
            }
            if self.limits.max_time - elapsed <= self.limits.soft_exit_window {
                return Ok(StopReason::SoftExitTimeLimit);
            }

            *pages_seen += 1;
            state.mark_visited(&url);
            state.pages_visited += 1;
            reporter.report(CollectEvent::PageStarted { url: &url, depth });

            let sent_before = sender.stats().chunks_sent;
            match self
                .visit(state, &url, depth, &category, extractor, sender, reporter)
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_environment_failure() => {
                    return Err(AppError::ExtractorError(e.to_string()));
                }
                Err(e) => {
                    state.page_errors += 1;
                    reporter.report(CollectEvent::PageFailed {
                        url: &url,
                        error: &e,
                    });
                }
            }

            let stats = sender.stats();
            if stats.chunks_sent > sent_before {
                callbacks.send_progress(
                    "collect",
                    stats.urls_sent_total,
                    self.limits.max_urls as u64,
                    Some(serde_json::json!({
                        "urls_found_total": stats.urls_found_total,
                        "urls_unique_total": stats.urls_unique_total,
                        "urls_sent_total": stats.urls_sent_total,
                        "page_duplicates_dropped": state.page_duplicates,
                        "global_duplicates_dropped": stats.global_duplicates_dropped,
                        "chunks_sent": stats.chunks_sent,
                        "elapsed_seconds": state.started.elapsed().as_secs_f64(),
                    })),
                    false,
                );
            }
        }
    }

    /// Fetch one page, harvest its products and queue follow-up pages.
    #[allow(clippy::too_many_arguments)]
    async fn visit<E, S, R>(
        &self,
        state: &mut Traversal,
        url: &str,
        depth: u32,
        category: &str,
        extractor: &mut E,
        sender: &ChunkSender<S>,
        reporter: &R,
    ) -> Result<(), ExtractError>
    where
        E: Extractor,
        S: UrlSink,
        R: CollectReporter,
    {
        extractor.open(url).await?;
        let hrefs = extractor.scan_products(&self.plan.product_selector).await?;
        let (page_urls, new_unique) = self.harvest(state, url, &hrefs, sender).await;
        reporter.report(CollectEvent::PageScanned {
            url,
            found: hrefs.len(),
            new_unique,
        });

        if hrefs.is_empty() {
            self.retire(state, category, "EMPTY_PAGE", None, reporter);
        } else {
            let fingerprint = page_fingerprint(&page_urls);
            match state.detector.observe(category, &fingerprint, new_unique) {
                PageVerdict::Continue => {}
                PageVerdict::LoopDetected => {
                    self.retire(
                        state,
                        category,
                        StopReason::PaginationLoopDetected.as_str(),
                        Some(StopReason::PaginationLoopDetected),
                        reporter,
                    );
                    return Ok(());
                }
                PageVerdict::NoNewUniques => {
                    self.retire(
                        state,
                        category,
                        StopReason::NoNewUniqueUrls.as_str(),
                        Some(StopReason::NoNewUniqueUrls),
                        reporter,
                    );
                }
            }
        }

        if depth < self.limits.max_depth
            && let Some(selector) = &self.plan.subcategory_selector
        {
            for href in extractor.scan_subcategories(selector).await? {
                let Some(abs) = resolve_href(url, &href) else {
                    continue;
                };
                if !self.category_allowed(&abs) {
                    tracing::debug!(url = %abs, "Skipping category outside allow-list");
                    continue;
                }
                if !state.is_visited(&abs) {
                    state.queue.push_back((abs, depth + 1));
                }
            }
        }

        self.paginate(state, url, depth, extractor, sender).await
    }

    async fn paginate<E, S>(
        &self,
        state: &mut Traversal,
        url: &str,
        depth: u32,
        extractor: &mut E,
        sender: &ChunkSender<S>,
    ) -> Result<(), ExtractError>
    where
        E: Extractor,
        S: UrlSink,
    {
        let budget_left = |sender: &ChunkSender<S>| sender.unique_count() < self.limits.max_urls;

        match &self.plan.pagination {
            Pagination::None => {}
            Pagination::PageParam { param, max_pages } => {
                if !budget_left(sender) || has_query_param(url, param) {
                    return Ok(());
                }
                let last = (*max_pages).min(self.limits.max_pages_per_category);
                for page in 2..=last {
                    if !budget_left(sender) {
                        break;
                    }
                    let next = with_query_param(url, param, page);
                    if !state.is_visited(&next) {
                        state.queue.push_back((next, depth));
                    }
                }
            }
            Pagination::NextLink { selector } => {
                if !budget_left(sender) {
                    return Ok(());
                }
                if let Some(href) = extractor.next_link(selector).await?
                    && let Some(next) = resolve_href(url, &href)
                    && !state.is_visited(&next)
                {
                    state.queue.push_back((next, depth));
                }
            }
            Pagination::Scroll { max_scrolls } => {
                for _ in 0..*max_scrolls {
                    if !budget_left(sender) {
                        break;
                    }
                    if !extractor.scroll_more().await? {
                        break;
                    }
                    let hrefs = extractor.scan_products(&self.plan.product_selector).await?;
                    self.harvest(state, url, &hrefs, sender).await;
                }
            }
        }
        Ok(())
    }

    /// Filter, normalize and deliver product hrefs from one page. Returns the
    /// page's unique normalized URLs and how many of them were new.
    async fn harvest<S: UrlSink>(
        &self,
        state: &mut Traversal,
        page_url: &str,
        hrefs: &[String],
        sender: &ChunkSender<S>,
    ) -> (Vec<String>, usize) {
        let mut page_seen = HashSet::new();
        let mut page_urls = Vec::new();
        for href in hrefs {
            let Some(abs) = resolve_href(page_url, href) else {
                continue;
            };
            if !self.filter.accept(&abs, &mut state.filter_stats) {
                continue;
            }
            let normalized = normalize_url(&abs);
            if page_seen.insert(normalized.clone()) {
                page_urls.push(normalized);
            } else {
                state.page_duplicates += 1;
            }
        }

        let mut new_unique = 0;
        for url in &page_urls {
            if sender.unique_count() >= self.limits.max_urls {
                break;
            }
            let material = self.filter.infer_material(url);
            if sender.accept(url, material).await {
                new_unique += 1;
            }
        }
        (page_urls, new_unique)
    }

    fn retire<R: CollectReporter>(
        &self,
        state: &mut Traversal,
        category: &str,
        reason: &str,
        stop_reason: Option<StopReason>,
        reporter: &R,
    ) {
        state.detector.retire(category);
        state.retired += 1;
        if stop_reason.is_some() {
            state.last_retirement = stop_reason;
        }
        reporter.report(CollectEvent::CategoryRetired { category, reason });
    }

    fn category_allowed(&self, url: &str) -> bool {
        if self.plan.allowed_categories.is_empty() {
            return true;
        }
        let Some((_, rest)) = url.split_once("/category/") else {
            return false;
        };
        let slug = rest.split(['/', '?', '#']).next().unwrap_or_default();
        self.plan.allowed_categories.iter().any(|c| c == slug)
    }
}

fn has_query_param(url: &str, param: &str) -> bool {
    Url::parse(url).is_ok_and(|u| u.query_pairs().any(|(k, _)| k == param))
}

fn with_query_param(url: &str, param: &str, value: u32) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            parsed
                .query_pairs_mut()
                .append_pair(param, &value.to_string());
            parsed.to_string()
        }
        Err(_) => {
            let separator = if url.contains('?') { '&' } else { '?' };
            format!("{url}{separator}{param}={value}")
        }
    }
}
