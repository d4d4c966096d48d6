use std::sync::Arc;
use std::time::{Duration, Instant};

use harvest_core::error::{AppError, ExtractError};
use harvest_core::models::ProductRecord;
use harvest_core::profile::SupplierProfile;
use harvest_core::traits::{Extractor, PageMetrics};
use reqwest::Client;

use crate::html;

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// Plain-HTTP extractor for suppliers whose catalog renders server-side.
///
/// Holds the most recently opened page in memory; infinite scroll is not
/// available without a browser.
pub struct HttpExtractor {
    client: Option<Client>,
    profile: Arc<SupplierProfile>,
    page: Option<String>,
    metrics: PageMetrics,
}

impl HttpExtractor {
    pub fn new(profile: Arc<SupplierProfile>) -> Self {
        Self {
            client: None,
            profile,
            page: None,
            metrics: PageMetrics::default(),
        }
    }

    fn client(&self) -> Result<&Client, ExtractError> {
        self.client
            .as_ref()
            .ok_or_else(|| ExtractError::Runtime("extractor used before setup".into()))
    }

    fn current_page(&self) -> Result<&str, ExtractError> {
        self.page
            .as_deref()
            .ok_or_else(|| ExtractError::Other("no page loaded".into()))
    }

    async fn fetch(&self, url: &str, timeout: Duration) -> Result<String, ExtractError> {
        let timeout_ms = timeout.as_millis() as u64;
        let response = self
            .client()?
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_fetch_error(e, timeout_ms))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExtractError::HttpStatus(status.as_u16()));
        }
        response
            .text()
            .await
            .map_err(|e| map_fetch_error(e, timeout_ms))
    }
}

fn map_fetch_error(e: reqwest::Error, timeout_ms: u64) -> ExtractError {
    if e.is_timeout() {
        ExtractError::NavTimeout(timeout_ms)
    } else if e.is_connect() {
        ExtractError::Network(format!("Connection failed: {e}"))
    } else {
        ExtractError::Network(e.to_string())
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

impl Extractor for HttpExtractor {
    async fn setup(&mut self) -> Result<(), AppError> {
        let client = Client::builder()
            .user_agent(BROWSER_USER_AGENT)
            .timeout(self.profile.nav_timeout())
            .build()
            .map_err(|e| AppError::ExtractorError(format!("Cannot build HTTP client: {e}")))?;
        self.client = Some(client);
        Ok(())
    }

    async fn teardown(&mut self) -> Result<(), AppError> {
        self.client = None;
        self.page = None;
        Ok(())
    }

    async fn extract(&mut self, url: &str, timeout: Duration) -> Result<ProductRecord, ExtractError> {
        let start = Instant::now();
        let body = self.fetch(url, timeout).await?;
        self.metrics.goto_ms = Some(elapsed_ms(start));

        let start = Instant::now();
        let record = html::parse_product(&body, url, &self.profile);
        self.metrics.parse_ms = Some(elapsed_ms(start));
        record
    }

    async fn open(&mut self, url: &str) -> Result<(), ExtractError> {
        self.page = None;
        let start = Instant::now();
        let body = self.fetch(url, self.profile.nav_timeout()).await?;
        self.metrics.goto_ms = Some(elapsed_ms(start));
        self.page = Some(body);
        Ok(())
    }

    async fn scan_products(&mut self, selector: &str) -> Result<Vec<String>, ExtractError> {
        html::select_hrefs(self.current_page()?, selector)
    }

    async fn scan_subcategories(&mut self, selector: &str) -> Result<Vec<String>, ExtractError> {
        html::select_hrefs(self.current_page()?, selector)
    }

    async fn next_link(&mut self, selector: &str) -> Result<Option<String>, ExtractError> {
        html::first_href(self.current_page()?, selector)
    }

    async fn scroll_more(&mut self) -> Result<bool, ExtractError> {
        Ok(false)
    }

    fn take_metrics(&mut self) -> PageMetrics {
        std::mem::take(&mut self.metrics)
    }
}
