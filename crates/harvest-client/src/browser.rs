use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chromiumoxide::cdp::browser_protocol::network::{EnableParams, SetBlockedUrLsParams};
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use harvest_core::error::{AppError, ExtractError};
use harvest_core::models::ProductRecord;
use harvest_core::profile::SupplierProfile;
use harvest_core::traits::{Extractor, PageMetrics};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::html;

/// Analytics, chat widgets and heavy media never needed for extraction.
const BLOCKED_URL_PATTERNS: &[&str] = &[
    "*google-analytics*",
    "*googletagmanager*",
    "*doubleclick*",
    "*facebook*",
    "*vk.com/rtrg*",
    "*mc.yandex*",
    "*top-fwz1*",
    "*/tracker*",
    "*/analytics*",
    "*/pixel*",
    "*jivosite*",
    "*carrotquest*",
    "*counters*",
    "*beacon*",
    "*.png*",
    "*.jpg*",
    "*.jpeg*",
    "*.gif*",
    "*.webp*",
    "*.svg*",
    "*.woff*",
    "*.woff2*",
    "*.ttf*",
    "*.mp4*",
];

/// Pause after a scroll so lazy content can load.
const SCROLL_SETTLE: Duration = Duration::from_millis(1500);

const NAVIGATION_STATUS_JS: &str =
    "(performance.getEntriesByType('navigation')[0] || {}).responseStatus || 0";
const SCROLL_HEIGHT_JS: &str = "document.body ? document.body.scrollHeight : 0";
const SCROLL_JS: &str = "window.scrollTo(0, document.body.scrollHeight)";
const OUTER_HTML_JS: &str = "document.documentElement.outerHTML";

struct BrowserInner {
    browser: Mutex<Option<Browser>>,
    handler: JoinHandle<()>,
    open_pages: AtomicUsize,
}

/// One headless Chromium process shared by every browser context of a run.
///
/// Each [`BrowserExtractor`] owns one tab. The process is closed when the
/// last tab is torn down.
#[derive(Clone)]
pub struct SharedBrowser {
    inner: Arc<BrowserInner>,
}

impl SharedBrowser {
    pub async fn launch() -> Result<Self, AppError> {
        let mut builder = BrowserConfig::builder();
        builder = builder.no_sandbox().disable_default_args();

        // The snap wrapper rejects standard Chrome flags; prefer the real binary.
        if let Some(bin) = find_chrome_binary() {
            tracing::info!(binary = %bin.display(), "Using Chrome binary");
            builder = builder.chrome_executable(bin);
        }

        let config = builder
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-popup-blocking")
            .arg("--disable-translate")
            .arg("--no-first-run")
            .arg("--ignore-certificate-errors")
            .window_size(1280, 720)
            .build()
            .map_err(|e| AppError::ExtractorError(format!("Browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AppError::ExtractorError(format!("Failed to launch browser: {e}")))?;

        // The CDP handler must be polled continuously for the connection to work.
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::warn!(error = %e, "Browser CDP handler error");
                    break;
                }
            }
        });

        Ok(Self {
            inner: Arc::new(BrowserInner {
                browser: Mutex::new(Some(browser)),
                handler,
                open_pages: AtomicUsize::new(0),
            }),
        })
    }

    async fn new_page(&self) -> Result<Page, AppError> {
        let guard = self.inner.browser.lock().await;
        let browser = guard
            .as_ref()
            .ok_or_else(|| AppError::ExtractorError("browser already closed".into()))?;
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| AppError::ExtractorError(format!("Failed to open tab: {e}")))?;
        self.inner.open_pages.fetch_add(1, Ordering::SeqCst);
        Ok(page)
    }

    async fn release_page(&self, page: Page) {
        if let Err(e) = page.close().await {
            tracing::debug!(error = %e, "Tab close failed");
        }
        if self.inner.open_pages.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.close().await;
        }
    }

    pub async fn close(&self) {
        let Some(mut browser) = self.inner.browser.lock().await.take() else {
            return;
        };
        if let Err(e) = browser.close().await {
            tracing::warn!(error = %e, "Browser close failed");
        }
        let _ = browser.wait().await;
        self.inner.handler.abort();
    }
}

/// Locate the real Chrome/Chromium binary, honouring `CHROME_BIN`.
///
/// Returns `None` to let `chromiumoxide` do its own lookup.
fn find_chrome_binary() -> Option<PathBuf> {
    let candidates: &[&str] = &[
        "/snap/chromium/current/usr/lib/chromium-browser/chrome",
        "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/google-chrome",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
    ];

    if let Ok(p) = std::env::var("CHROME_BIN") {
        let path = PathBuf::from(&p);
        if path.exists() {
            return Some(path);
        }
    }

    candidates.iter().map(PathBuf::from).find(|p| p.exists())
}

/// Rendering extractor driving one Chromium tab.
pub struct BrowserExtractor {
    browser: SharedBrowser,
    profile: Arc<SupplierProfile>,
    page: Option<Page>,
    metrics: PageMetrics,
}

fn cdp_error(e: impl std::fmt::Display) -> ExtractError {
    ExtractError::from_message(e.to_string())
}

impl BrowserExtractor {
    pub fn new(browser: SharedBrowser, profile: Arc<SupplierProfile>) -> Self {
        Self {
            browser,
            profile,
            page: None,
            metrics: PageMetrics::default(),
        }
    }

    fn page(&self) -> Result<&Page, ExtractError> {
        self.page
            .as_ref()
            .ok_or_else(|| ExtractError::Runtime("browser context used before setup".into()))
    }

    async fn eval<T: serde::de::DeserializeOwned>(&self, script: &str) -> Result<T, ExtractError> {
        let result = self.page()?.evaluate(script).await.map_err(cdp_error)?;
        result
            .into_value()
            .map_err(|e| ExtractError::Other(format!("Unexpected script result: {e:?}")))
    }

    /// Navigate and fail on a non-success document status.
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<(), ExtractError> {
        let start = Instant::now();
        let page = self.page()?;
        match tokio::time::timeout(timeout, page.goto(url)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(cdp_error(e)),
            Err(_) => return Err(ExtractError::NavTimeout(timeout.as_millis() as u64)),
        }
        self.metrics.goto_ms = Some(start.elapsed().as_secs_f64() * 1000.0);

        // 0 when the browser does not expose the status.
        let status: u16 = self.eval(NAVIGATION_STATUS_JS).await.unwrap_or(0);
        if status >= 400 {
            return Err(ExtractError::HttpStatus(status));
        }
        Ok(())
    }

    async fn content(&self) -> Result<String, ExtractError> {
        self.eval(OUTER_HTML_JS).await
    }
}

impl Extractor for BrowserExtractor {
    async fn setup(&mut self) -> Result<(), AppError> {
        let page = self.browser.new_page().await?;
        let blocked: Vec<String> = BLOCKED_URL_PATTERNS.iter().map(|p| p.to_string()).collect();
        if let Err(e) = page.execute(EnableParams::default()).await {
            tracing::warn!(error = %e, "Network domain unavailable");
        } else if let Err(e) = page.execute(SetBlockedUrLsParams::new(blocked)).await {
            tracing::warn!(error = %e, "Resource blocking unavailable");
        }
        self.page = Some(page);
        Ok(())
    }

    async fn teardown(&mut self) -> Result<(), AppError> {
        if let Some(page) = self.page.take() {
            self.browser.release_page(page).await;
        }
        Ok(())
    }

    async fn extract(&mut self, url: &str, timeout: Duration) -> Result<ProductRecord, ExtractError> {
        self.navigate(url, timeout).await?;
        let body = self.content().await?;
        let start = Instant::now();
        let record = html::parse_product(&body, url, &self.profile);
        self.metrics.parse_ms = Some(start.elapsed().as_secs_f64() * 1000.0);
        record
    }

    async fn open(&mut self, url: &str) -> Result<(), ExtractError> {
        self.navigate(url, self.profile.nav_timeout()).await
    }

    async fn scan_products(&mut self, selector: &str) -> Result<Vec<String>, ExtractError> {
        html::select_hrefs(&self.content().await?, selector)
    }

    async fn scan_subcategories(&mut self, selector: &str) -> Result<Vec<String>, ExtractError> {
        html::select_hrefs(&self.content().await?, selector)
    }

    async fn next_link(&mut self, selector: &str) -> Result<Option<String>, ExtractError> {
        html::first_href(&self.content().await?, selector)
    }

    async fn scroll_more(&mut self) -> Result<bool, ExtractError> {
        let before: u64 = self.eval(SCROLL_HEIGHT_JS).await?;
        self.page()?.evaluate(SCROLL_JS).await.map_err(cdp_error)?;
        tokio::time::sleep(SCROLL_SETTLE).await;
        let after: u64 = self.eval(SCROLL_HEIGHT_JS).await?;
        Ok(after > before)
    }

    fn take_metrics(&mut self) -> PageMetrics {
        std::mem::take(&mut self.metrics)
    }
}
