//! Adapter selection: turns a supplier profile into ready execution contexts.

use std::sync::Arc;
use std::time::Duration;

use harvest_core::error::{AppError, ExtractError};
use harvest_core::models::ProductRecord;
use harvest_core::profile::{AdapterKind, SupplierProfile};
use harvest_core::traits::{Extractor, PageMetrics};

#[cfg(feature = "browser")]
use crate::browser::{BrowserExtractor, SharedBrowser};
use crate::extractor::HttpExtractor;

/// Any extractor a profile can ask for.
pub enum CatalogExtractor {
    Http(HttpExtractor),
    #[cfg(feature = "browser")]
    Browser(BrowserExtractor),
}

macro_rules! delegate {
    ($self:ident, $inner:ident => $call:expr) => {
        match $self {
            CatalogExtractor::Http($inner) => $call,
            #[cfg(feature = "browser")]
            CatalogExtractor::Browser($inner) => $call,
        }
    };
}

impl Extractor for CatalogExtractor {
    async fn setup(&mut self) -> Result<(), AppError> {
        delegate!(self, e => e.setup().await)
    }

    async fn teardown(&mut self) -> Result<(), AppError> {
        delegate!(self, e => e.teardown().await)
    }

    async fn extract(&mut self, url: &str, timeout: Duration) -> Result<ProductRecord, ExtractError> {
        delegate!(self, e => e.extract(url, timeout).await)
    }

    async fn open(&mut self, url: &str) -> Result<(), ExtractError> {
        delegate!(self, e => e.open(url).await)
    }

    async fn scan_products(&mut self, selector: &str) -> Result<Vec<String>, ExtractError> {
        delegate!(self, e => e.scan_products(selector).await)
    }

    async fn scan_subcategories(&mut self, selector: &str) -> Result<Vec<String>, ExtractError> {
        delegate!(self, e => e.scan_subcategories(selector).await)
    }

    async fn next_link(&mut self, selector: &str) -> Result<Option<String>, ExtractError> {
        delegate!(self, e => e.next_link(selector).await)
    }

    async fn scroll_more(&mut self) -> Result<bool, ExtractError> {
        delegate!(self, e => e.scroll_more().await)
    }

    fn take_metrics(&mut self) -> PageMetrics {
        delegate!(self, e => e.take_metrics())
    }
}

/// Build and set up `count` contexts for `profile`.
///
/// Browser contexts share one Chromium process. A profile asking for the
/// browser adapter fails with a `ConfigError` when the crate was built
/// without the `browser` feature.
pub async fn build_contexts(
    profile: Arc<SupplierProfile>,
    count: usize,
) -> Result<Vec<CatalogExtractor>, AppError> {
    let mut contexts = Vec::with_capacity(count);
    match profile.adapter {
        AdapterKind::Http => {
            for _ in 0..count {
                contexts.push(CatalogExtractor::Http(HttpExtractor::new(profile.clone())));
            }
        }
        #[cfg(feature = "browser")]
        AdapterKind::Browser => {
            let browser = SharedBrowser::launch().await?;
            for _ in 0..count {
                contexts.push(CatalogExtractor::Browser(BrowserExtractor::new(
                    browser.clone(),
                    profile.clone(),
                )));
            }
        }
        #[cfg(not(feature = "browser"))]
        AdapterKind::Browser => {
            return Err(AppError::ConfigError(format!(
                "profile '{}' needs the browser adapter; rebuild with --features browser",
                profile.name
            )));
        }
    }

    for (i, context) in contexts.iter_mut().enumerate() {
        if let Err(e) = context.setup().await {
            tracing::error!(context = i, error = %e, "Context setup failed");
            teardown_all(&mut contexts).await;
            return Err(e);
        }
    }
    tracing::info!(
        supplier = %profile.name,
        adapter = profile.adapter.as_str(),
        contexts = count,
        "Execution contexts ready"
    );
    Ok(contexts)
}

/// Best-effort teardown of every context.
pub async fn teardown_all<E: Extractor>(contexts: &mut [E]) {
    for context in contexts.iter_mut() {
        if let Err(e) = context.teardown().await {
            tracing::warn!(error = %e, "Context teardown failed");
        }
    }
}
