//! Supplier profile: the per-site JSON document that drives both phases.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::chunk::ChunkConfig;
use crate::collector::{CollectLimits, CollectPlan, Pagination};
use crate::error::AppError;
use crate::filter::KeywordFilter;

/// Which extractor implementation serves a supplier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    /// Plain HTTP fetch plus HTML parsing.
    #[default]
    Http,
    /// Headless Chromium.
    Browser,
}

impl AdapterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterKind::Http => "http",
            AdapterKind::Browser => "browser",
        }
    }
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AdapterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" => Ok(AdapterKind::Http),
            "browser" | "chromium" => Ok(AdapterKind::Browser),
            _ => Err(format!("Unknown adapter: {}", s)),
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// CSS selectors used on product pages. Each list is tried in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProductSelectors {
    /// At least one must match for the page to count as a product page.
    pub product_indicators: Vec<String>,
    pub name: Vec<String>,
    pub article: Vec<String>,
    /// Elements whose `content` attribute holds the price.
    pub price_meta: Vec<String>,
    /// Elements whose text holds the price.
    pub price_text: Vec<String>,
    pub buy_button: String,
    /// Prefix of articles synthesized from the URL when none is on the page.
    pub article_prefix: String,
}

impl Default for ProductSelectors {
    fn default() -> Self {
        Self {
            product_indicators: strings(&[
                "[itemprop=\"name\"]",
                ".catalog-detail",
                ".product-detail",
                "h1.catalog-detail__title",
            ]),
            name: strings(&[
                "meta[itemprop=\"name\"]",
                "[itemprop=\"name\"]",
                "h1",
                ".catalog-detail__title",
                "meta[property=\"og:title\"]",
            ]),
            article: strings(&[
                ".catalog-detail__article.js-copy-article",
                ".catalog-detail__article",
                "[data-article]",
                ".article",
                ".sku",
            ]),
            price_meta: strings(&["meta[itemprop=\"price\"]"]),
            price_text: strings(&[".catalog-detail__price", ".price"]),
            buy_button: "button.btn-default.to-cart, .catalog-detail__buy button".to_string(),
            article_prefix: "SKM".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Delays {
    /// Navigation timeout in milliseconds.
    pub page_load_timeout: u64,
    pub page_load_retries: u32,
    /// Minimum spacing between requests to one domain, in milliseconds.
    pub request_interval: u64,
}

impl Default for Delays {
    fn default() -> Self {
        Self {
            page_load_timeout: 15_000,
            page_load_retries: 1,
            request_interval: 0,
        }
    }
}

/// Settings of the collect phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UrlCollection {
    pub product_selector: String,
    pub subcategory_selector: Option<String>,
    pub pagination_param: Option<String>,
    pub pagination_max_pages: u32,
    pub pagination_next_selector: Option<String>,
    pub infinite_scroll: bool,
    pub max_scrolls: u32,
    pub max_depth: u32,
    pub max_total_urls: usize,
    pub max_pages_per_category: u32,
    pub max_collect_time_seconds: u64,
    pub soft_exit_seconds: u64,
    pub filter_keywords: Vec<String>,
    pub exclude_keywords: Vec<String>,
    pub chunk_size: usize,
    pub chunk_interval_seconds: u64,
    pub min_chunk_size: usize,
}

impl Default for UrlCollection {
    fn default() -> Self {
        Self {
            product_selector: "a[href*=\"/product/\"]".to_string(),
            subcategory_selector: None,
            pagination_param: None,
            pagination_max_pages: 10,
            pagination_next_selector: None,
            infinite_scroll: false,
            max_scrolls: 10,
            max_depth: 2,
            max_total_urls: 10_000,
            max_pages_per_category: 100,
            max_collect_time_seconds: 600,
            soft_exit_seconds: 10,
            filter_keywords: Vec::new(),
            exclude_keywords: Vec::new(),
            chunk_size: 300,
            chunk_interval_seconds: 60,
            min_chunk_size: 50,
        }
    }
}

fn default_type() -> String {
    "plate".to_string()
}

fn default_unit() -> String {
    "м²".to_string()
}

fn enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplierProfile {
    pub name: String,
    pub base_url: String,
    /// Root of the catalog traversal; `base_url` when absent.
    #[serde(default)]
    pub catalog_base_url: Option<String>,
    #[serde(default)]
    pub adapter: AdapterKind,
    #[serde(default = "enabled")]
    pub collect_urls: bool,
    #[serde(default)]
    pub selectors: ProductSelectors,
    #[serde(default)]
    pub delays: Delays,
    #[serde(default)]
    pub url_collection: UrlCollection,
    #[serde(default)]
    pub allowed_categories: Vec<String>,
    #[serde(default)]
    pub material_types: Vec<String>,
    /// Maps a matched `material_types` entry to the record's type.
    #[serde(default)]
    pub material_type_mapping: BTreeMap<String, String>,
    #[serde(default = "default_type")]
    pub default_type: String,
    #[serde(default = "default_unit")]
    pub default_unit: String,
    #[serde(default)]
    pub material_unit_mapping: BTreeMap<String, String>,
}

impl SupplierProfile {
    /// Read and validate a profile from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::ConfigError(format!("Cannot read profile {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, AppError> {
        let profile: Self = serde_json::from_str(raw)
            .map_err(|e| AppError::ConfigError(format!("Invalid profile: {}", e)))?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.name.trim().is_empty() {
            return Err(AppError::ConfigError("profile name is empty".into()));
        }
        Url::parse(self.catalog_root()).map_err(|e| {
            AppError::ConfigError(format!("Invalid catalog URL {}: {}", self.catalog_root(), e))
        })?;
        if self.url_collection.product_selector.trim().is_empty() {
            return Err(AppError::ConfigError("product_selector is empty".into()));
        }
        if self.url_collection.max_total_urls == 0 {
            return Err(AppError::ConfigError("max_total_urls must be at least 1".into()));
        }
        Ok(())
    }

    pub fn catalog_root(&self) -> &str {
        self.catalog_base_url.as_deref().unwrap_or(&self.base_url)
    }

    /// Active pagination strategy. A page parameter wins over scrolling,
    /// which wins over a next link.
    pub fn pagination(&self) -> Pagination {
        let uc = &self.url_collection;
        if let Some(param) = &uc.pagination_param {
            Pagination::PageParam {
                param: param.clone(),
                max_pages: uc.pagination_max_pages,
            }
        } else if uc.infinite_scroll {
            Pagination::Scroll {
                max_scrolls: uc.max_scrolls,
            }
        } else if let Some(selector) = &uc.pagination_next_selector {
            Pagination::NextLink {
                selector: selector.clone(),
            }
        } else {
            Pagination::None
        }
    }

    pub fn collect_plan(&self) -> CollectPlan {
        let mut plan = CollectPlan::new(self.catalog_root(), &self.url_collection.product_selector)
            .with_allowed_categories(self.allowed_categories.clone())
            .with_pagination(self.pagination());
        if let Some(selector) = &self.url_collection.subcategory_selector {
            plan = plan.with_subcategories(selector);
        }
        plan
    }

    pub fn collect_limits(&self) -> CollectLimits {
        let uc = &self.url_collection;
        CollectLimits::default()
            .with_max_depth(uc.max_depth)
            .with_max_urls(uc.max_total_urls)
            .with_max_time(Duration::from_secs(uc.max_collect_time_seconds))
            .with_soft_exit_window(Duration::from_secs(uc.soft_exit_seconds))
            .with_max_pages_per_category(uc.max_pages_per_category)
    }

    pub fn keyword_filter(&self) -> KeywordFilter {
        KeywordFilter::new(
            &self.url_collection.filter_keywords,
            &self.url_collection.exclude_keywords,
        )
        .with_material_types(&self.material_types)
    }

    pub fn chunk_config(&self) -> ChunkConfig {
        let uc = &self.url_collection;
        ChunkConfig::default()
            .with_chunk_size(uc.chunk_size)
            .with_interval(Duration::from_secs(uc.chunk_interval_seconds))
            .with_min_chunk_size(uc.min_chunk_size)
    }

    pub fn nav_timeout(&self) -> Duration {
        Duration::from_millis(self.delays.page_load_timeout)
    }

    pub fn request_interval(&self) -> Duration {
        Duration::from_millis(self.delays.request_interval)
    }

    /// Record type for a product URL: a mapped `material_types` match, then
    /// edge banding by URL, then `default_type`.
    pub fn material_for_url(&self, url: &str) -> String {
        let lower = url.to_lowercase();
        if let Some(material) = self
            .material_types
            .iter()
            .find(|m| lower.contains(&m.to_lowercase()))
        {
            return self
                .material_type_mapping
                .get(&material.to_lowercase())
                .cloned()
                .unwrap_or_else(|| self.default_type.clone());
        }
        if lower.contains("kromka") || lower.contains("edge") {
            return "edge".to_string();
        }
        self.default_type.clone()
    }

    pub fn unit_for(&self, material_type: &str) -> String {
        self.material_unit_mapping
            .get(material_type)
            .cloned()
            .unwrap_or_else(|| self.default_unit.clone())
    }
}
