pub mod api;
#[cfg(feature = "browser")]
pub mod browser;
pub mod callback;
pub mod config;
pub mod extractor;
pub mod html;
pub mod registry;

pub use api::ApiClient;
#[cfg(feature = "browser")]
pub use browser::{BrowserExtractor, SharedBrowser};
pub use callback::HttpCallbackTransport;
pub use config::ApiConfig;
pub use extractor::HttpExtractor;
pub use registry::{CatalogExtractor, build_contexts, teardown_all};
