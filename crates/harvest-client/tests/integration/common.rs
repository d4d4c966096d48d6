use std::sync::Arc;
use std::time::Duration;

use harvest_client::{ApiClient, ApiConfig};
use harvest_core::profile::SupplierProfile;
use wiremock::MockServer;

pub const TEST_SECRET: &str = "test-hmac-secret";
pub const TEST_TOKEN: &str = "test-parser-token";

pub fn api_config(server: &MockServer) -> ApiConfig {
    ApiConfig::new(&format!("{}/api", server.uri()))
        .unwrap()
        .with_hmac_secret(TEST_SECRET)
        .with_callback_token(TEST_TOKEN)
        .with_timeout(Duration::from_secs(2))
}

pub fn api_client(server: &MockServer) -> ApiClient {
    ApiClient::new(api_config(server))
        .unwrap()
        .with_supplier("acme")
        .with_session(Some("sess-1".into()))
}

pub fn profile(server: &MockServer) -> Arc<SupplierProfile> {
    let raw = format!(
        r#"{{
            "name": "acme",
            "base_url": "{uri}",
            "catalog_base_url": "{uri}/catalog/",
            "delays": {{"page_load_timeout": 500}},
            "url_collection": {{"min_chunk_size": 1}},
            "material_unit_mapping": {{"edge": "м.п."}}
        }}"#,
        uri = server.uri()
    );
    Arc::new(SupplierProfile::from_json(&raw).unwrap())
}

pub const CATALOG_PAGE: &str = r#"<html><body>
    <a href="/product/101/">Board 101</a>
    <a href="/product/102/">Board 102</a>
    <a href="/product/102/#reviews">Board 102 reviews</a>
    <a href="/kromka/product/7/">Edge 7</a>
    <a href="/about/">About</a>
    <a class="next" href="/catalog/?PAGEN_1=2">Next</a>
</body></html>"#;

pub const PRODUCT_PAGE: &str = r#"<html><head>
    <meta itemprop="name" content="ЛДСП Дуб Сонома 16мм">
    <meta itemprop="price" content="2150">
</head><body>
    <div class="catalog-detail">
        <span class="catalog-detail__article" data-article="DS-16"></span>
        <div class="catalog-detail__buy"><button>Купить</button></div>
    </div>
</body></html>"#;
