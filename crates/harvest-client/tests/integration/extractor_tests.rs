use std::time::Duration;

use harvest_client::{CatalogExtractor, HttpExtractor, build_contexts, teardown_all};
use harvest_core::error::ExtractError;
use harvest_core::models::Availability;
use harvest_core::traits::Extractor;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::integration::common::{CATALOG_PAGE, PRODUCT_PAGE, profile};

async fn mount_html(server: &MockServer, route: &str, body: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body.to_owned(), "text/html; charset=utf-8"))
        .mount(server)
        .await;
}

#[tokio::test]
async fn open_and_scan_catalog_page() {
    let server = MockServer::start().await;
    mount_html(&server, "/catalog/", CATALOG_PAGE).await;

    let mut extractor = HttpExtractor::new(profile(&server));
    extractor.setup().await.unwrap();
    extractor.open(&format!("{}/catalog/", server.uri())).await.unwrap();

    let products = extractor.scan_products(r#"a[href*="/product/"]"#).await.unwrap();
    assert_eq!(products.len(), 4);
    assert_eq!(products[0], "/product/101/");
    let next = extractor.next_link("a.next").await.unwrap();
    assert_eq!(next.as_deref(), Some("/catalog/?PAGEN_1=2"));
    assert!(!extractor.scroll_more().await.unwrap());

    let metrics = extractor.take_metrics();
    assert!(metrics.goto_ms.is_some());
    assert_eq!(extractor.take_metrics().goto_ms, None);
}

#[tokio::test]
async fn missing_page_is_http_404() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let mut extractor = HttpExtractor::new(profile(&server));
    extractor.setup().await.unwrap();
    let err = extractor.open(&format!("{}/gone/", server.uri())).await.unwrap_err();
    assert_eq!(err, ExtractError::HttpStatus(404));
    assert!(extractor.scan_products("a").await.is_err());
}

#[tokio::test]
async fn extract_product_record() {
    let server = MockServer::start().await;
    mount_html(&server, "/kromka/product/7/", PRODUCT_PAGE).await;

    let mut extractor = HttpExtractor::new(profile(&server));
    extractor.setup().await.unwrap();
    let url = format!("{}/kromka/product/7/", server.uri());
    let record = extractor.extract(&url, Duration::from_secs(2)).await.unwrap();

    assert_eq!(record.article, "DS-16");
    assert_eq!(record.name, "ЛДСП Дуб Сонома 16мм");
    assert_eq!(record.price_per_unit, Some(2150.0));
    assert_eq!(record.availability_status, Availability::InStock);
    assert_eq!(record.material_type, "edge");
    assert_eq!(record.unit, "м.п.");
    assert_eq!(record.source_url, url);

    let metrics = extractor.take_metrics();
    assert!(metrics.goto_ms.is_some());
    assert!(metrics.parse_ms.is_some());
}

#[tokio::test]
async fn slow_page_is_nav_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(PRODUCT_PAGE)
                .set_delay(Duration::from_millis(800)),
        )
        .mount(&server)
        .await;

    let mut extractor = HttpExtractor::new(profile(&server));
    extractor.setup().await.unwrap();
    let err = extractor
        .extract(&format!("{}/product/1/", server.uri()), Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
}

#[tokio::test]
async fn forbidden_product_is_blocked() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let mut contexts = build_contexts(profile(&server), 1).await.unwrap();
    let context: &mut CatalogExtractor = &mut contexts[0];
    let err = context
        .extract(&format!("{}/product/1/", server.uri()), Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(err.code().is_blocking());
    teardown_all(&mut contexts).await;
}

#[tokio::test]
async fn extractor_requires_setup() {
    let server = MockServer::start().await;
    let mut extractor = HttpExtractor::new(profile(&server));
    let err = extractor
        .extract("https://shop.example/product/1", Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(err.is_environment_failure());
}
