use std::time::Duration;

use harvest_client::{build_contexts, teardown_all};
use harvest_core::callback::CallbackChannel;
use harvest_core::chunk::ChunkSender;
use harvest_core::collector::{Collector, StopReason, TracingCollectReporter};
use harvest_core::context::{ContextPool, RunContext};
use harvest_core::metrics::RunStatus;
use harvest_core::rate_limit::RateLimitConfig;
use harvest_core::task::WorkerConfig;
use harvest_core::worker::{QueueWorker, TracingWorkerReporter};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::integration::common::{CATALOG_PAGE, PRODUCT_PAGE, api_client, profile};

#[tokio::test]
async fn collect_sends_discovered_urls_to_the_store() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/catalog/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(CATALOG_PAGE))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/parsing/save-urls"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
        .expect(1)
        .mount(&server)
        .await;

    let profile = profile(&server);
    let ctx = RunContext::new(None, RateLimitConfig::default());
    let sender = ChunkSender::new(
        api_client(&server),
        profile.name.clone(),
        profile.chunk_config(),
        ctx.dedup(),
    );
    let collector = Collector::new(
        profile.collect_plan(),
        profile.collect_limits(),
        profile.keyword_filter(),
    );

    let mut contexts = build_contexts(profile.clone(), 1).await.unwrap();
    let outcome = collector
        .collect(
            &mut contexts[0],
            &sender,
            &ctx,
            &CallbackChannel::disabled(),
            &TracingCollectReporter,
        )
        .await;
    teardown_all(&mut contexts).await;

    assert_eq!(outcome.stop_reason, StopReason::Completed);
    assert!(outcome.is_success());
    assert_eq!(outcome.stats.chunk.urls_unique_total, 3);
    assert_eq!(outcome.stats.chunk.urls_sent_total, 3);

    let requests = server.received_requests().await.unwrap();
    let save = requests
        .iter()
        .find(|r| r.url.path() == "/api/parsing/save-urls")
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&save.body).unwrap();
    assert_eq!(body["supplier"], "acme");
    let urls: Vec<&str> = body["urls"]
        .as_array()
        .unwrap()
        .iter()
        .map(|u| u["url"].as_str().unwrap())
        .collect();
    assert!(urls.iter().all(|u| !u.ends_with('/') && !u.contains('#')));
    assert!(urls.contains(&format!("{}/product/102", server.uri()).as_str()));
}

#[tokio::test]
async fn worker_extracts_saves_and_reports_a_batch() {
    let server = MockServer::start().await;
    let base = server.uri();

    Mock::given(method("POST"))
        .and(path("/api/parser/urls/claim"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "urls": [
                {"id": 1, "url": format!("{base}/product/1/"), "supplier": "acme"},
                {"id": 2, "url": format!("{base}/product/2/"), "supplier": "acme"}
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/product/1/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(PRODUCT_PAGE))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/product/2/"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/parser/materials/batch"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "summary": {"success": 1, "failed": 0}
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/parser/urls/report"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let profile = profile(&server);
    let config = WorkerConfig::new("acme")
        .with_worker_id("acme_it")
        .with_batch_size(2)
        .with_concurrency(2)
        .with_max_batches(Some(1))
        .with_nav_timeout(Duration::from_secs(2));
    let contexts = build_contexts(profile, config.concurrency).await.unwrap();
    let pool = ContextPool::new(contexts);
    let worker = QueueWorker::new(api_client(&server), pool, config).unwrap();

    let ctx = RunContext::new(None, RateLimitConfig::new(Duration::ZERO, 2));
    let summary = worker
        .run(&ctx, &CallbackChannel::disabled(), &TracingWorkerReporter)
        .await;

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.claimed_total, 2);
    assert_eq!(summary.successful, 1);
    assert_eq!(summary.blocked, 1);
    assert_eq!(summary.failed_by_code.get("HTTP_404"), Some(&1));

    let requests = server.received_requests().await.unwrap();
    let reported: Vec<serde_json::Value> = requests
        .iter()
        .filter(|r| r.url.path() == "/api/parser/urls/report")
        .flat_map(|r| {
            let body: serde_json::Value = serde_json::from_slice(&r.body).unwrap();
            body["results"].as_array().unwrap().clone()
        })
        .collect();
    assert_eq!(reported.len(), 2);
    assert!(reported.iter().any(|r| r["id"] == 1 && r["status"] == "done"));
    assert!(reported.iter().any(|r| r["id"] == 2 && r["status"] == "blocked"));
}
