use chrono::Utc;
use harvest_client::HttpCallbackTransport;
use harvest_client::api::sign;
use harvest_core::callback::{CallbackEnvelope, CallbackEvent};
use harvest_core::chunk::UrlChunk;
use harvest_core::error::AppError;
use harvest_core::models::CandidateUrl;
use harvest_core::session::LifecycleStatus;
use harvest_core::task::{UrlResult, WorkerConfig};
use harvest_core::testutil::{make_test_record, make_test_task};
use harvest_core::traits::{CallbackTransport, SessionApi, TaskStore, UrlSink};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::integration::common::{TEST_SECRET, TEST_TOKEN, api_client, api_config};

#[tokio::test]
async fn save_urls_is_signed_over_the_exact_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/parsing/save-urls"))
        .and(header("X-Parser-Token", TEST_TOKEN))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"success": true})))
        .expect(1)
        .mount(&server)
        .await;

    let chunk = UrlChunk {
        collected_at: "2026-03-01T10:00:00Z".parse().unwrap(),
        supplier: "acme".into(),
        urls: vec![
            CandidateUrl::new("https://shop.example/product/1", Some("ldsp".into())),
            CandidateUrl::new("https://shop.example/product/2", None),
        ],
    };
    let status = api_client(&server).send_chunk(&chunk).await.unwrap();
    assert_eq!(status, 201);

    let requests = server.received_requests().await.unwrap();
    let request = &requests[0];
    assert_eq!(request.body, chunk.canonical_bytes().unwrap());
    let signature = request.headers.get("X-HMAC-Signature").unwrap().to_str().unwrap();
    assert_eq!(signature, sign(&request.body, TEST_SECRET).unwrap());
}

#[tokio::test]
async fn save_urls_without_secret_is_not_sent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/parsing/save-urls"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
        .expect(0)
        .mount(&server)
        .await;

    let config = harvest_client::ApiConfig::new(&format!("{}/api", server.uri())).unwrap();
    let client = harvest_client::ApiClient::new(config).unwrap().with_supplier("acme");
    let chunk = UrlChunk {
        collected_at: Utc::now(),
        supplier: "acme".into(),
        urls: vec![CandidateUrl::new("https://shop.example/product/1", None)],
    };
    let err = client.send_chunk(&chunk).await.unwrap_err();

    assert!(matches!(err, AppError::ConfigError(_)));
    assert!(!err.is_retryable());
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn save_urls_rejection_carries_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/parsing/save-urls"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad signature"))
        .mount(&server)
        .await;

    let chunk = UrlChunk {
        collected_at: Utc::now(),
        supplier: "acme".into(),
        urls: vec![CandidateUrl::new("https://shop.example/product/1", None)],
    };
    let err = api_client(&server).send_chunk(&chunk).await.unwrap_err();
    assert!(err.is_auth_failure());
    assert!(err.to_string().contains("bad signature"));
}

#[tokio::test]
async fn claim_sends_request_and_parses_tasks() {
    let server = MockServer::start().await;
    let config = WorkerConfig::new("acme")
        .with_worker_id("acme_w1")
        .with_batch_size(2)
        .with_material_type(Some("ldsp".into()));

    Mock::given(method("POST"))
        .and(path("/api/parser/urls/claim"))
        .and(body_json(json!({
            "supplier": "acme",
            "batch_size": 2,
            "worker_id": "acme_w1",
            "reparse_days": 7,
            "material_type": "ldsp"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "urls": [
                {"supplier_url_id": 11, "url": "https://shop.example/product/11", "supplier_name": "acme"},
                {"id": 12, "url": "https://shop.example/product/12", "supplier": "acme", "material_type": "ldsp"}
            ]
        })))
        .mount(&server)
        .await;

    let tasks = api_client(&server).claim(&config.claim_request()).await.unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].id, 11);
    assert_eq!(tasks[1].material_type.as_deref(), Some("ldsp"));
}

#[tokio::test]
async fn unsuccessful_claim_is_empty() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/parser/urls/claim"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": false})))
        .mount(&server)
        .await;

    let tasks = api_client(&server)
        .claim(&WorkerConfig::new("acme").claim_request())
        .await
        .unwrap();
    assert!(tasks.is_empty());
}

#[tokio::test]
async fn report_and_release_payloads() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/parser/urls/release"))
        .and(body_json(json!({"worker_id": "acme_w1"})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/parser/urls/report"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let client = api_client(&server);
    let task = make_test_task(5, "https://shop.example/product/5");
    let result = UrlResult::from_record(&task, make_test_record(&task.url));
    client.report(&[result.to_report()]).await.unwrap();
    client.report(&[]).await.unwrap();
    client.release("acme_w1").await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let report = requests
        .iter()
        .find(|r| r.url.path() == "/api/parser/urls/report")
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&report.body).unwrap();
    assert_eq!(body["results"][0]["id"], 5);
    assert_eq!(body["results"][0]["status"], "done");
}

#[tokio::test]
async fn save_materials_returns_summary_or_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/parser/materials/batch"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "summary": {"success": 2, "failed": 0}
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/parser/materials/batch"))
        .respond_with(ResponseTemplate::new(500).set_body_string("db down"))
        .mount(&server)
        .await;

    let client = api_client(&server);
    let records = vec![
        make_test_record("https://shop.example/product/1"),
        make_test_record("https://shop.example/product/2"),
    ];
    let summary = client.save_materials(&records).await.unwrap();
    assert_eq!(summary.success, 2);

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["session_id"], "sess-1");
    assert_eq!(body["supplier"], "acme");
    assert_eq!(body["materials"][0]["type"], "plate");
    assert_eq!(body["materials"][0]["origin"], "parser");

    let err = client.save_materials(&records).await.unwrap_err();
    assert_eq!(err.status_code(), Some(500));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn session_state_reads_data_envelope() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/parsing/sessions/sess-1/state"))
        .and(header("Authorization", format!("Bearer {TEST_TOKEN}").as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": {
                "lifecycle_status": "collect_done",
                "can_collect": false,
                "has_collect_executed": true,
                "has_parsing_started": false
            }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/parsing/sessions/missing/state"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": false})))
        .mount(&server)
        .await;

    let client = api_client(&server);
    let state = client.session_state("sess-1").await.unwrap();
    assert_eq!(state.lifecycle_status, LifecycleStatus::CollectDone);
    assert!(state.has_collect_executed);

    let err = client.session_state("missing").await.unwrap_err();
    assert!(matches!(err, AppError::SessionError(_)));
}

#[tokio::test]
async fn full_scan_reset_reports_pending() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/parser/urls/full-scan-reset"))
        .and(body_json(json!({"supplier_name": "acme"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "before": {"pending": 0, "done": 40},
            "after": {"pending": 40, "done": 0}
        })))
        .mount(&server)
        .await;

    let outcome = api_client(&server).full_scan_reset("acme").await.unwrap();
    assert_eq!(outcome.pending(), 40);
}

#[tokio::test]
async fn unreachable_store_is_a_network_error() {
    let server = MockServer::start().await;
    let config = api_config(&server);
    drop(server);

    let client = harvest_client::ApiClient::new(config).unwrap();
    let err = client.release("w").await.unwrap_err();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn callback_transport_posts_envelope_with_bearer() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/internal/parser/callback"))
        .and(header("Authorization", "Bearer cb-token"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let transport = HttpCallbackTransport::new(&api_config(&server)).unwrap();
    let envelope = CallbackEnvelope {
        session_id: "sess-1".into(),
        token: "cb-token".into(),
        timestamp: 1_700_000_000,
        event_id: "sess-1:total_urls:1".into(),
        event: CallbackEvent::TotalUrls { total: 12 },
    };
    transport.deliver(&envelope).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["session_id"], "sess-1");
    assert_eq!(body["event_id"], "sess-1:total_urls:1");
    assert_eq!(body["type"], "total_urls");
    assert_eq!(body["payload"]["total"], 12);
}

#[tokio::test]
async fn callback_rejection_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/internal/parser/callback"))
        .respond_with(ResponseTemplate::new(422))
        .mount(&server)
        .await;

    let transport = HttpCallbackTransport::new(&api_config(&server)).unwrap();
    let envelope = CallbackEnvelope {
        session_id: "sess-1".into(),
        token: "t".into(),
        timestamp: 0,
        event_id: "sess-1:log:1".into(),
        event: CallbackEvent::Log {
            level: "info".into(),
            message: "hello".into(),
        },
    };
    let err = transport.deliver(&envelope).await.unwrap_err();
    assert!(err.is_auth_failure());
}
