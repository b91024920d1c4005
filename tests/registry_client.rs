//! Registry client integration tests against a mock HTTP server.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use httpmock::prelude::*;
use serde_json::json;

use tendervec::errors::PipelineError;
use tendervec::ratelimit::{AdaptiveLimiter, LimiterConfig, RetryPolicy};
use tendervec::source::{DateWindow, FetchMode, RegistryClient};
use tendervec::Settings;

fn test_settings(base_url: String) -> Settings {
    Settings {
        database_url: "postgresql://unused".into(),
        registry_base_url: base_url,
        embeddings_url: "http://unused".into(),
        embeddings_api_key: "unused".into(),
        embedding_model: "mock".into(),
        page_size: 2,
        workers: 2,
        http_timeout: Duration::from_secs(5),
        epoch: NaiveDate::from_ymd_opt(2018, 1, 1).unwrap(),
    }
}

fn fast_limiter() -> Arc<AdaptiveLimiter> {
    Arc::new(AdaptiveLimiter::new(LimiterConfig {
        initial_interval: Duration::from_millis(1),
        floor_interval: Duration::from_millis(1),
        max_jitter: Duration::ZERO,
        ..Default::default()
    }))
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(5),
        ..Default::default()
    }
}

fn window() -> DateWindow {
    DateWindow::single_day(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap())
}

#[tokio::test]
async fn fetches_and_parses_a_page() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET)
            .path("/notices")
            .query_param("published_from", "2025-01-01")
            .query_param("published_to", "2025-01-01")
            .query_param("page", "1")
            .query_param("page_size", "2");
        then.status(200).json_body(json!({
            "total_pages": 2,
            "notices": [
                {
                    "id": "n-1",
                    "title": "Snow removal",
                    "description": "District 1 snow removal services",
                    "published_at": "2025-01-01"
                },
                {
                    "id": "n-2",
                    "title": "IT support",
                    "description": "Helpdesk services",
                    "published_at": "2025-01-01",
                    "updated_at": "2025-01-01T10:00:00Z"
                }
            ]
        }));
    });

    let client = RegistryClient::new(&test_settings(server.base_url()), fast_limiter()).unwrap();
    let page = client
        .fetch_page(window(), FetchMode::ByPublication, 1)
        .await
        .unwrap();

    mock.assert();
    assert_eq!(page.total_pages, 2);
    assert_eq!(page.notices.len(), 2);
    assert_eq!(page.skipped, 0);
    assert_eq!(page.notices[0].notice_id, "n-1");
}

#[tokio::test]
async fn by_update_mode_uses_the_update_parameters() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET)
            .path("/notices")
            .query_param("updated_from", "2025-01-01")
            .query_param("updated_to", "2025-01-01");
        then.status(200)
            .json_body(json!({ "total_pages": 1, "notices": [] }));
    });

    let client = RegistryClient::new(&test_settings(server.base_url()), fast_limiter()).unwrap();
    let page = client
        .fetch_page(window(), FetchMode::ByUpdate, 1)
        .await
        .unwrap();

    mock.assert();
    assert!(page.notices.is_empty());
}

#[tokio::test]
async fn malformed_records_are_skipped_not_fatal() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/notices");
        then.status(200).json_body(json!({
            "total_pages": 1,
            "notices": [
                { "id": "good", "published_at": "2025-01-01" },
                { "id": "bad", "published_at": "not-a-date" },
                { "published_at": "2025-01-01" }
            ]
        }));
    });

    let client = RegistryClient::new(&test_settings(server.base_url()), fast_limiter()).unwrap();
    let page = client
        .fetch_page(window(), FetchMode::ByPublication, 1)
        .await
        .unwrap();

    assert_eq!(page.notices.len(), 1);
    assert_eq!(page.notices[0].notice_id, "good");
    assert_eq!(page.skipped, 2);
}

#[tokio::test]
async fn not_found_is_returned_without_retries() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET).path("/notices");
        then.status(404);
    });

    let client = RegistryClient::new(&test_settings(server.base_url()), fast_limiter())
        .unwrap()
        .with_retry_policy(fast_retry());
    let err = client
        .fetch_page(window(), FetchMode::ByPublication, 1)
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::NotFound));
    mock.assert_hits(1);
}

#[tokio::test]
async fn server_errors_retry_then_exhaust_as_skippable() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET).path("/notices");
        then.status(503);
    });

    let client = RegistryClient::new(&test_settings(server.base_url()), fast_limiter())
        .unwrap()
        .with_retry_policy(fast_retry());
    let err = client
        .fetch_page(window(), FetchMode::ByPublication, 1)
        .await
        .unwrap_err();

    mock.assert_hits(3);
    match err {
        PipelineError::Exhausted { attempts, last } => {
            assert_eq!(attempts, 3);
            assert!(matches!(*last, PipelineError::Server { status: 503 }));
        }
        other => panic!("expected Exhausted, got {other:?}"),
    }
}

#[tokio::test]
async fn rate_limited_responses_raise_the_pacing_interval() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/notices");
        then.status(429);
    });

    let limiter = Arc::new(AdaptiveLimiter::new(LimiterConfig {
        initial_interval: Duration::from_millis(1),
        floor_interval: Duration::from_millis(1),
        max_jitter: Duration::ZERO,
        checkpoint_every: 3,
        ..Default::default()
    }));
    let client = RegistryClient::new(&test_settings(server.base_url()), Arc::clone(&limiter))
        .unwrap()
        .with_retry_policy(RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            throttle_scale: 1,
            ..Default::default()
        });

    let before = limiter.current_interval().await;
    let _ = client
        .fetch_page(window(), FetchMode::ByPublication, 1)
        .await;
    let after = limiter.current_interval().await;

    assert!(after > before, "3 throttle outcomes hit a checkpoint: {before:?} -> {after:?}");
    assert_eq!(limiter.totals().await.rate_limited, 3);
}

#[tokio::test]
async fn buyer_profile_fetch_maps_not_found() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/buyers/ORG-1");
        then.status(200).json_body(json!({ "name": "City of Example" }));
    });
    server.mock(|when, then| {
        when.method(GET).path("/buyers/ORG-GONE");
        then.status(404);
    });

    let client = RegistryClient::new(&test_settings(server.base_url()), fast_limiter()).unwrap();

    let profile = client.fetch_buyer("ORG-1").await.unwrap();
    assert_eq!(profile["name"], "City of Example");

    let err = client.fetch_buyer("ORG-GONE").await.unwrap_err();
    assert!(matches!(err, PipelineError::NotFound));
}
