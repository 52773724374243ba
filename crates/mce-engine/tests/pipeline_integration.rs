//! ---
//! mce_section: "01-core-functionality"
//! mce_subsection: "module"
//! mce_type: "source"
//! mce_scope: "code"
//! mce_description: "Collection pipeline stages and lifecycle management."
//! mce_version: "v0.1.0"
//! mce_owner: "tbd"
//! ---
//! End-to-end pipeline scenarios against scripted stub services.

use std::time::Duration;

use mce_engine::{CollectionPipeline, PipelineConfig, SourceSettings};
use mce_testharness::{mock_messages, ScriptedServer, StatusCode, StubResponse};

/// Compressed pacing so the error paths cycle quickly under test.
const TEST_ERROR_WAIT: Duration = Duration::from_millis(25);
const TEST_BACKOFF: Duration = Duration::from_millis(300);

fn test_config(
    source: &ScriptedServer,
    processing: &ScriptedServer,
    storage: &ScriptedServer,
) -> PipelineConfig {
    PipelineConfig {
        source: SourceSettings::new(source.base_url(), "test-token")
            .with_timeout(Duration::from_secs(2))
            .with_pacing(TEST_BACKOFF, TEST_ERROR_WAIT),
        processing_base_url: processing.base_url().to_string(),
        processing_timeout: Duration::from_secs(2),
        processing_workers: 3,
        storage_base_url: storage.base_url().to_string(),
        storage_timeout: Duration::from_secs(2),
        storage_workers: 3,
    }
}

async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            std::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn happy_path_stores_the_enriched_record_once() {
    let messages = mock_messages(1);
    let source = ScriptedServer::spawn(
        vec![StubResponse::source_batch(&messages, None)],
        StubResponse::empty_batch(),
    )
    .await
    .expect("source stub");
    let processing = ScriptedServer::always(StubResponse::enriched(&messages[0], "T1"))
        .await
        .expect("processing stub");
    let storage = ScriptedServer::always(StubResponse::created())
        .await
        .expect("storage stub");

    let handle = CollectionPipeline::new(test_config(&source, &processing, &storage))
        .start()
        .expect("pipeline starts");

    wait_for("the storage call", || storage.request_count() >= 1).await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let stored = storage.requests();
    assert_eq!(stored.len(), 1, "exactly one record reaches storage");
    let body = stored[0].json();
    assert_eq!(body["id"], "message-id-1");
    assert_eq!(body["processing_date"], "T1");
    assert_eq!(processing.request_count(), 1, "no retries were needed");

    handle.shutdown().await.expect("pipeline shuts down");
    source.shutdown().await;
    processing.shutdown().await;
    storage.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_collected_message_reaches_storage() {
    let batches = mce_testharness::mock_batches(3, 4);
    let script = batches
        .iter()
        .enumerate()
        .map(|(i, batch)| {
            let cursor = if i + 1 < batches.len() {
                Some(i as i64 + 1)
            } else {
                None
            };
            StubResponse::source_batch(batch, cursor)
        })
        .collect();
    let source = ScriptedServer::spawn(script, StubResponse::empty_batch())
        .await
        .expect("source stub");
    let processing = ScriptedServer::always(StubResponse::enriched(&batches[0][0], "T0"))
        .await
        .expect("processing stub");
    let storage = ScriptedServer::always(StubResponse::created())
        .await
        .expect("storage stub");

    let handle = CollectionPipeline::new(test_config(&source, &processing, &storage))
        .start()
        .expect("pipeline starts");

    wait_for("all records to reach storage", || {
        storage.request_count() >= 12
    })
    .await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(storage.request_count(), 12);
    assert_eq!(
        processing.request_count(),
        12,
        "every message is enriched exactly once"
    );

    handle.shutdown().await.expect("pipeline shuts down");
    source.shutdown().await;
    processing.shutdown().await;
    storage.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn source_requests_carry_the_auth_token_and_walk_the_cursor() {
    let messages = mock_messages(3);
    let source = ScriptedServer::spawn(
        vec![
            StubResponse::source_batch(&messages[0..1], Some(7)),
            StubResponse::source_batch(&messages[1..2], Some(9)),
            StubResponse::source_batch(&messages[2..3], None),
        ],
        StubResponse::empty_batch(),
    )
    .await
    .expect("source stub");
    let processing = ScriptedServer::always(StubResponse::enriched(&messages[0], "T1"))
        .await
        .expect("processing stub");
    let storage = ScriptedServer::always(StubResponse::created())
        .await
        .expect("storage stub");

    let handle = CollectionPipeline::new(test_config(&source, &processing, &storage))
        .start()
        .expect("pipeline starts");

    wait_for("four source requests", || source.request_count() >= 4).await;
    handle.shutdown().await.expect("pipeline shuts down");

    let requests = source.requests();
    let paths: Vec<&str> = requests.iter().map(|r| r.path.as_str()).collect();
    // The held cursor always mirrors the last parsed non-empty response,
    // including the step back to no-cursor when the feed answers null.
    assert_eq!(
        &paths[0..4],
        &["/messages", "/messages/7", "/messages/9", "/messages"]
    );
    for request in &requests {
        assert_eq!(request.method, "GET");
        assert_eq!(request.header("X-Auth-Token"), Some("test-token"));
    }

    source.shutdown().await;
    processing.shutdown().await;
    storage.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn processing_transient_failure_recovers_through_the_arbiter() {
    let messages = mock_messages(1);
    let source = ScriptedServer::spawn(
        vec![StubResponse::source_batch(&messages, None)],
        StubResponse::empty_batch(),
    )
    .await
    .expect("source stub");
    let processing = ScriptedServer::spawn(
        vec![StubResponse::failure(StatusCode::INTERNAL_SERVER_ERROR)],
        StubResponse::enriched(&messages[0], "T2"),
    )
    .await
    .expect("processing stub");
    let storage = ScriptedServer::always(StubResponse::created())
        .await
        .expect("storage stub");

    let handle = CollectionPipeline::new(test_config(&source, &processing, &storage))
        .start()
        .expect("pipeline starts");

    wait_for("the recovered record to reach storage", || {
        storage.request_count() >= 1
    })
    .await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let stored = storage.requests();
    assert_eq!(stored.len(), 1, "the record is emitted at most once");
    let body = stored[0].json();
    assert_eq!(body["id"], "message-id-1");
    assert_eq!(body["processing_date"], "T2");
    assert_eq!(
        processing.request_count(),
        2,
        "one failed attempt plus one successful retry"
    );

    handle.shutdown().await.expect("pipeline shuts down");
    source.shutdown().await;
    processing.shutdown().await;
    storage.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn processing_permanent_failure_exhausts_the_retry_budget() {
    let messages = mock_messages(1);
    let source = ScriptedServer::spawn(
        vec![StubResponse::source_batch(&messages, None)],
        StubResponse::empty_batch(),
    )
    .await
    .expect("source stub");
    let processing = ScriptedServer::always(StubResponse::failure(
        StatusCode::INTERNAL_SERVER_ERROR,
    ))
    .await
    .expect("processing stub");
    let storage = ScriptedServer::always(StubResponse::created())
        .await
        .expect("storage stub");

    let handle = CollectionPipeline::new(test_config(&source, &processing, &storage))
        .start()
        .expect("pipeline starts");

    wait_for("the retry budget to be spent", || {
        processing.request_count() >= 3
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(
        processing.request_count(),
        3,
        "initial attempt plus exactly two retries"
    );
    assert_eq!(storage.request_count(), 0, "storage never sees the message");

    handle.shutdown().await.expect("pipeline shuts down");
    source.shutdown().await;
    processing.shutdown().await;
    storage.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn storage_permanent_failure_exhausts_the_retry_budget() {
    let messages = mock_messages(1);
    let source = ScriptedServer::spawn(
        vec![StubResponse::source_batch(&messages, None)],
        StubResponse::empty_batch(),
    )
    .await
    .expect("source stub");
    let processing = ScriptedServer::always(StubResponse::enriched(&messages[0], "T4"))
        .await
        .expect("processing stub");
    let storage = ScriptedServer::always(StubResponse::failure(
        StatusCode::INTERNAL_SERVER_ERROR,
    ))
    .await
    .expect("storage stub");

    let handle = CollectionPipeline::new(test_config(&source, &processing, &storage))
        .start()
        .expect("pipeline starts");

    wait_for("the retry budget to be spent", || {
        storage.request_count() >= 3
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(
        storage.request_count(),
        3,
        "initial attempt plus exactly two retries"
    );
    assert_eq!(
        processing.request_count(),
        1,
        "a storage failure never re-enters the processed stream"
    );

    handle.shutdown().await.expect("pipeline shuts down");
    source.shutdown().await;
    processing.shutdown().await;
    storage.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rate_limit_caps_requests_within_a_window() {
    let messages = mock_messages(1);
    let source = ScriptedServer::always(StubResponse::source_batch(&messages, None))
        .await
        .expect("source stub");
    let processing = ScriptedServer::always(StubResponse::enriched(&messages[0], "T5"))
        .await
        .expect("processing stub");
    let storage = ScriptedServer::always(StubResponse::created())
        .await
        .expect("storage stub");

    let mut config = test_config(&source, &processing, &storage);
    config.source = config
        .source
        .clone()
        .with_rate_limit(2, Duration::from_secs(60))
        .with_pacing(TEST_BACKOFF, Duration::from_millis(10));

    let handle = CollectionPipeline::new(config).start().expect("pipeline starts");

    wait_for("the budget to be spent", || source.request_count() >= 2).await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(
        source.request_count(),
        2,
        "no more than the budget leaves the process within one window"
    );

    handle.shutdown().await.expect("pipeline shuts down");
    source.shutdown().await;
    processing.shutdown().await;
    storage.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn window_tick_reopens_the_request_budget() {
    let messages = mock_messages(1);
    let source = ScriptedServer::always(StubResponse::source_batch(&messages, None))
        .await
        .expect("source stub");
    let processing = ScriptedServer::always(StubResponse::enriched(&messages[0], "T5"))
        .await
        .expect("processing stub");
    let storage = ScriptedServer::always(StubResponse::created())
        .await
        .expect("storage stub");

    let mut config = test_config(&source, &processing, &storage);
    config.source = config
        .source
        .clone()
        .with_rate_limit(1, Duration::from_millis(200))
        .with_pacing(TEST_BACKOFF, Duration::from_millis(10));

    let handle = CollectionPipeline::new(config).start().expect("pipeline starts");

    tokio::time::sleep(Duration::from_millis(700)).await;
    let observed = source.request_count();
    assert!(
        (2..=5).contains(&observed),
        "ticker resets reopen the budget once per window, saw {} requests",
        observed
    );

    handle.shutdown().await.expect("pipeline shuts down");
    source.shutdown().await;
    processing.shutdown().await;
    storage.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn throttled_source_waits_out_the_backoff() {
    let messages = mock_messages(1);
    let source = ScriptedServer::spawn(
        vec![StubResponse::failure(StatusCode::TOO_MANY_REQUESTS)],
        StubResponse::source_batch(&messages, None),
    )
    .await
    .expect("source stub");
    let processing = ScriptedServer::always(StubResponse::enriched(&messages[0], "T6"))
        .await
        .expect("processing stub");
    let storage = ScriptedServer::always(StubResponse::created())
        .await
        .expect("storage stub");

    let handle = CollectionPipeline::new(test_config(&source, &processing, &storage))
        .start()
        .expect("pipeline starts");

    wait_for("the request after the backoff", || {
        source.request_count() >= 2
    })
    .await;

    let requests = source.requests();
    let gap = requests[1].at.duration_since(requests[0].at);
    assert!(
        gap >= Duration::from_millis(250),
        "the 429 earns the long backoff, observed gap {:?}",
        gap
    );

    handle.shutdown().await.expect("pipeline shuts down");
    source.shutdown().await;
    processing.shutdown().await;
    storage.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_drains_the_cascade() {
    let source = ScriptedServer::always(StubResponse::empty_batch())
        .await
        .expect("source stub");
    let processing = ScriptedServer::always(StubResponse::failure(
        StatusCode::INTERNAL_SERVER_ERROR,
    ))
    .await
    .expect("processing stub");
    let storage = ScriptedServer::always(StubResponse::created())
        .await
        .expect("storage stub");

    let handle = CollectionPipeline::new(test_config(&source, &processing, &storage))
        .start()
        .expect("pipeline starts");

    tokio::time::sleep(Duration::from_millis(100)).await;
    tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
        .await
        .expect("cascade drains within the deadline")
        .expect("shutdown reports clean joins");

    source.shutdown().await;
    processing.shutdown().await;
    storage.shutdown().await;
}
