//! Polling End-to-End Integration Tests
//!
//! Tests the PollingFetcher against a scripted transport:
//! - Initial load visibility and silent periodic refresh
//! - Failure handling that keeps the last good data
//! - Supersession by manual refresh and by deactivation
//! - Record identity across polls feeding a paginated tab

use super::*;
use serde_json::json;
use vigil_core::diagnostics::MemorySink;
use vigil_core::{
    DiagnosticKind, FetchErrorKind, PollingFetcher, RecordFilter, RecordReconciler, RecordShape,
    RefreshOutcome, SourceConfig, SourcePhase, TabView,
};

const ALERTS_URL: &str = "http://hooks.local/webhook/alerts";

struct Harness {
    fetcher: Arc<PollingFetcher<RecordReconciler>>,
    transport: Arc<ScriptedTransport>,
    diagnostics: DiagnosticContext,
    sink: Arc<MemorySink>,
}

fn harness_with(source: SourceConfig, transport: Arc<ScriptedTransport>) -> Harness {
    let (diagnostics, sink) = memory_diagnostics("polling-e2e");
    let reconciler =
        RecordReconciler::new(&source, "id", diagnostics.clone()).with_recency("ts");
    let fetcher = PollingFetcher::new(source, transport.clone(), reconciler, diagnostics.clone());
    Harness {
        fetcher: Arc::new(fetcher),
        transport,
        diagnostics,
        sink,
    }
}

fn harness(transport: Arc<ScriptedTransport>) -> Harness {
    harness_with(SourceConfig::new("alerts", ALERTS_URL), transport)
}

/// Test 1: Initial load is visible as loading, then ready
#[tokio::test(start_paused = true)]
async fn test_initial_load_shows_loading_then_ready() {
    let transport = ScriptedTransport::new();
    transport.respond_after(
        ALERTS_URL,
        Duration::from_millis(100),
        json_body(json!([{"id": "a"}])),
    );
    let h = harness(transport);
    let mut rx = h.fetcher.subscribe();

    assert!(h.fetcher.activate());

    rx.changed().await.unwrap();
    let loading = rx.borrow_and_update().clone();
    assert!(loading.loading);
    assert_eq!(loading.phase, SourcePhase::Loading);
    assert!(loading.data.is_none());

    rx.changed().await.unwrap();
    let ready = rx.borrow_and_update().clone();
    assert!(!ready.loading);
    assert_eq!(ready.phase, SourcePhase::Ready);
    assert!(ready.connected);
    assert!(ready.error.is_none());
    assert!(ready.last_updated.is_some());
    assert_eq!(ids(&ready.data.unwrap().records), vec!["a"]);

    h.fetcher.deactivate();
}

/// Test 2: A failing silent refresh keeps the last good data
#[tokio::test(start_paused = true)]
async fn test_silent_failure_keeps_previous_data() {
    let transport = ScriptedTransport::new();
    transport.respond(ALERTS_URL, json_body(json!([{"id": "a"}, {"id": "b"}])));
    transport.respond(
        ALERTS_URL,
        RawResponse::new(503, "<html><body>Service Unavailable</body></html>"),
    );
    transport.respond(ALERTS_URL, json_body(json!([{"id": "a"}])));
    let h = harness_with(
        SourceConfig::new("alerts", ALERTS_URL).with_interval_secs(5),
        transport,
    );

    h.fetcher.activate();
    sleep(Duration::from_millis(10)).await;
    assert_eq!(h.fetcher.phase(), SourcePhase::Ready);

    // First tick fails
    sleep(Duration::from_secs(5)).await;
    let snapshot = h.fetcher.snapshot();
    assert_eq!(snapshot.phase, SourcePhase::Errored);
    assert!(!snapshot.loading);
    assert!(!snapshot.connected);
    assert_eq!(snapshot.error.as_deref(), Some("service unavailable"));
    assert_eq!(ids(&snapshot.data.unwrap().records), vec!["a", "b"]);

    // Markup goes to diagnostics only
    let notes = h.sink.notes();
    let http = notes
        .iter()
        .find(|n| n.kind == DiagnosticKind::Fetch(FetchErrorKind::Http))
        .expect("http failure note");
    assert_eq!(http.status, Some(503));
    assert!(http.detail.contains("Service Unavailable"));

    // Second tick recovers
    sleep(Duration::from_secs(5)).await;
    let snapshot = h.fetcher.snapshot();
    assert_eq!(snapshot.phase, SourcePhase::Ready);
    assert!(snapshot.connected);
    assert!(snapshot.error.is_none());
    assert_eq!(ids(&snapshot.data.unwrap().records), vec!["a"]);

    let stats = h.diagnostics.metrics().get("alerts").unwrap();
    assert_eq!(stats.attempts, 3);
    assert_eq!(stats.failures, 1);
    h.fetcher.deactivate();
}

/// Test 3: A silent refresh does not start while a fetch is in flight
#[tokio::test(start_paused = true)]
async fn test_silent_refresh_skipped_while_in_flight() {
    let transport = ScriptedTransport::new();
    transport.respond(ALERTS_URL, json_body(json!([])));
    transport.respond_after(
        ALERTS_URL,
        Duration::from_secs(10),
        json_body(json!([{"id": "slow"}])),
    );
    let h = harness(transport);

    h.fetcher.activate();
    sleep(Duration::from_millis(10)).await;

    let fetcher = Arc::clone(&h.fetcher);
    let manual = tokio::spawn(async move { fetcher.refresh(false).await });
    sleep(Duration::from_millis(1)).await;
    assert!(h.fetcher.state().in_flight);

    assert_eq!(h.fetcher.refresh(true).await, RefreshOutcome::Skipped);
    assert_eq!(manual.await.unwrap(), RefreshOutcome::Applied);
    assert_eq!(h.transport.calls(ALERTS_URL), 2);
    assert!(!h.fetcher.state().in_flight);
    h.fetcher.deactivate();
}

/// Test 4: A newer manual refresh wins over a slower older one
///
/// Flow:
/// 1. Refresh A starts and takes 10s
/// 2. Refresh B starts 1ms later and takes 1s
/// 3. B is applied; A completes afterwards and is discarded
#[tokio::test(start_paused = true)]
async fn test_manual_refresh_supersedes_older_fetch() {
    let transport = ScriptedTransport::new();
    transport.respond(ALERTS_URL, json_body(json!([])));
    transport.respond_after(
        ALERTS_URL,
        Duration::from_secs(10),
        json_body(json!([{"id": "old"}])),
    );
    transport.respond_after(
        ALERTS_URL,
        Duration::from_secs(1),
        json_body(json!([{"id": "new"}])),
    );
    let h = harness(transport);

    h.fetcher.activate();
    sleep(Duration::from_millis(10)).await;

    let fetcher = Arc::clone(&h.fetcher);
    let older = tokio::spawn(async move { fetcher.refresh(false).await });
    sleep(Duration::from_millis(1)).await;

    assert_eq!(h.fetcher.refresh(false).await, RefreshOutcome::Applied);
    assert_eq!(older.await.unwrap(), RefreshOutcome::Superseded);

    let snapshot = h.fetcher.snapshot();
    assert_eq!(ids(&snapshot.data.unwrap().records), vec!["new"]);
    assert!(!snapshot.loading);
    assert_eq!(h.diagnostics.metrics().get("alerts").unwrap().discarded, 1);
    h.fetcher.deactivate();
}

/// Test 5: Deactivation discards a fetch that is still in flight
#[tokio::test(start_paused = true)]
async fn test_deactivate_discards_in_flight_result() {
    let transport = ScriptedTransport::new();
    transport.respond(ALERTS_URL, json_body(json!([{"id": "a"}])));
    transport.respond_after(
        ALERTS_URL,
        Duration::from_secs(10),
        json_body(json!([{"id": "a"}, {"id": "late"}])),
    );
    let h = harness(transport);

    h.fetcher.activate();
    sleep(Duration::from_millis(10)).await;

    let fetcher = Arc::clone(&h.fetcher);
    let pending = tokio::spawn(async move { fetcher.refresh(false).await });
    sleep(Duration::from_millis(1)).await;

    h.fetcher.deactivate();
    assert!(!h.fetcher.is_active());
    assert_eq!(pending.await.unwrap(), RefreshOutcome::Superseded);

    let snapshot = h.fetcher.snapshot();
    assert_eq!(snapshot.phase, SourcePhase::Idle);
    assert!(!snapshot.loading);
    assert_eq!(ids(&snapshot.data.unwrap().records), vec!["a"]);

    let stats = h.diagnostics.metrics().get("alerts").unwrap();
    assert_eq!(stats.attempts, 1);
    assert_eq!(stats.discarded, 1);

    assert_eq!(h.fetcher.refresh(true).await, RefreshOutcome::Skipped);
    assert_eq!(h.fetcher.refresh(false).await, RefreshOutcome::Skipped);
}

/// Test 6: Periodic ticks refresh silently and stop on deactivation
#[tokio::test(start_paused = true)]
async fn test_periodic_ticks_refresh_silently() {
    let transport = ScriptedTransport::new();
    transport.respond(ALERTS_URL, json_body(json!([{"id": "a"}])));
    let h = harness_with(
        SourceConfig::new("alerts", ALERTS_URL).with_interval_secs(5),
        transport,
    );

    h.fetcher.activate();
    sleep(Duration::from_millis(10)).await;
    assert_eq!(h.transport.calls(ALERTS_URL), 1);

    sleep(Duration::from_secs(5)).await;
    assert_eq!(h.transport.calls(ALERTS_URL), 2);
    sleep(Duration::from_secs(5)).await;
    assert_eq!(h.transport.calls(ALERTS_URL), 3);

    let snapshot = h.fetcher.snapshot();
    assert_eq!(snapshot.phase, SourcePhase::Ready);
    assert!(!snapshot.loading);
    assert!(snapshot.data.unwrap().report.is_noop());

    h.fetcher.deactivate();
    sleep(Duration::from_secs(30)).await;
    assert_eq!(h.transport.calls(ALERTS_URL), 3);
}

/// Test 7: Intervals outside the supported range are clamped
#[tokio::test(start_paused = true)]
async fn test_interval_is_clamped_to_minimum() {
    let transport = ScriptedTransport::new();
    transport.respond(ALERTS_URL, json_body(json!([])));
    let h = harness_with(
        SourceConfig::new("alerts", ALERTS_URL).with_interval_secs(1),
        transport,
    );

    h.fetcher.activate();
    sleep(Duration::from_millis(4900)).await;
    assert_eq!(h.transport.calls(ALERTS_URL), 1);
    sleep(Duration::from_millis(200)).await;
    assert_eq!(h.transport.calls(ALERTS_URL), 2);
    h.fetcher.deactivate();
}

/// Test 8: Empty bodies and timeouts
#[tokio::test(start_paused = true)]
async fn test_no_content_then_timeout() {
    let transport = ScriptedTransport::new();
    transport.respond(ALERTS_URL, RawResponse::no_content());
    transport.fail(ALERTS_URL, TransportError::Timeout(Duration::from_secs(12)));
    let h = harness(transport);

    h.fetcher.activate();
    sleep(Duration::from_millis(10)).await;

    let snapshot = h.fetcher.snapshot();
    assert_eq!(snapshot.phase, SourcePhase::Ready);
    assert!(snapshot.connected);
    assert!(snapshot.data.unwrap().records.is_empty());

    assert_eq!(
        h.fetcher.refresh(false).await,
        RefreshOutcome::Failed("request timed out".to_string())
    );
    let state = h.fetcher.state();
    assert!(!state.connected);
    assert_eq!(state.last_error.as_deref(), Some("request timed out"));
    h.fetcher.deactivate();
}

/// Test 9: Unchanged records keep their identity across polls
///
/// Flow:
/// 1. First poll returns a (older) and b (newer)
/// 2. Second poll changes only b
/// 3. a is the same allocation, b is a new one; order stays newest first
/// 4. A third identical poll changes nothing
#[tokio::test(start_paused = true)]
async fn test_unchanged_records_keep_identity() {
    let transport = ScriptedTransport::new();
    transport.respond(
        ALERTS_URL,
        json_body(json!([
            {"id": "a", "status": "Success", "ts": "2024-05-01T10:00:00Z"},
            {"id": "b", "status": "Warning", "ts": "2024-05-01T11:00:00Z"}
        ])),
    );
    transport.respond(
        ALERTS_URL,
        json_body(json!([
            {"id": "a", "status": "Success", "ts": "2024-05-01T10:00:00Z"},
            {"id": "b", "status": "Failed", "ts": "2024-05-01T11:00:00Z"}
        ])),
    );
    let h = harness(transport);

    h.fetcher.activate();
    sleep(Duration::from_millis(10)).await;
    let first = h.fetcher.snapshot().data.unwrap();
    assert_eq!(ids(&first.records), vec!["b", "a"]);
    assert_eq!(first.report.added, 2);

    assert_eq!(h.fetcher.refresh(false).await, RefreshOutcome::Applied);
    let second = h.fetcher.snapshot().data.unwrap();
    assert_eq!(ids(&second.records), vec!["b", "a"]);
    assert_eq!(second.report.changed, 1);
    assert_eq!(second.report.unchanged, 1);
    assert!(Arc::ptr_eq(&first.records[1], &second.records[1]));
    assert!(!Arc::ptr_eq(&first.records[0], &second.records[0]));
    assert_eq!(second.records[0]["status"], "Failed");

    assert_eq!(h.fetcher.refresh(false).await, RefreshOutcome::Applied);
    let third = h.fetcher.snapshot().data.unwrap();
    assert!(third.report.is_noop());
    assert!(second
        .records
        .iter()
        .zip(&third.records)
        .all(|(x, y)| Arc::ptr_eq(x, y)));
    h.fetcher.deactivate();
}

/// Test 10: Malformed records are dropped and reported
#[tokio::test(start_paused = true)]
async fn test_malformed_records_are_reported() {
    let transport = ScriptedTransport::new();
    transport.respond(
        ALERTS_URL,
        json_body(json!([{"id": "a"}, {"name": "no id"}, {"id": "a", "dup": true}])),
    );
    let h = harness(transport);

    h.fetcher.activate();
    sleep(Duration::from_millis(10)).await;

    let data = h.fetcher.snapshot().data.unwrap();
    assert_eq!(ids(&data.records), vec!["a"]);
    assert_eq!(data.report.discarded, 2);
    assert_eq!(h.sink.count(DiagnosticKind::MalformedRecord), 1);
    assert_eq!(h.sink.count(DiagnosticKind::DuplicateKey), 1);
    h.fetcher.deactivate();
}

/// Test 11: Main-with-meta payloads expose their meta block
#[tokio::test(start_paused = true)]
async fn test_main_with_meta_shape() {
    let transport = ScriptedTransport::new();
    transport.respond(
        ALERTS_URL,
        json_body(json!([[{"id": "a"}, {"id": "b"}], {"total": 2}])),
    );
    let h = harness_with(
        SourceConfig::new("alerts", ALERTS_URL).with_shape(RecordShape::MainWithMeta),
        transport,
    );

    h.fetcher.activate();
    sleep(Duration::from_millis(10)).await;

    let data = h.fetcher.snapshot().data.unwrap();
    assert_eq!(data.records.len(), 2);
    assert_eq!(data.meta, Some(json!({"total": 2})));
    h.fetcher.deactivate();
}

/// Test 12: A tab over the polled collection clamps its page when data shrinks
#[tokio::test(start_paused = true)]
async fn test_tab_view_follows_polled_collection() {
    let many: Vec<Value> = (0..17)
        .map(|i| {
            json!({
                "id": format!("job-{:02}", i),
                "name": format!("backup {}", i),
                "status": if i % 2 == 0 { "Success" } else { "Failed" },
            })
        })
        .collect();
    let few: Vec<Value> = many.iter().take(5).cloned().collect();

    let transport = ScriptedTransport::new();
    transport.respond(ALERTS_URL, json_body(Value::Array(many)));
    transport.respond(ALERTS_URL, json_body(Value::Array(few)));
    let h = harness(transport);

    h.fetcher.activate();
    sleep(Duration::from_millis(10)).await;

    let mut tab = TabView::new("jobs", RecordFilter::new(["name"]), 8);
    tab.set_records(h.fetcher.snapshot().data.unwrap().records);
    assert_eq!(tab.pagination().total_pages(), 3);
    assert!(tab.pagination_mut().set_current_page(3));
    assert_eq!(tab.page().len(), 1);

    h.fetcher.refresh(false).await;
    tab.set_records(h.fetcher.snapshot().data.unwrap().records);
    assert_eq!(tab.pagination().current_page(), 1);
    assert_eq!(tab.page().len(), 5);

    tab.set_status(Some("fail".to_string()));
    assert_eq!(tab.page().len(), 2);
    assert_eq!(tab.total_unfiltered(), 5);
    h.fetcher.deactivate();
}

/// Test 13: A refresh dropped mid-fetch does not stall polling
///
/// Flow:
/// 1. A manual refresh is wrapped in a 1s timeout against a 100s response
/// 2. The timeout drops the refresh; in-flight and loading are cleared
/// 3. The next periodic tick runs and applies fresh data
#[tokio::test(start_paused = true)]
async fn test_cancelled_refresh_does_not_stall_polling() {
    let transport = ScriptedTransport::new();
    transport.respond(ALERTS_URL, json_body(json!([{"id": "a"}])));
    transport.respond_after(
        ALERTS_URL,
        Duration::from_secs(100),
        json_body(json!([{"id": "slow"}])),
    );
    transport.respond(ALERTS_URL, json_body(json!([{"id": "fresh"}])));
    let h = harness_with(
        SourceConfig::new("alerts", ALERTS_URL).with_interval_secs(5),
        transport,
    );

    h.fetcher.activate();
    sleep(Duration::from_millis(10)).await;
    assert_eq!(h.transport.calls(ALERTS_URL), 1);

    let cancelled =
        tokio::time::timeout(Duration::from_secs(1), h.fetcher.refresh(false)).await;
    assert!(cancelled.is_err());

    let snapshot = h.fetcher.snapshot();
    assert!(!snapshot.loading);
    assert_eq!(snapshot.phase, SourcePhase::Ready);
    assert!(!h.fetcher.state().in_flight);
    assert_eq!(ids(&snapshot.data.unwrap().records), vec!["a"]);

    sleep(Duration::from_secs(5)).await;
    assert_eq!(h.transport.calls(ALERTS_URL), 3);
    let snapshot = h.fetcher.snapshot();
    assert_eq!(snapshot.phase, SourcePhase::Ready);
    assert_eq!(ids(&snapshot.data.unwrap().records), vec!["fresh"]);
    h.fetcher.deactivate();
}

/// Test 14: Two plain records from a main-with-meta source are both kept
#[tokio::test(start_paused = true)]
async fn test_main_with_meta_two_records_are_not_lost() {
    let transport = ScriptedTransport::new();
    transport.respond(ALERTS_URL, json_body(json!([{"id": "a"}, {"id": "b"}])));
    let h = harness_with(
        SourceConfig::new("alerts", ALERTS_URL).with_shape(RecordShape::MainWithMeta),
        transport,
    );

    h.fetcher.activate();
    sleep(Duration::from_millis(10)).await;

    let data = h.fetcher.snapshot().data.unwrap();
    let mut kept = ids(&data.records);
    kept.sort();
    assert_eq!(kept, vec!["a", "b"]);
    assert!(data.meta.is_none());
    assert_eq!(h.sink.count(DiagnosticKind::UnexpectedShape), 1);
    h.fetcher.deactivate();
}
