mod config;
use config::DashboardFeedConfig;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use vigil_core::telemetry::init_tracing;
use vigil_core::{
    DiagnosticContext, HttpTransport, MultiSourceAggregator, PollingFetcher, RecordFilter,
    RecordReconciler, TabView, Transport,
};

const LOG_FILTER: &str = "info,vigil_core=info,dashboard_feed=info";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logging / tracing
    init_tracing(LOG_FILTER);

    info!(
        target: "dashboard_feed",
        "Starting dashboard feed: webhooks → fetchers → tenant aggregate"
    );

    // Load configuration (defaults + env + optional TOML overlay)
    let cfg = DashboardFeedConfig::load();
    if cfg.sources.is_empty() {
        warn!(target: "dashboard_feed", "No sources configured; nothing to poll");
        return Ok(());
    }

    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::with_timeout(cfg.request_timeout())?);
    let diagnostics = DiagnosticContext::tracing(cfg.session.clone());

    // 1) One polling fetcher per source, each feeding a paginated tab
    let mut fetchers = Vec::with_capacity(cfg.sources.len());
    let mut watchers = Vec::with_capacity(cfg.sources.len());
    for source in &cfg.sources {
        let config = source.query.source.clone();
        let mut reconciler = RecordReconciler::new(&config, &source.identity_field, diagnostics.clone());
        if let Some(field) = &source.recency_field {
            reconciler = reconciler.with_recency(field);
        }

        let fetcher = PollingFetcher::new(
            config.clone(),
            Arc::clone(&transport),
            reconciler,
            diagnostics.clone(),
        );
        let mut rx = fetcher.subscribe();
        let mut tab = TabView::new(
            config.name.clone(),
            RecordFilter::new(source.search_fields.clone()),
            cfg.page_size,
        );

        watchers.push(tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let snapshot = rx.borrow_and_update().clone();
                if let Some(set) = &snapshot.data {
                    tab.set_records(set.records.clone());
                }
                info!(
                    target: "dashboard_feed",
                    source = %tab.name(),
                    phase = ?snapshot.phase,
                    loading = snapshot.loading,
                    connected = snapshot.connected,
                    records = tab.total_unfiltered(),
                    page = tab.pagination().current_page(),
                    pages = tab.pagination().total_pages(),
                    error = ?snapshot.error,
                    "Source updated"
                );
            }
        }));

        fetcher.activate();
        fetchers.push(fetcher);
    }

    // 2) Tenant aggregate over every source with counter rules
    let aggregate_sources = cfg.aggregate_sources();
    let aggregation = if cfg.tenants.is_empty() || aggregate_sources.is_empty() {
        info!(target: "dashboard_feed", "No tenants or counter rules configured; aggregation disabled");
        None
    } else {
        let aggregator = Arc::new(MultiSourceAggregator::new(
            Arc::clone(&transport),
            diagnostics.clone(),
        ));
        let handle = aggregator.spawn_periodic(
            aggregate_sources,
            Arc::new(cfg.registry()),
            cfg.poll_interval(),
        );
        let mut reports = handle.subscribe();
        let summary_task = tokio::spawn(async move {
            while reports.changed().await.is_ok() {
                let Some(report) = reports.borrow_and_update().clone() else {
                    continue;
                };
                if let Some(message) = &report.error {
                    warn!(target: "dashboard_feed", cycle = report.cycle, error = %message, "Aggregate unavailable");
                }
                info!(
                    target: "dashboard_feed",
                    cycle = report.cycle,
                    tenants = report.rows.len(),
                    failed = ?report.failed_sources,
                    unmatched = report.unmatched_records,
                    summary = ?report.summary,
                    "Aggregate updated"
                );
            }
        });
        Some((handle, summary_task))
    };

    // Ctrl+C handler to shutdown gracefully
    if let Err(e) = signal::ctrl_c().await {
        error!(target: "dashboard_feed", error = %e, "Failed to listen for Ctrl+C");
    }
    info!(target: "dashboard_feed", "Shutting down...");

    for fetcher in &fetchers {
        fetcher.deactivate();
    }
    if let Some((handle, summary_task)) = aggregation {
        handle.stop();
        summary_task.abort();
    }
    for watcher in watchers {
        watcher.abort();
    }

    diagnostics.metrics().log_summary();
    diagnostics.teardown();
    Ok(())
}
