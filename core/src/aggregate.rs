/// Multi-source aggregation
///
/// Fans out to several sources at once, waits for every one of them to
/// settle, and folds the successful payloads into per-tenant counters.
/// One failing source never blanks the others.
use crate::decoder::{normalize_records, SafeResponseDecoder};
use crate::diagnostics::{DiagnosticContext, DiagnosticKind};
use crate::outcome::FetchOutcome;
use crate::source::SourceConfig;
use crate::transport::{HttpMethod, Transport};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Field names that may carry a tenant id, checked in order
pub const DEFAULT_TENANT_ALIASES: &[&str] = &["client_id", "clientId", "tenant_id", "tenantId"];

pub const MSG_ALL_SOURCES_FAILED: &str = "unable to load data from any source";

fn default_critical_values() -> Vec<String> {
    vec!["critical".to_string(), "disaster".to_string()]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub status: String,
}

impl Tenant {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: "active".to_string(),
        }
    }
}

/// Known tenants plus the field aliases used to find a record's tenant
#[derive(Debug, Clone)]
pub struct TenantRegistry {
    tenants: Vec<Tenant>,
    index: HashMap<String, usize>,
    aliases: Vec<String>,
}

impl TenantRegistry {
    /// Duplicate ids keep their first entry
    pub fn new(tenants: Vec<Tenant>) -> Self {
        let mut unique = Vec::with_capacity(tenants.len());
        let mut index = HashMap::with_capacity(tenants.len());
        for tenant in tenants {
            if index.contains_key(&tenant.id) {
                warn!(target: "aggregate", tenant = %tenant.id, "Duplicate tenant id ignored");
                continue;
            }
            index.insert(tenant.id.clone(), unique.len());
            unique.push(tenant);
        }
        Self {
            tenants: unique,
            index,
            aliases: DEFAULT_TENANT_ALIASES.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn with_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aliases = aliases.into_iter().map(Into::into).collect();
        self
    }

    pub fn tenants(&self) -> &[Tenant] {
        &self.tenants
    }

    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Tenant> {
        self.index.get(id).map(|&i| &self.tenants[i])
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Tenant id carried by a record under any configured alias
    pub fn tenant_id_of(&self, record: &Value) -> Option<String> {
        self.aliases
            .iter()
            .find_map(|alias| match record.get(alias.as_str())? {
                Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
    }
}

/// How a source's records bump tenant counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CounterRule {
    /// Every record counts
    Count { counter: String },
    /// Records whose `field` contains one of `values` (case-insensitive)
    Severity {
        field: String,
        counter: String,
        #[serde(default = "default_critical_values")]
        values: Vec<String>,
    },
    /// "success" in `field` bumps the success counter, otherwise "fail" or
    /// "error" bumps the failure counter (case-insensitive substrings)
    Status {
        field: String,
        success_counter: String,
        failure_counter: String,
    },
}

impl CounterRule {
    pub fn count(counter: impl Into<String>) -> Self {
        CounterRule::Count {
            counter: counter.into(),
        }
    }

    pub fn severity(field: impl Into<String>, counter: impl Into<String>) -> Self {
        CounterRule::Severity {
            field: field.into(),
            counter: counter.into(),
            values: default_critical_values(),
        }
    }

    pub fn status(
        field: impl Into<String>,
        success_counter: impl Into<String>,
        failure_counter: impl Into<String>,
    ) -> Self {
        CounterRule::Status {
            field: field.into(),
            success_counter: success_counter.into(),
            failure_counter: failure_counter.into(),
        }
    }

    pub fn counters(&self) -> Vec<&str> {
        match self {
            CounterRule::Count { counter } | CounterRule::Severity { counter, .. } => {
                vec![counter.as_str()]
            }
            CounterRule::Status {
                success_counter,
                failure_counter,
                ..
            } => vec![success_counter.as_str(), failure_counter.as_str()],
        }
    }

    fn apply(&self, record: &Value, counters: &mut BTreeMap<String, u64>) {
        let target = match self {
            CounterRule::Count { counter } => Some(counter),
            CounterRule::Severity {
                field,
                counter,
                values,
            } => text_field(record, field).and_then(|text| {
                values
                    .iter()
                    .any(|v| text.contains(&v.to_lowercase()))
                    .then_some(counter)
            }),
            CounterRule::Status {
                field,
                success_counter,
                failure_counter,
            } => text_field(record, field).and_then(|text| {
                if text.contains("success") {
                    Some(success_counter)
                } else if text.contains("fail") || text.contains("error") {
                    Some(failure_counter)
                } else {
                    None
                }
            }),
        };
        if let Some(counter) = target {
            *counters.entry(counter.clone()).or_insert(0) += 1;
        }
    }
}

/// Lowercased string form of a scalar field
fn text_field(record: &Value, field: &str) -> Option<String> {
    match record.get(field)? {
        Value::String(s) => Some(s.to_lowercase()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// One source taking part in aggregation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceQuery {
    #[serde(flatten)]
    pub source: SourceConfig,
    #[serde(default)]
    pub rules: Vec<CounterRule>,
}

impl SourceQuery {
    pub fn new(source: SourceConfig, rules: Vec<CounterRule>) -> Self {
        Self { source, rules }
    }
}

/// Counters for one tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregateRow {
    pub tenant_id: String,
    pub name: String,
    pub status: String,
    pub counters: BTreeMap<String, u64>,
}

impl AggregateRow {
    fn zeroed(tenant: &Tenant, counter_names: &BTreeSet<String>) -> Self {
        Self {
            tenant_id: tenant.id.clone(),
            name: tenant.name.clone(),
            status: tenant.status.clone(),
            counters: counter_names.iter().map(|c| (c.clone(), 0)).collect(),
        }
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }
}

/// Result of one aggregation cycle
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregateReport {
    pub cycle: u64,
    pub rows: Vec<AggregateRow>,
    pub summary: BTreeMap<String, u64>,
    /// Normalized records of each successful source, for per-tab views
    pub collections: BTreeMap<String, Vec<Value>>,
    pub failed_sources: Vec<String>,
    pub unmatched_records: usize,
    /// Set only when every source failed
    pub error: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl AggregateReport {
    fn zeroed(registry: &TenantRegistry, counter_names: &BTreeSet<String>) -> Self {
        let rows: Vec<AggregateRow> = registry
            .tenants()
            .iter()
            .map(|t| AggregateRow::zeroed(t, counter_names))
            .collect();
        Self {
            summary: summarize(&rows, counter_names),
            rows,
            ..Self::default()
        }
    }

    pub fn row(&self, tenant_id: &str) -> Option<&AggregateRow> {
        self.rows.iter().find(|r| r.tenant_id == tenant_id)
    }

    pub fn total(&self, counter: &str) -> u64 {
        self.summary.get(counter).copied().unwrap_or(0)
    }
}

/// Column sums over all rows
fn summarize(rows: &[AggregateRow], counter_names: &BTreeSet<String>) -> BTreeMap<String, u64> {
    let mut summary: BTreeMap<String, u64> = counter_names.iter().map(|c| (c.clone(), 0)).collect();
    for row in rows {
        for (name, value) in &row.counters {
            *summary.entry(name.clone()).or_insert(0) += value;
        }
    }
    summary
}

#[derive(Debug, Clone)]
pub enum AggregateOutcome {
    Completed(AggregateReport),
    /// A newer cycle started before this one settled
    Superseded,
}

impl AggregateOutcome {
    pub fn report(&self) -> Option<&AggregateReport> {
        match self {
            AggregateOutcome::Completed(report) => Some(report),
            AggregateOutcome::Superseded => None,
        }
    }
}

/// Outcomes of a tenant-scoped multi-endpoint fetch
#[derive(Debug, Clone)]
pub struct TenantBundle {
    pub tenant_id: String,
    pub outcomes: BTreeMap<String, FetchOutcome<Value>>,
}

impl TenantBundle {
    pub fn data(&self, endpoint: &str) -> Option<&Value> {
        self.outcomes.get(endpoint).and_then(|o| o.data())
    }

    /// User message when no endpoint succeeded
    pub fn error(&self) -> Option<&str> {
        if self.outcomes.values().any(|o| o.is_success()) {
            return None;
        }
        self.outcomes.values().find_map(|o| o.user_message())
    }
}

pub struct MultiSourceAggregator {
    transport: Arc<dyn Transport>,
    decoder: SafeResponseDecoder,
    cycle: AtomicU64,
    last: Mutex<Option<AggregateReport>>,
}

impl MultiSourceAggregator {
    pub fn new(transport: Arc<dyn Transport>, diagnostics: DiagnosticContext) -> Self {
        Self {
            transport,
            decoder: SafeResponseDecoder::new(diagnostics),
            cycle: AtomicU64::new(0),
            last: Mutex::new(None),
        }
    }

    fn diagnostics(&self) -> &DiagnosticContext {
        self.decoder.diagnostics()
    }

    fn lock_last(&self) -> MutexGuard<'_, Option<AggregateReport>> {
        self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Most recent completed report
    pub fn last_report(&self) -> Option<AggregateReport> {
        self.lock_last().clone()
    }

    /// Invalidate any cycle still waiting on its sources
    pub fn cancel_pending(&self) {
        self.cycle.fetch_add(1, Ordering::SeqCst);
    }

    async fn fetch(&self, source: &SourceConfig) -> FetchOutcome<Value> {
        let started = Instant::now();
        let outcome = match self.transport.execute(&source.request()).await {
            Ok(raw) => self.decoder.decode(raw, &source.url),
            Err(e) => self.decoder.transport_failure(&e, &source.url),
        };
        self.diagnostics()
            .metrics()
            .record_fetch(&source.name, started.elapsed(), outcome.is_success());
        outcome
    }

    /// Run one aggregation cycle over `sources`.
    ///
    /// Rows are rebuilt from zero every cycle. If every source fails the
    /// previous rows are kept and `error` is set; partial failure sets no
    /// error and only lists the failed sources.
    pub async fn aggregate(
        &self,
        sources: &[SourceQuery],
        registry: &TenantRegistry,
    ) -> AggregateOutcome {
        let cycle = self.cycle.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(target: "aggregate", cycle, sources = sources.len(), "Aggregation cycle started");

        let outcomes = join_all(sources.iter().map(|q| self.fetch(&q.source))).await;

        let mut last = self.lock_last();
        if self.cycle.load(Ordering::SeqCst) != cycle {
            debug!(target: "aggregate", cycle, "Aggregation cycle superseded");
            return AggregateOutcome::Superseded;
        }

        let counter_names: BTreeSet<String> = sources
            .iter()
            .flat_map(|q| q.rules.iter().flat_map(|r| r.counters()))
            .map(str::to_string)
            .collect();

        let mut rows: Vec<AggregateRow> = registry
            .tenants()
            .iter()
            .map(|t| AggregateRow::zeroed(t, &counter_names))
            .collect();
        let mut collections = BTreeMap::new();
        let mut failed_sources = Vec::new();
        let mut unmatched_records = 0;

        for (query, outcome) in sources.iter().zip(outcomes) {
            let name = &query.source.name;
            let data = match outcome.into_result() {
                Ok(data) => data,
                Err(failure) => {
                    warn!(
                        target: "aggregate",
                        source = %name,
                        status = failure.status_code,
                        error = %failure.user_message,
                        "Source failed; its counters stay at zero this cycle"
                    );
                    failed_sources.push(name.clone());
                    continue;
                }
            };

            let mut normalized = normalize_records(data, query.source.shape);
            if normalized.reclaim_meta(|meta| registry.tenant_id_of(meta).is_some()) {
                self.diagnostics().report(
                    name,
                    DiagnosticKind::UnexpectedShape,
                    None,
                    "[main, meta] pair carried a tenant record as meta; read as a list".to_string(),
                );
            }
            if normalized.unexpected {
                self.diagnostics().report(
                    name,
                    DiagnosticKind::UnexpectedShape,
                    None,
                    format!("payload for shape {:?} carried no records", query.source.shape),
                );
            }
            let mut unknown: BTreeSet<String> = BTreeSet::new();
            let mut missing = 0usize;
            let mut skipped = 0usize;

            for record in &normalized.records {
                let Some(tenant_id) = registry.tenant_id_of(record) else {
                    missing += 1;
                    skipped += 1;
                    continue;
                };
                match registry.position(&tenant_id) {
                    Some(i) => {
                        for rule in &query.rules {
                            rule.apply(record, &mut rows[i].counters);
                        }
                    }
                    None => {
                        skipped += 1;
                        unknown.insert(tenant_id);
                    }
                }
            }

            if skipped > 0 {
                unmatched_records += skipped;
                self.diagnostics().report(
                    name,
                    DiagnosticKind::UnmatchedTenant,
                    None,
                    format!(
                        "{} record(s) skipped: {} without a tenant field {:?}, unknown tenants {:?}",
                        skipped,
                        missing,
                        registry.aliases(),
                        unknown
                    ),
                );
            }

            collections.insert(name.clone(), normalized.records);
        }

        if !sources.is_empty() && failed_sources.len() == sources.len() {
            let mut report = last
                .clone()
                .unwrap_or_else(|| AggregateReport::zeroed(registry, &counter_names));
            report.cycle = cycle;
            report.failed_sources = failed_sources;
            report.error = Some(MSG_ALL_SOURCES_FAILED.to_string());
            warn!(target: "aggregate", cycle, "All sources failed; keeping previous rows");
            *last = Some(report.clone());
            return AggregateOutcome::Completed(report);
        }

        let report = AggregateReport {
            cycle,
            summary: summarize(&rows, &counter_names),
            rows,
            collections,
            failed_sources,
            unmatched_records,
            error: None,
            last_updated: Some(Utc::now()),
        };
        debug!(
            target: "aggregate",
            cycle,
            tenants = report.rows.len(),
            failed = report.failed_sources.len(),
            "Aggregation cycle completed"
        );
        *last = Some(report.clone());
        AggregateOutcome::Completed(report)
    }

    /// Fetch several endpoints for one tenant at once. Each endpoint is sent
    /// as a POST whose payload carries `tenant_id`; endpoints settle
    /// independently.
    pub async fn fetch_tenant_bundle(
        &self,
        tenant_id: &str,
        endpoints: &[SourceConfig],
    ) -> TenantBundle {
        let scoped: Vec<SourceConfig> = endpoints
            .iter()
            .map(|endpoint| {
                let mut source = endpoint.clone();
                let mut payload = match source.payload.take() {
                    Some(Value::Object(map)) => map,
                    _ => Map::new(),
                };
                payload.insert("tenant_id".to_string(), Value::String(tenant_id.to_string()));
                source.method = HttpMethod::Post;
                source.payload = Some(Value::Object(payload));
                source
            })
            .collect();

        let outcomes = join_all(scoped.iter().map(|s| self.fetch(s))).await;

        TenantBundle {
            tenant_id: tenant_id.to_string(),
            outcomes: scoped
                .iter()
                .map(|s| s.name.clone())
                .zip(outcomes)
                .collect(),
        }
    }

    /// Run `aggregate` on a fixed interval until the handle is stopped
    pub fn spawn_periodic(
        self: &Arc<Self>,
        sources: Vec<SourceQuery>,
        registry: Arc<TenantRegistry>,
        interval: Duration,
    ) -> AggregatorHandle {
        let (tx, rx) = watch::channel(None);
        let aggregator = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let AggregateOutcome::Completed(report) =
                    aggregator.aggregate(&sources, &registry).await
                {
                    tx.send_replace(Some(report));
                }
            }
        });
        info!(
            target: "aggregate",
            interval_secs = interval.as_secs(),
            "Periodic aggregation started"
        );
        AggregatorHandle {
            aggregator: Arc::clone(self),
            task,
            reports: rx,
        }
    }
}

/// Running periodic aggregation. Dropping the handle stops it.
pub struct AggregatorHandle {
    aggregator: Arc<MultiSourceAggregator>,
    task: JoinHandle<()>,
    reports: watch::Receiver<Option<AggregateReport>>,
}

impl AggregatorHandle {
    pub fn subscribe(&self) -> watch::Receiver<Option<AggregateReport>> {
        self.reports.clone()
    }

    pub fn latest(&self) -> Option<AggregateReport> {
        self.reports.borrow().clone()
    }

    pub fn stop(&self) {
        self.aggregator.cancel_pending();
        self.task.abort();
    }
}

impl Drop for AggregatorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
