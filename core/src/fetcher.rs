/// Polling fetcher
///
/// Owns the fetch lifecycle of one source: an immediate load on activation,
/// silent periodic refreshes, manual refreshes and connectivity tracking.
///
/// Every fetch captures the generation counter when it starts and applies its
/// result only if the counter is unchanged when it completes. A manual
/// refresh or a deactivation bumps the counter, so older in-flight fetches
/// are discarded on arrival.
use crate::decoder::{normalize_records, RecordShape, SafeResponseDecoder};
use crate::diagnostics::{DiagnosticContext, DiagnosticKind};
use crate::merge::{by_recency, field_key, ChangeAwareMerger, MergeReport};
use crate::source::{SourceConfig, SourcePhase, SourceSnapshot, SourceState};
use crate::transport::Transport;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Folds decoded payloads into the value a view consumes
pub trait Reconciler: Send + 'static {
    type Output: Clone + Send + Sync + 'static;

    /// Called with the decoded data of every successful fetch. `Value::Null`
    /// means the source answered with an empty body.
    fn reconcile(&mut self, data: Value) -> Self::Output;
}

/// Merged record collection published by `RecordReconciler`
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecordSet {
    pub records: Vec<Arc<Value>>,
    pub meta: Option<Value>,
    pub report: MergeReport,
}

/// Reconciler for sources returning JSON record lists
pub struct RecordReconciler {
    label: String,
    identity_field: String,
    shape: RecordShape,
    merger: ChangeAwareMerger<Value>,
    diagnostics: DiagnosticContext,
}

impl RecordReconciler {
    pub fn new(source: &SourceConfig, identity_field: &str, diagnostics: DiagnosticContext) -> Self {
        let merger = ChangeAwareMerger::new(source.name.clone(), field_key(identity_field))
            .with_diagnostics(diagnostics.clone());
        Self {
            label: source.name.clone(),
            identity_field: identity_field.to_string(),
            shape: source.shape,
            merger,
            diagnostics,
        }
    }

    /// Order records most-recent-first on `field`
    pub fn with_recency(mut self, field: &str) -> Self {
        self.merger = self.merger.with_ordering(by_recency(field));
        self
    }
}

impl Reconciler for RecordReconciler {
    type Output = RecordSet;

    fn reconcile(&mut self, data: Value) -> RecordSet {
        let mut normalized = normalize_records(data, self.shape);
        let field = self.identity_field.as_str();
        if normalized.reclaim_meta(|meta| meta.get(field).is_some_and(|v| !v.is_null())) {
            self.diagnostics.report(
                &self.label,
                DiagnosticKind::UnexpectedShape,
                None,
                format!("meta of [main, meta] pair has `{}`; read as a list of records", field),
            );
        }
        if normalized.unexpected {
            self.diagnostics.report(
                &self.label,
                DiagnosticKind::UnexpectedShape,
                None,
                format!("payload for shape {:?} carried no records", self.shape),
            );
        }
        let report = self.merger.merge(normalized.records);
        RecordSet {
            records: self.merger.values(),
            meta: normalized.meta,
            report,
        }
    }
}

/// Result of one refresh call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// New data was reconciled and published
    Applied,
    /// The fetch failed; carries the user-facing message
    Failed(String),
    /// Not started: inactive, or a silent tick while another fetch is in flight
    Skipped,
    /// Completed after a newer fetch or a deactivation; result dropped
    Superseded,
}

struct FetcherState<R: Reconciler> {
    active: bool,
    generation: u64,
    phase: SourcePhase,
    loading: bool,
    source: SourceState,
    reconciler: R,
    data: Option<R::Output>,
}

struct FetcherInner<R: Reconciler> {
    source: SourceConfig,
    transport: Arc<dyn Transport>,
    decoder: SafeResponseDecoder,
    state: Mutex<FetcherState<R>>,
    snapshot_tx: watch::Sender<SourceSnapshot<R::Output>>,
}

impl<R: Reconciler> FetcherInner<R> {
    fn lock(&self) -> MutexGuard<'_, FetcherState<R>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, st: &FetcherState<R>) {
        self.snapshot_tx.send_replace(SourceSnapshot {
            data: st.data.clone(),
            loading: st.loading,
            phase: st.phase,
            error: st.source.last_error.clone(),
            connected: st.source.connected,
            last_updated: st.source.last_updated,
        });
    }

    async fn refresh(&self, silent: bool) -> RefreshOutcome {
        let name = self.source.name.as_str();

        let generation = {
            let mut st = self.lock();
            if !st.active {
                return RefreshOutcome::Skipped;
            }
            if silent && st.source.in_flight {
                debug!(target: "fetcher", source = %name, "Fetch in flight; skipping tick");
                return RefreshOutcome::Skipped;
            }
            st.generation += 1;
            st.source.in_flight = true;
            if silent {
                st.phase = SourcePhase::SilentRefreshing;
            } else {
                st.phase = SourcePhase::Loading;
                st.loading = true;
                self.publish(&st);
            }
            st.generation
        };

        let mut guard = InFlightGuard {
            inner: self,
            generation,
            armed: true,
        };
        let started = Instant::now();
        let outcome = match self.transport.execute(&self.source.request()).await {
            Ok(raw) => self.decoder.decode(raw, &self.source.url),
            Err(e) => self.decoder.transport_failure(&e, &self.source.url),
        };
        guard.armed = false;
        let elapsed = started.elapsed();
        let metrics = self.decoder.diagnostics().metrics();

        let mut st = self.lock();
        if !st.active || st.generation != generation {
            metrics.record_discarded(name);
            debug!(
                target: "fetcher",
                source = %name,
                generation,
                current = st.generation,
                "Discarding stale fetch result"
            );
            return RefreshOutcome::Superseded;
        }

        metrics.record_fetch(name, elapsed, outcome.is_success());
        st.source.in_flight = false;
        st.loading = false;

        match outcome.into_result() {
            Ok(data) => {
                let output = st.reconciler.reconcile(data);
                st.data = Some(output);
                st.source.connected = true;
                st.source.last_error = None;
                st.source.last_updated = Some(Utc::now());
                st.phase = SourcePhase::Ready;
                self.publish(&st);
                debug!(
                    target: "fetcher",
                    source = %name,
                    silent,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Refresh applied"
                );
                RefreshOutcome::Applied
            }
            Err(failure) => {
                // Previously published data stays in place
                st.source.connected = false;
                st.source.last_error = Some(failure.user_message.clone());
                st.phase = SourcePhase::Errored;
                self.publish(&st);
                warn!(
                    target: "fetcher",
                    source = %name,
                    silent,
                    status = failure.status_code,
                    error = %failure.user_message,
                    "Refresh failed"
                );
                RefreshOutcome::Failed(failure.user_message)
            }
        }
    }
}

/// Clears the in-flight flags when a refresh future is dropped mid-fetch,
/// unless a newer fetch or a deactivation already took over.
struct InFlightGuard<'a, R: Reconciler> {
    inner: &'a FetcherInner<R>,
    generation: u64,
    armed: bool,
}

impl<R: Reconciler> Drop for InFlightGuard<'_, R> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut st = self.inner.lock();
        if st.generation != self.generation {
            return;
        }
        st.source.in_flight = false;
        st.loading = false;
        st.phase = if st.source.last_error.is_some() {
            SourcePhase::Errored
        } else if st.data.is_some() {
            SourcePhase::Ready
        } else {
            SourcePhase::Idle
        };
        self.inner.publish(&st);
        debug!(
            target: "fetcher",
            source = %self.inner.source.name,
            generation = self.generation,
            "Refresh cancelled before completion"
        );
    }
}

/// Polling lifecycle for a single source
pub struct PollingFetcher<R: Reconciler> {
    inner: Arc<FetcherInner<R>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl<R: Reconciler> PollingFetcher<R> {
    pub fn new(
        source: SourceConfig,
        transport: Arc<dyn Transport>,
        reconciler: R,
        diagnostics: DiagnosticContext,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(SourceSnapshot::default());
        let state = FetcherState {
            active: false,
            generation: 0,
            phase: SourcePhase::Idle,
            loading: false,
            source: SourceState::default(),
            reconciler,
            data: None,
        };
        Self {
            inner: Arc::new(FetcherInner {
                source,
                transport,
                decoder: SafeResponseDecoder::new(diagnostics),
                state: Mutex::new(state),
                snapshot_tx,
            }),
            timer: Mutex::new(None),
        }
    }

    pub fn source(&self) -> &SourceConfig {
        &self.inner.source
    }

    /// Start polling: one immediate load, then a silent refresh every interval.
    /// Returns false if already active. Must be called within a tokio runtime.
    pub fn activate(&self) -> bool {
        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        {
            let mut st = self.inner.lock();
            if st.active {
                return false;
            }
            st.active = true;
        }

        let inner = Arc::clone(&self.inner);
        let period = self.inner.source.interval();
        let handle = tokio::spawn(async move {
            inner.refresh(false).await;
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                inner.refresh(true).await;
            }
        });
        if let Some(previous) = timer.replace(handle) {
            previous.abort();
        }

        info!(
            target: "fetcher",
            source = %self.inner.source.name,
            interval_secs = period.as_secs(),
            "Polling activated"
        );
        true
    }

    /// Stop polling. No state changes once this returns; any fetch still in
    /// flight is discarded when it completes.
    pub fn deactivate(&self) {
        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        let was_active = {
            let mut st = self.inner.lock();
            let was_active = st.active;
            st.active = false;
            st.generation += 1;
            st.source.in_flight = false;
            st.loading = false;
            if was_active {
                st.phase = SourcePhase::Idle;
                self.inner.publish(&st);
            }
            was_active
        };
        if let Some(handle) = timer.take() {
            handle.abort();
        }
        if was_active {
            info!(target: "fetcher", source = %self.inner.source.name, "Polling deactivated");
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().active
    }

    /// Fetch now. A manual refresh (`silent == false`) shows loading and
    /// supersedes whatever is in flight; a silent one is skipped if a fetch is
    /// already running.
    pub async fn refresh(&self, silent: bool) -> RefreshOutcome {
        self.inner.refresh(silent).await
    }

    pub fn snapshot(&self) -> SourceSnapshot<R::Output> {
        self.inner.snapshot_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SourceSnapshot<R::Output>> {
        self.inner.snapshot_tx.subscribe()
    }

    pub fn state(&self) -> SourceState {
        self.inner.lock().source.clone()
    }

    pub fn phase(&self) -> SourcePhase {
        self.inner.lock().phase
    }
}

impl<R: Reconciler> Drop for PollingFetcher<R> {
    fn drop(&mut self) {
        self.deactivate();
    }
}
