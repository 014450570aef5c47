// Diagnostic sink and the context that carries it
//
// Debug detail from fetch failures, malformed records and schema drift is
// routed here and nowhere else. The context is constructed explicitly and
// handed to every component that needs it.

use crate::outcome::FetchErrorKind;
use crate::telemetry::FetchMetrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    Fetch(FetchErrorKind),
    BodyReadFailed,
    MalformedRecord,
    DuplicateKey,
    UnmatchedTenant,
    UnexpectedShape,
}

/// One diagnostic entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticNote {
    pub session: String,
    pub source: String,
    pub kind: DiagnosticKind,
    pub status: Option<u16>,
    pub detail: String,
    pub at: DateTime<Utc>,
}

pub trait DiagnosticSink: Send + Sync {
    fn record(&self, note: &DiagnosticNote);
}

/// Emits notes as structured `warn` events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn record(&self, note: &DiagnosticNote) {
        warn!(
            target: "diagnostics",
            session = %note.session,
            source = %note.source,
            kind = ?note.kind,
            status = ?note.status,
            detail = %note.detail,
            "Diagnostic"
        );
    }
}

/// Keeps notes in memory; used by tests and by hosts that surface a debug panel
#[derive(Debug, Default)]
pub struct MemorySink {
    notes: Mutex<Vec<DiagnosticNote>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notes(&self) -> Vec<DiagnosticNote> {
        self.notes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.notes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|n| n.kind == kind)
            .count()
    }

    pub fn clear(&self) {
        self.notes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl DiagnosticSink for MemorySink {
    fn record(&self, note: &DiagnosticNote) {
        self.notes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(note.clone());
    }
}

/// Session-scoped diagnostics context.
///
/// Cloning shares the sink, the metrics and the lifecycle flag. After
/// `teardown` every report is dropped.
#[derive(Clone)]
pub struct DiagnosticContext {
    session: Arc<str>,
    sink: Arc<dyn DiagnosticSink>,
    metrics: FetchMetrics,
    active: Arc<AtomicBool>,
}

impl DiagnosticContext {
    pub fn new(session: impl Into<String>, sink: Arc<dyn DiagnosticSink>) -> Self {
        let session: String = session.into();
        info!(target: "diagnostics", session = %session, "Diagnostic context initialized");
        Self {
            session: Arc::from(session),
            sink,
            metrics: FetchMetrics::new(),
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Context backed by the tracing sink
    pub fn tracing(session: impl Into<String>) -> Self {
        Self::new(session, Arc::new(TracingSink))
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn metrics(&self) -> &FetchMetrics {
        &self.metrics
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn report(
        &self,
        source: &str,
        kind: DiagnosticKind,
        status: Option<u16>,
        detail: impl Into<String>,
    ) {
        if !self.is_active() {
            return;
        }
        let note = DiagnosticNote {
            session: self.session.to_string(),
            source: source.to_string(),
            kind,
            status,
            detail: detail.into(),
            at: Utc::now(),
        };
        self.sink.record(&note);
    }

    /// End the session. Later reports are discarded.
    pub fn teardown(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            info!(target: "diagnostics", session = %self.session, "Diagnostic context torn down");
        }
    }
}

impl std::fmt::Debug for DiagnosticContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosticContext")
            .field("session", &self.session)
            .field("active", &self.is_active())
            .finish()
    }
}
