/// Change-aware merge of polled collections
///
/// Records are held behind `Arc` so that an unchanged record keeps the same
/// allocation across polls (`Arc::ptr_eq`), letting consumers skip work for
/// anything that did not change.
use crate::diagnostics::{DiagnosticContext, DiagnosticKind};
use chrono::{DateTime, NaiveDateTime};
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

type KeyFn<T> = Arc<dyn Fn(&T) -> Option<String> + Send + Sync>;
type OrderFn<T> = Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// Identity key plus current value
#[derive(Debug)]
pub struct RecordEnvelope<T> {
    key: String,
    value: Arc<T>,
}

impl<T> Clone for RecordEnvelope<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            value: Arc::clone(&self.value),
        }
    }
}

impl<T> RecordEnvelope<T> {
    pub fn new(key: impl Into<String>, value: T) -> Self {
        Self {
            key: key.into(),
            value: Arc::new(value),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &Arc<T> {
        &self.value
    }

    /// True if both envelopes point at the same allocation
    pub fn same_ref(&self, other: &RecordEnvelope<T>) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }
}

/// Counts from one merge pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub added: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub discarded: usize,
}

impl MergeReport {
    /// Nothing was added, changed or removed
    pub fn is_noop(&self) -> bool {
        self.added == 0 && self.changed == 0 && self.removed == 0
    }
}

/// Working set for one source
pub struct ChangeAwareMerger<T> {
    label: String,
    key_fn: KeyFn<T>,
    order: Option<OrderFn<T>>,
    entries: Vec<RecordEnvelope<T>>,
    diagnostics: Option<DiagnosticContext>,
}

impl<T: PartialEq> ChangeAwareMerger<T> {
    pub fn new<F>(label: impl Into<String>, key_fn: F) -> Self
    where
        F: Fn(&T) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            key_fn: Arc::new(key_fn),
            order: None,
            entries: Vec::new(),
            diagnostics: None,
        }
    }

    /// Secondary ordering applied after each merge; ties fall back to key order
    pub fn with_ordering<F>(mut self, order: F) -> Self
    where
        F: Fn(&T, &T) -> Ordering + Send + Sync + 'static,
    {
        self.order = Some(Arc::new(order));
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: DiagnosticContext) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    pub fn records(&self) -> &[RecordEnvelope<T>] {
        &self.entries
    }

    pub fn values(&self) -> Vec<Arc<T>> {
        self.entries.iter().map(|e| Arc::clone(&e.value)).collect()
    }

    pub fn get(&self, key: &str) -> Option<&Arc<T>> {
        self.entries.iter().find(|e| e.key == key).map(|e| &e.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Merge a freshly decoded collection into the working set.
    ///
    /// The incoming collection is authoritative for presence: keys it does not
    /// contain are dropped. Records without an identity key, and repeats of a
    /// key already seen in this batch, are discarded.
    pub fn merge(&mut self, incoming: Vec<T>) -> MergeReport {
        let mut report = MergeReport::default();
        let mut next: Vec<RecordEnvelope<T>> = Vec::with_capacity(incoming.len());

        {
            let previous: HashMap<&str, &Arc<T>> = self
                .entries
                .iter()
                .map(|e| (e.key.as_str(), &e.value))
                .collect();
            let mut seen: HashSet<String> = HashSet::with_capacity(incoming.len());

            for (index, value) in incoming.into_iter().enumerate() {
                let Some(key) = (self.key_fn)(&value) else {
                    report.discarded += 1;
                    self.note(
                        DiagnosticKind::MalformedRecord,
                        format!("record at index {} has no identity key", index),
                    );
                    continue;
                };

                if !seen.insert(key.clone()) {
                    report.discarded += 1;
                    self.note(
                        DiagnosticKind::DuplicateKey,
                        format!("duplicate identity key '{}' at index {}", key, index),
                    );
                    continue;
                }

                let value = match previous.get(key.as_str()) {
                    Some(old) if ***old == value => {
                        report.unchanged += 1;
                        Arc::clone(*old)
                    }
                    Some(_) => {
                        report.changed += 1;
                        Arc::new(value)
                    }
                    None => {
                        report.added += 1;
                        Arc::new(value)
                    }
                };
                next.push(RecordEnvelope { key, value });
            }

            report.removed = previous.keys().filter(|k| !seen.contains(**k)).count();
        }

        if let Some(order) = &self.order {
            next.sort_by(|a, b| order(&a.value, &b.value).then_with(|| a.key.cmp(&b.key)));
        }

        self.entries = next;

        debug!(
            target: "merge",
            source = %self.label,
            added = report.added,
            changed = report.changed,
            unchanged = report.unchanged,
            removed = report.removed,
            discarded = report.discarded,
            "Merged collection"
        );

        report
    }

    fn note(&self, kind: DiagnosticKind, detail: String) {
        if let Some(diagnostics) = &self.diagnostics {
            diagnostics.report(&self.label, kind, None, detail);
        }
    }
}

/// Identity key extractor for JSON records: a string or integer field
pub fn field_key(field: &str) -> impl Fn(&Value) -> Option<String> + Send + Sync + 'static {
    let field = field.to_string();
    move |record: &Value| match record.get(&field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Most-recent-first ordering on a timestamp field. Missing or unparseable
/// timestamps sort last.
pub fn by_recency(field: &str) -> impl Fn(&Value, &Value) -> Ordering + Send + Sync + 'static {
    let field = field.to_string();
    move |a: &Value, b: &Value| {
        let ta = a.get(&field).and_then(timestamp_millis);
        let tb = b.get(&field).and_then(timestamp_millis);
        match (ta, tb) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }
}

/// Interpret a JSON value as epoch milliseconds.
///
/// Accepts RFC 3339 strings, `YYYY-MM-DD HH:MM:SS` strings (taken as UTC),
/// epoch seconds and epoch milliseconds.
pub fn timestamp_millis(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => {
            let raw = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            // Anything below 10^11 is taken as seconds
            if raw.unsigned_abs() < 100_000_000_000 {
                raw.checked_mul(1000)
            } else {
                Some(raw)
            }
        }
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.timestamp_millis());
            }
            NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|dt| dt.and_utc().timestamp_millis())
        }
        _ => None,
    }
}
