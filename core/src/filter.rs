// Per-tab record filters
//
// A tab owns its filter and its pagination engine. Changing the filter sends
// the tab back to page 1; refreshing the records only lets the engine clamp.

use crate::pagination::FilterPaginationEngine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Search text and status predicate for one tab
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFilter {
    /// Case-insensitive substring matched against `search_fields`
    #[serde(default)]
    pub search: Option<String>,
    /// Case-insensitive substring matched against `status_field`
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub search_fields: Vec<String>,
    #[serde(default = "default_status_field")]
    pub status_field: String,
}

fn default_status_field() -> String {
    "status".to_string()
}

impl RecordFilter {
    pub fn new<I, S>(search_fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            search: None,
            status: None,
            search_fields: search_fields.into_iter().map(Into::into).collect(),
            status_field: default_status_field(),
        }
    }

    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        blank(&self.search) && blank(&self.status)
    }

    pub fn matches(&self, record: &Value) -> bool {
        if let Some(status) = non_blank(&self.status) {
            let matched = field_text(record, &self.status_field)
                .map(|s| s.contains(&status))
                .unwrap_or(false);
            if !matched {
                return false;
            }
        }

        if let Some(search) = non_blank(&self.search) {
            return self
                .search_fields
                .iter()
                .filter_map(|f| field_text(record, f))
                .any(|text| text.contains(&search));
        }

        true
    }

    pub fn apply(&self, records: &[Arc<Value>]) -> Vec<Arc<Value>> {
        records
            .iter()
            .filter(|r| self.matches(r))
            .cloned()
            .collect()
    }
}

fn blank(value: &Option<String>) -> bool {
    non_blank(value).is_none()
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_lowercase)
}

fn field_text(record: &Value, field: &str) -> Option<String> {
    match record.get(field)? {
        Value::String(s) => Some(s.to_lowercase()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// One tab of a multi-collection view
#[derive(Debug, Clone)]
pub struct TabView {
    name: String,
    filter: RecordFilter,
    source: Vec<Arc<Value>>,
    engine: FilterPaginationEngine<Arc<Value>>,
}

impl TabView {
    pub fn new(name: impl Into<String>, filter: RecordFilter, page_size: usize) -> Self {
        Self {
            name: name.into(),
            filter,
            source: Vec::new(),
            engine: FilterPaginationEngine::new(page_size),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn filter(&self) -> &RecordFilter {
        &self.filter
    }

    /// New records from a poll. The current page is kept unless it vanished.
    pub fn set_records(&mut self, records: Vec<Arc<Value>>) {
        self.source = records;
        self.engine.set_items(self.filter.apply(&self.source));
    }

    /// Replace the filter and go back to the first page
    pub fn set_filter(&mut self, filter: RecordFilter) {
        self.filter = filter;
        self.engine.reset();
        self.engine.set_items(self.filter.apply(&self.source));
    }

    pub fn set_search(&mut self, search: Option<String>) {
        let mut filter = self.filter.clone();
        filter.search = search;
        self.set_filter(filter);
    }

    pub fn set_status(&mut self, status: Option<String>) {
        let mut filter = self.filter.clone();
        filter.status = status;
        self.set_filter(filter);
    }

    pub fn pagination(&self) -> &FilterPaginationEngine<Arc<Value>> {
        &self.engine
    }

    pub fn pagination_mut(&mut self) -> &mut FilterPaginationEngine<Arc<Value>> {
        &mut self.engine
    }

    pub fn page(&self) -> &[Arc<Value>] {
        self.engine.paginated_items()
    }

    pub fn total_unfiltered(&self) -> usize {
        self.source.len()
    }
}
