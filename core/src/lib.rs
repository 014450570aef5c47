// Vigil Core Library
// Polling reconciliation core for monitoring dashboards

pub mod aggregate;
pub mod decoder;
pub mod diagnostics;
pub mod fetcher;
pub mod filter;
pub mod merge;
pub mod outcome;
pub mod pagination;
pub mod source;
pub mod telemetry;
pub mod transport;

// Export core types
pub use aggregate::{
    AggregateOutcome, AggregateReport, AggregateRow, AggregatorHandle, CounterRule,
    MultiSourceAggregator, SourceQuery, Tenant, TenantBundle, TenantRegistry,
};
pub use decoder::{normalize_records, BodyRead, RawResponse, RecordShape, SafeResponseDecoder};
pub use diagnostics::{DiagnosticContext, DiagnosticKind, DiagnosticNote, DiagnosticSink};
pub use fetcher::{PollingFetcher, Reconciler, RecordReconciler, RecordSet, RefreshOutcome};
pub use filter::{RecordFilter, TabView};
pub use merge::{ChangeAwareMerger, MergeReport, RecordEnvelope};
pub use outcome::{FetchErrorKind, FetchFailure, FetchOutcome};
pub use pagination::{FilterPaginationEngine, PageWindow};
pub use source::{SourceConfig, SourcePhase, SourceSnapshot, SourceState};
pub use telemetry::FetchMetrics;
pub use transport::{HttpMethod, HttpTransport, SourceRequest, Transport, TransportError};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VigilError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid source '{name}': {reason}")]
    InvalidSource { name: String, reason: String },

    #[error("HTTP client error: {0}")]
    HttpClientError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}
pub type Result<T> = std::result::Result<T, VigilError>;
