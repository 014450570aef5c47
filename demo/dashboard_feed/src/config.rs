use std::fs;
use std::path::Path;
use std::time::Duration;

use serde_json::Value;
use vigil_core::aggregate::DEFAULT_TENANT_ALIASES;
use vigil_core::pagination::DEFAULT_PAGE_SIZE;
use vigil_core::source::{DEFAULT_INTERVAL_SECS, MAX_INTERVAL_SECS, MIN_INTERVAL_SECS};
use vigil_core::transport::DEFAULT_REQUEST_TIMEOUT;
use vigil_core::{
    CounterRule, HttpMethod, RecordShape, SourceConfig, SourceQuery, Tenant, TenantRegistry,
};

/// High-level configuration for the dashboard feed demo
#[derive(Clone, Debug)]
pub struct DashboardFeedConfig {
    /// Diagnostic session name
    pub session: String,
    /// Polling period for sources that set none, and for aggregation
    pub poll_interval_secs: u64,
    pub request_timeout_ms: u64,
    pub page_size: usize,
    pub tenant_aliases: Vec<String>,
    pub tenants: Vec<Tenant>,
    pub sources: Vec<FeedSource>,
}

/// One webhook source and how its records are keyed, ordered and searched
#[derive(Clone, Debug)]
pub struct FeedSource {
    pub query: SourceQuery,
    pub identity_field: String,
    pub recency_field: Option<String>,
    pub search_fields: Vec<String>,
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

fn clamp_interval(secs: u64) -> u64 {
    secs.clamp(MIN_INTERVAL_SECS, MAX_INTERVAL_SECS)
}

impl Default for DashboardFeedConfig {
    fn default() -> Self {
        Self {
            session: std::env::var("VIGIL_SESSION")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "dashboard_feed".to_string()),
            poll_interval_secs: clamp_interval(
                env_u64("VIGIL_POLL_INTERVAL_SECS").unwrap_or(DEFAULT_INTERVAL_SECS),
            ),
            request_timeout_ms: env_u64("VIGIL_REQUEST_TIMEOUT_MS")
                .filter(|&ms| ms > 0)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT.as_millis() as u64),
            page_size: env_u64("VIGIL_PAGE_SIZE")
                .map(|v| v as usize)
                .filter(|&v| v > 0)
                .unwrap_or(DEFAULT_PAGE_SIZE),
            tenant_aliases: DEFAULT_TENANT_ALIASES.iter().map(|s| s.to_string()).collect(),
            tenants: Vec::new(),
            sources: Vec::new(),
        }
    }
}

impl DashboardFeedConfig {
    /// Load configuration from a TOML file (path via VIGIL_FEED_CONFIG or ./dashboard_feed.toml),
    /// overlaying values onto defaults and env-driven defaults.
    pub fn load() -> Self {
        let default = Self::default();
        let path =
            std::env::var("VIGIL_FEED_CONFIG").unwrap_or_else(|_| "dashboard_feed.toml".into());
        let p = Path::new(&path);
        if !p.exists() {
            tracing::info!(target: "dashboard_feed", path = %path, "No TOML config found; using defaults/env");
            return default;
        }
        match fs::read_to_string(p) {
            Ok(s) => match Self::from_toml_str(&s, default.clone()) {
                Ok(cfg) => cfg,
                Err(e) => {
                    tracing::warn!(target: "dashboard_feed", error = %e, "Failed to parse TOML; using defaults");
                    default
                }
            },
            Err(e) => {
                tracing::warn!(target: "dashboard_feed", error = %e, "Failed to read TOML; using defaults");
                default
            }
        }
    }

    /// Overlay a TOML document onto `base`. Invalid sources are dropped with a warning.
    pub fn from_toml_str(s: &str, base: Self) -> Result<Self, toml::de::Error> {
        let overlay = toml::from_str::<DashboardFeedToml>(s)?;
        Ok(overlay.overlay(base))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn registry(&self) -> TenantRegistry {
        TenantRegistry::new(self.tenants.clone()).with_aliases(self.tenant_aliases.clone())
    }

    /// Sources that take part in aggregation (those with counter rules)
    pub fn aggregate_sources(&self) -> Vec<SourceQuery> {
        self.sources
            .iter()
            .filter(|s| !s.query.rules.is_empty())
            .map(|s| s.query.clone())
            .collect()
    }
}

// =========================
// TOML overlay definitions
// =========================

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct DashboardFeedToml {
    pub session: Option<String>,
    pub poll_interval_secs: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub page_size: Option<usize>,
    pub tenant_aliases: Option<Vec<String>>,
    pub tenants: Option<Vec<Tenant>>,
    pub sources: Option<Vec<SourceToml>>,
}

impl DashboardFeedToml {
    fn overlay(self, mut base: DashboardFeedConfig) -> DashboardFeedConfig {
        if let Some(v) = self.session.filter(|s| !s.is_empty()) {
            base.session = v;
        }
        if let Some(v) = self.poll_interval_secs {
            base.poll_interval_secs = clamp_interval(v);
        }
        if let Some(v) = self.request_timeout_ms.filter(|&ms| ms > 0) {
            base.request_timeout_ms = v;
        }
        if let Some(v) = self.page_size.filter(|&v| v > 0) {
            base.page_size = v;
        }
        if let Some(v) = self.tenant_aliases {
            let aliases: Vec<String> = v.into_iter().filter(|a| !a.is_empty()).collect();
            if !aliases.is_empty() {
                base.tenant_aliases = aliases;
            }
        }
        if let Some(tenants) = self.tenants {
            base.tenants = tenants
                .into_iter()
                .map(|mut t| {
                    if t.status.is_empty() {
                        t.status = "active".to_string();
                    }
                    t
                })
                .collect();
        }
        if let Some(sources) = self.sources {
            let interval = base.poll_interval_secs;
            base.sources = sources
                .into_iter()
                .filter_map(|s| s.into_feed_source(interval))
                .collect();
        }
        base
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
struct SourceToml {
    pub name: String,
    pub url: String,
    pub method: Option<HttpMethod>,
    pub payload: Option<Value>,
    pub interval_secs: Option<u64>,
    pub shape: Option<RecordShape>,
    #[serde(default)]
    pub rules: Vec<CounterRule>,
    pub identity_field: Option<String>,
    pub recency_field: Option<String>,
    #[serde(default)]
    pub search_fields: Vec<String>,
}

impl SourceToml {
    fn into_feed_source(self, default_interval: u64) -> Option<FeedSource> {
        let mut source = SourceConfig::new(self.name, self.url)
            .with_interval_secs(self.interval_secs.unwrap_or(default_interval))
            .with_shape(self.shape.unwrap_or_default());
        if let Some(method) = self.method {
            source.method = method;
        }
        source.payload = self.payload;

        if let Err(e) = source.validate() {
            tracing::warn!(target: "dashboard_feed", error = %e, "Skipping invalid source");
            return None;
        }

        Some(FeedSource {
            query: SourceQuery::new(source, self.rules),
            identity_field: self.identity_field.unwrap_or_else(|| "id".to_string()),
            recency_field: self.recency_field,
            search_fields: self.search_fields,
        })
    }
}
