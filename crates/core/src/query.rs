use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OtqError, Result};
use crate::filter::{FieldConventions, FilterBuilder, FilterSet, TimeRange};
use crate::model::record::Record;
use crate::time::Lookback;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    #[default]
    Logs,
    Traces,
    Metrics,
}

impl Signal {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Logs => "logs",
            Self::Traces => "traces",
            Self::Metrics => "metrics",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Signal {
    type Err = OtqError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "logs" | "log" => Ok(Self::Logs),
            "traces" | "trace" | "spans" => Ok(Self::Traces),
            "metrics" | "metric" => Ok(Self::Metrics),
            _ => Err(OtqError::Parse(format!("unknown signal: {s}"))),
        }
    }
}

/// The UI-level state every query operation starts from. Empty strings and
/// `None` mean "no filter".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryOptions {
    pub signal: Signal,
    pub range: TimeRange,
    pub services: Vec<String>,
    pub exclude_services: Vec<String>,
    pub environments: Vec<String>,
    pub exclude_environments: Vec<String>,
    pub level: Option<String>,
    pub container: Option<String>,
    pub has_fields: Vec<String>,
    pub operation: Option<String>,
    pub event_type: Option<String>,
    pub limit: usize,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            signal: Signal::Logs,
            range: TimeRange::Lookback(Lookback::hours(1)),
            services: Vec::new(),
            exclude_services: Vec::new(),
            environments: Vec::new(),
            exclude_environments: Vec::new(),
            level: None,
            container: None,
            has_fields: Vec::new(),
            operation: None,
            event_type: None,
            limit: 100,
        }
    }
}

impl QueryOptions {
    pub fn with_range(mut self, range: TimeRange) -> Self {
        self.range = range;
        self
    }

    /// Every intent except the time range.
    pub fn scope_filters(&self, conventions: &FieldConventions) -> FilterSet {
        let mut builder = FilterBuilder::new(conventions);
        for service in &self.services {
            builder = builder.add_service(service, false);
        }
        for service in &self.exclude_services {
            builder = builder.add_service(service, true);
        }
        for env in &self.environments {
            builder = builder.add_resource(env, false);
        }
        for env in &self.exclude_environments {
            builder = builder.add_resource(env, true);
        }
        for field in &self.has_fields {
            builder = builder.add_field_exists(field);
        }
        builder
            .add_level(self.level.as_deref().unwrap_or_default())
            .add_container_prefix(self.container.as_deref().unwrap_or_default())
            .add_operation(self.operation.as_deref().unwrap_or_default())
            .add_event_type(self.event_type.as_deref().unwrap_or_default())
            .build()
    }

    pub fn filters(&self, conventions: &FieldConventions) -> FilterSet {
        let mut set = FilterBuilder::new(conventions)
            .add_time_range(self.range.clone())
            .build();
        set.extend(self.scope_filters(conventions));
        set
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentPage {
    pub records: Vec<Record>,
    pub total: u64,
    /// Rendered statement, kept for `--show-query`.
    pub query: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricPoint {
    pub timestamp: DateTime<Utc>,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricSeries {
    pub field: String,
    /// `avg` for gauges and counters, `p95` for histograms.
    pub stat: String,
    pub latest: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub points: Vec<MetricPoint>,
    pub sample: Option<Record>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationStats {
    pub name: String,
    pub count: u64,
    pub avg_duration_ms: Option<f64>,
    pub p95_duration_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PerspectiveCount {
    pub value: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
    pub aggregatable: bool,
    pub searchable: bool,
    pub time_series_metric: Option<String>,
    pub time_series_dimension: bool,
}

impl FieldInfo {
    pub fn is_numeric(&self) -> bool {
        matches!(
            self.ty.as_str(),
            "long"
                | "integer"
                | "short"
                | "byte"
                | "double"
                | "float"
                | "half_float"
                | "scaled_float"
                | "unsigned_long"
                | "aggregate_metric_double"
        )
    }

    pub fn is_histogram(&self) -> bool {
        matches!(self.ty.as_str(), "histogram" | "exponential_histogram")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterInfo {
    pub name: String,
    pub cluster_name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DetectedRange {
    pub lookback: Lookback,
    pub count: u64,
}
