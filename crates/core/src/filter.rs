use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OtqError, Result};
use crate::time::Lookback;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Trace = 1,
    Debug = 5,
    Info = 9,
    Warn = 13,
    Error = 17,
    Fatal = 21,
}

impl Level {
    /// Bucket an OTel severity number. Zero and negative numbers have no
    /// level; anything above the ERROR range is FATAL.
    pub fn from_severity_number(n: i64) -> Option<Self> {
        match n {
            1..=4 => Some(Self::Trace),
            5..=8 => Some(Self::Debug),
            9..=12 => Some(Self::Info),
            13..=16 => Some(Self::Warn),
            17..=20 => Some(Self::Error),
            21.. => Some(Self::Fatal),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
        }
    }
}

impl FromStr for Level {
    type Err = OtqError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "TRACE" => Ok(Self::Trace),
            "DEBUG" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "WARN" | "WARNING" => Ok(Self::Warn),
            "ERROR" => Ok(Self::Error),
            "FATAL" | "CRITICAL" => Ok(Self::Fatal),
            _ => Err(OtqError::Parse(format!("unknown level: {s}"))),
        }
    }
}

/// Where each logical field lives across the OTel and ECS mappings. Every
/// list is tried as an or-group; the first entry is the preferred
/// spelling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldConventions {
    pub timestamp: String,
    pub service: Vec<String>,
    pub environment: Vec<String>,
    pub level: Vec<String>,
    pub text: Vec<String>,
    pub trace_id: Vec<String>,
    pub event_type: Vec<String>,
    pub operation: Vec<String>,
    pub container: Vec<String>,
    pub duration: String,
    /// Roots that are real nested objects in the mapping. Dotted fields
    /// under any other root are quoted in piped statements.
    pub nested_roots: Vec<String>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for FieldConventions {
    fn default() -> Self {
        Self {
            timestamp: "@timestamp".to_string(),
            service: strings(&["resource.attributes.service.name", "service.name"]),
            environment: strings(&[
                "resource.attributes.deployment.environment",
                "resource.attributes.deployment.environment.name",
                "service.environment",
            ]),
            level: strings(&["severity_text", "log.level", "level"]),
            text: strings(&["body.text", "message", "event_name"]),
            trace_id: strings(&["trace_id", "trace.id"]),
            event_type: strings(&["attributes.processor.event", "processor.event"]),
            operation: strings(&["name", "transaction.name", "span.name"]),
            container: strings(&["resource.attributes.container.id", "container.id"]),
            duration: "duration".to_string(),
            nested_roots: strings(&[
                "resource",
                "attributes",
                "scope",
                "body",
                "service",
                "trace",
                "span",
                "transaction",
                "log",
                "processor",
                "event",
                "host",
                "container",
                "data_stream",
            ]),
        }
    }
}

/// Either a lookback from now or explicit bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeRange {
    Lookback(Lookback),
    Absolute {
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    },
}

impl TimeRange {
    pub fn is_unbounded(&self) -> bool {
        match self {
            Self::Lookback(lookback) => lookback.is_all_time(),
            Self::Absolute { from, to } => from.is_none() && to.is_none(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentKind {
    TimeRange,
    Service,
    Resource,
    Level,
    Text,
    TraceId,
    EventType,
    Operation,
    FieldExists,
    ContainerPrefix,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Predicate {
    Time(TimeRange),
    /// Equal to any of the values.
    Terms(Vec<String>),
    Prefix(String),
    Exists,
    /// Free text, matched leniently.
    Text(String),
}

/// One backend-neutral filter. `fields` is an or-group: the clause holds
/// when the predicate holds on at least one of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterIntent {
    pub kind: IntentKind,
    pub fields: Vec<String>,
    pub predicate: Predicate,
    pub negate: bool,
}

/// Ordered, additive set of intents rendered once per query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSet {
    pub intents: Vec<FilterIntent>,
}

impl FilterSet {
    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }

    pub fn positive(&self) -> impl Iterator<Item = &FilterIntent> {
        self.intents.iter().filter(|i| !i.negate)
    }

    pub fn negative(&self) -> impl Iterator<Item = &FilterIntent> {
        self.intents.iter().filter(|i| i.negate)
    }

    pub fn extend(&mut self, other: FilterSet) {
        self.intents.extend(other.intents);
    }
}

/// Accumulates intents. Every `add_*` ignores empty input so callers can
/// pass optional UI state through unconditionally.
#[derive(Debug, Clone)]
pub struct FilterBuilder<'a> {
    conventions: &'a FieldConventions,
    intents: Vec<FilterIntent>,
}

impl<'a> FilterBuilder<'a> {
    pub fn new(conventions: &'a FieldConventions) -> Self {
        Self {
            conventions,
            intents: Vec::new(),
        }
    }

    fn push(
        mut self,
        kind: IntentKind,
        fields: Vec<String>,
        predicate: Predicate,
        negate: bool,
    ) -> Self {
        if !fields.is_empty() {
            self.intents.push(FilterIntent {
                kind,
                fields,
                predicate,
                negate,
            });
        }
        self
    }

    pub fn add_time_range(self, range: TimeRange) -> Self {
        if range.is_unbounded() {
            return self;
        }
        let field = vec![self.conventions.timestamp.clone()];
        self.push(IntentKind::TimeRange, field, Predicate::Time(range), false)
    }

    pub fn add_service(self, name: &str, negate: bool) -> Self {
        let name = name.trim();
        if name.is_empty() {
            return self;
        }
        let fields = self.conventions.service.clone();
        self.push(IntentKind::Service, fields, Predicate::Terms(vec![name.to_string()]), negate)
    }

    /// Deployment environment (resource-level) filter.
    pub fn add_resource(self, name: &str, negate: bool) -> Self {
        let name = name.trim();
        if name.is_empty() {
            return self;
        }
        let fields = self.conventions.environment.clone();
        self.push(IntentKind::Resource, fields, Predicate::Terms(vec![name.to_string()]), negate)
    }

    /// Matches the level in both the OTel (upper) and ECS (lower) casing.
    pub fn add_level(self, level: &str) -> Self {
        let level = level.trim();
        if level.is_empty() {
            return self;
        }
        let mut values = vec![level.to_ascii_uppercase(), level.to_ascii_lowercase()];
        values.dedup();
        let fields = self.conventions.level.clone();
        self.push(IntentKind::Level, fields, Predicate::Terms(values), false)
    }

    /// Free text over `fields`, or the conventional text fields when none
    /// are given.
    pub fn add_text(self, query: &str, fields: &[String]) -> Self {
        let query = query.trim();
        if query.is_empty() {
            return self;
        }
        let fields = if fields.is_empty() {
            self.conventions.text.clone()
        } else {
            fields.to_vec()
        };
        self.push(IntentKind::Text, fields, Predicate::Text(query.to_string()), false)
    }

    pub fn add_trace_id(self, trace_id: &str) -> Self {
        let trace_id = trace_id.trim();
        if trace_id.is_empty() {
            return self;
        }
        let fields = self.conventions.trace_id.clone();
        self.push(IntentKind::TraceId, fields, Predicate::Terms(vec![trace_id.to_string()]), false)
    }

    /// Span event type (`span`, `transaction`, ...) for ECS-shaped traces.
    pub fn add_event_type(self, event_type: &str) -> Self {
        let event_type = event_type.trim();
        if event_type.is_empty() {
            return self;
        }
        let fields = self.conventions.event_type.clone();
        let predicate = Predicate::Terms(vec![event_type.to_string()]);
        self.push(IntentKind::EventType, fields, predicate, false)
    }

    pub fn add_operation(self, name: &str) -> Self {
        let name = name.trim();
        if name.is_empty() {
            return self;
        }
        let fields = self.conventions.operation.clone();
        self.push(IntentKind::Operation, fields, Predicate::Terms(vec![name.to_string()]), false)
    }

    pub fn add_field_exists(self, field: &str) -> Self {
        let field = field.trim();
        if field.is_empty() {
            return self;
        }
        self.push(IntentKind::FieldExists, vec![field.to_string()], Predicate::Exists, false)
    }

    pub fn add_container_prefix(self, prefix: &str) -> Self {
        let prefix = prefix.trim();
        if prefix.is_empty() {
            return self;
        }
        let fields = self.conventions.container.clone();
        let predicate = Predicate::Prefix(prefix.to_string());
        self.push(IntentKind::ContainerPrefix, fields, predicate, false)
    }

    pub fn build(self) -> FilterSet {
        FilterSet {
            intents: self.intents,
        }
    }
}
