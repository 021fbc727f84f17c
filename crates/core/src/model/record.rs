use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::model::attrs::{self, AttrMap, AttrValue};

/// Decimal places for durations below one millisecond.
pub const SUB_MILLISECOND_DECIMALS: usize = 3;
/// Decimal places for durations of one millisecond or more.
pub const MILLISECOND_DECIMALS: usize = 1;

/// The canonical shape every raw telemetry document is normalized into.
///
/// Records are built once per document by [`crate::normalize`] and are not
/// mutated afterwards. Missing fields stay empty; the untouched payload is
/// kept in `raw` so [`Record::get_field`] can still answer drill-down
/// lookups for fields the normalizer does not know about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub index: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub service_name: String,
    pub container_id: Option<String>,
    pub resource_attributes: AttrMap,
    pub body: String,
    pub message: String,
    pub event_name: Option<String>,
    pub level: String,
    pub attributes: AttrMap,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub parent_span_id: Option<String>,
    pub name: Option<String>,
    pub duration_nanos: Option<u64>,
    pub kind: Option<String>,
    pub status: AttrMap,
    pub metrics: AttrMap,
    pub scope: AttrMap,
    #[serde(skip)]
    pub raw: AttrMap,
}

impl Record {
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            index: String::new(),
            id: String::new(),
            service_name: String::new(),
            container_id: None,
            resource_attributes: AttrMap::new(),
            body: String::new(),
            message: String::new(),
            event_name: None,
            level: String::new(),
            attributes: AttrMap::new(),
            trace_id: None,
            span_id: None,
            parent_span_id: None,
            name: None,
            duration_nanos: None,
            kind: None,
            status: AttrMap::new(),
            metrics: AttrMap::new(),
            scope: AttrMap::new(),
            raw: AttrMap::new(),
        }
    }

    /// The line shown in list views: body, then message, then event name.
    pub fn display_message(&self) -> &str {
        if !self.body.is_empty() {
            &self.body
        } else if !self.message.is_empty() {
            &self.message
        } else {
            self.event_name.as_deref().unwrap_or_default()
        }
    }

    pub fn format_duration(&self) -> String {
        self.duration_nanos
            .map(format_duration_nanos)
            .unwrap_or_default()
    }

    /// Span status code (`Ok`, `Error`, `Unset`) when one was recorded.
    pub fn status_code(&self) -> Option<String> {
        attrs::lookup(&self.status, "code").and_then(AttrValue::scalar_text)
    }

    /// Metric bag rendered as comma-joined `name=value` pairs.
    pub fn metrics_summary(&self) -> String {
        attrs::flatten(&self.metrics)
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Look a field up by display path. Never fails: unknown paths yield an
    /// empty string.
    ///
    /// Order: synthetic and canonical fields, a literal attribute key, an
    /// `attributes.`-prefixed path, the raw document, resource attributes
    /// (with or without the `resource.attributes.` prefix), and finally the
    /// raw `resource` object.
    pub fn get_field(&self, path: &str) -> String {
        if let Some(value) = self.synthetic_field(path)
            && !value.is_empty()
        {
            return value;
        }

        if let Some(v) = self.attributes.get(path)
            && !v.is_empty()
        {
            return v.to_string();
        }

        if let Some(rest) = path.strip_prefix("attributes.")
            && let Some(v) = attrs::lookup(&self.attributes, rest)
        {
            return v.to_string();
        }

        if let Some(v) = attrs::lookup(&self.raw, path) {
            return v.to_string();
        }

        let resource_path = path.strip_prefix("resource.attributes.").unwrap_or(path);
        if let Some(v) = attrs::lookup(&self.resource_attributes, resource_path) {
            return v.to_string();
        }

        if let Some(AttrValue::Bag(resource)) = self.raw.get("resource") {
            let rest = path.strip_prefix("resource.").unwrap_or(path);
            if let Some(v) = attrs::lookup(resource, rest) {
                return v.to_string();
            }
        }

        String::new()
    }

    fn synthetic_field(&self, path: &str) -> Option<String> {
        let value = match path {
            "@timestamp" | "timestamp" => self
                .timestamp
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            "duration_ms" => self.format_duration(),
            "_metrics" => self.metrics_summary(),
            "level" => self.level.clone(),
            "message" => self.message.clone(),
            "body" => self.body.clone(),
            "service.name" => self.service_name.clone(),
            "trace_id" | "trace.id" => self.trace_id.clone().unwrap_or_default(),
            "span_id" | "span.id" => self.span_id.clone().unwrap_or_default(),
            "name" => self.name.clone().unwrap_or_default(),
            "kind" => self.kind.clone().unwrap_or_default(),
            _ => return None,
        };
        Some(value)
    }
}

/// Render a nanosecond duration in milliseconds: three decimals below one
/// millisecond, one decimal otherwise.
pub fn format_duration_nanos(nanos: u64) -> String {
    let ms = nanos as f64 / 1_000_000.0;
    let decimals = if ms < 1.0 {
        SUB_MILLISECOND_DECIMALS
    } else {
        MILLISECOND_DECIMALS
    };
    format!("{ms:.decimals$}ms")
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn bag(value: serde_json::Value) -> AttrMap {
        AttrValue::from(value).into_bag().unwrap()
    }

    fn sample() -> Record {
        let ts = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let mut r = Record::empty(ts);
        r.service_name = "checkout".into();
        r.level = "ERROR".into();
        r.duration_nanos = Some(1_500_000);
        r.attributes = bag(json!({"http.method": "GET", "db": {"system": "redis"}}));
        r.resource_attributes = bag(json!({"deployment.environment": "prod"}));
        r.metrics = bag(json!({"system.cpu.usage": 0.5, "up": 1}));
        r.raw = bag(json!({
            "custom": {"nested": "deep"},
            "resource": {"host.name": "web-1"}
        }));
        r
    }

    #[test]
    fn duration_decimals_depend_on_magnitude() {
        assert_eq!(format_duration_nanos(250_000), "0.250ms");
        assert_eq!(format_duration_nanos(1_500_000), "1.5ms");
        assert_eq!(format_duration_nanos(12_345_678), "12.3ms");
    }

    #[test]
    fn get_field_resolves_synthetic_fields() {
        let r = sample();
        assert_eq!(r.get_field("@timestamp"), "2026-02-01T00:00:00.000Z");
        assert_eq!(r.get_field("duration_ms"), "1.5ms");
        assert_eq!(r.get_field("_metrics"), "system.cpu.usage=0.5, up=1");
        assert_eq!(r.get_field("service.name"), "checkout");
    }

    #[test]
    fn get_field_walks_attribute_and_resource_locations() {
        let r = sample();
        assert_eq!(r.get_field("http.method"), "GET");
        assert_eq!(r.get_field("attributes.db.system"), "redis");
        assert_eq!(r.get_field("custom.nested"), "deep");
        assert_eq!(
            r.get_field("resource.attributes.deployment.environment"),
            "prod"
        );
        assert_eq!(r.get_field("deployment.environment"), "prod");
        assert_eq!(r.get_field("resource.host.name"), "web-1");
        assert_eq!(r.get_field("nope"), "");
    }

    #[test]
    fn display_message_falls_back() {
        let mut r = sample();
        assert_eq!(r.display_message(), "");
        r.event_name = Some("session.start".into());
        assert_eq!(r.display_message(), "session.start");
        r.message = "hello".into();
        assert_eq!(r.display_message(), "hello");
        r.body = "body wins".into();
        assert_eq!(r.display_message(), "body wins");
    }
}
