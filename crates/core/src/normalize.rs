//! Schema normalization.
//!
//! The store holds documents written by different shippers: OTel-native
//! mappings (`resource.attributes.*`, `body.text`, `severity_text`), ECS
//! shapes (`service.name`, `log.level`, `trace.id`), and flattened column
//! rows coming back from piped queries. Each field family below is resolved
//! independently through an ordered list of locations; the first non-empty
//! value wins and a missing family simply stays empty.

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::filter::Level;
use crate::model::attrs::{self, AttrMap, AttrValue};
use crate::model::record::Record;

/// Numeric timestamp strings above this magnitude are epoch milliseconds.
const EPOCH_MILLIS_FLOOR: i64 = 1_000_000_000_000;

const NAIVE_TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y/%m/%d %H:%M:%S%.f",
];

const TIMESTAMP_FIELDS: &[&str] = &["@timestamp", "timestamp"];

/// Where a value may live inside a document.
#[derive(Debug, Clone, Copy)]
enum Locator {
    /// A literal top-level key, dots included.
    Flat(&'static str),
    /// Strict descent through the given bags, then a dot-tolerant lookup.
    Within(&'static [&'static str], &'static str),
}

const SERVICE_NAME: &[Locator] = &[
    Locator::Within(&["resource", "attributes"], "service.name"),
    Locator::Flat("resource.attributes.service.name"),
    Locator::Within(&["attributes"], "service.name"),
    Locator::Flat("attributes.service.name"),
    Locator::Flat("service.name"),
    Locator::Within(&["service"], "name"),
];

const CONTAINER_ID: &[Locator] = &[
    Locator::Within(&["resource", "attributes"], "container.id"),
    Locator::Flat("resource.attributes.container.id"),
    Locator::Flat("container.id"),
    Locator::Within(&["container"], "id"),
];

const BODY: &[Locator] = &[
    Locator::Within(&["body"], "text"),
    Locator::Flat("body.text"),
    Locator::Flat("body"),
];

const LEVEL: &[Locator] = &[
    Locator::Flat("severity_text"),
    Locator::Flat("log.level"),
    Locator::Within(&["log"], "level"),
    Locator::Flat("level"),
];

const TRACE_ID: &[Locator] = &[
    Locator::Flat("trace_id"),
    Locator::Flat("trace.id"),
    Locator::Within(&["trace"], "id"),
];

const SPAN_ID: &[Locator] = &[
    Locator::Flat("span_id"),
    Locator::Flat("span.id"),
    Locator::Within(&["span"], "id"),
];

const PARENT_SPAN_ID: &[Locator] = &[
    Locator::Flat("parent_span_id"),
    Locator::Flat("parent.id"),
    Locator::Within(&["parent"], "id"),
];

const SPAN_NAME: &[Locator] = &[
    Locator::Flat("name"),
    Locator::Flat("span.name"),
    Locator::Within(&["span"], "name"),
    Locator::Flat("transaction.name"),
    Locator::Within(&["transaction"], "name"),
];

const SPAN_KIND: &[Locator] = &[
    Locator::Flat("kind"),
    Locator::Flat("span.kind"),
    Locator::Within(&["span"], "kind"),
];

const EVENT_NAME: &[Locator] = &[
    Locator::Flat("event_name"),
    Locator::Within(&["attributes"], "event.name"),
];

const DURATION_NANOS: &[Locator] = &[Locator::Flat("duration")];

const DURATION_MICROS: &[Locator] = &[
    Locator::Flat("span.duration.us"),
    Locator::Within(&["span", "duration"], "us"),
    Locator::Flat("transaction.duration.us"),
    Locator::Within(&["transaction", "duration"], "us"),
];

/// Normalize one raw document. Never fails: a document that is not an
/// object, or that carries none of the known fields, still produces a
/// record stamped with the current time.
pub fn normalize(raw: serde_json::Value) -> Record {
    match AttrValue::from(raw) {
        AttrValue::Bag(doc) => normalize_doc(doc),
        other => {
            let mut record = Record::empty(Utc::now());
            record.body = other.scalar_text().unwrap_or_default();
            record
        }
    }
}

/// Normalize a search hit, keeping its `_index` and `_id`.
pub fn normalize_hit(hit: serde_json::Value) -> Record {
    let serde_json::Value::Object(mut hit) = hit else {
        return normalize(hit);
    };
    let index = take_string(&mut hit, "_index");
    let id = take_string(&mut hit, "_id");
    let source = hit
        .remove("_source")
        .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new()));

    let mut record = normalize(source);
    record.index = index;
    record.id = id;
    record
}

/// Normalize one row of a piped-query result. Column names become literal
/// (possibly dotted) keys; null cells are dropped. `_index` and `_id`
/// metadata columns are lifted onto the record.
pub fn normalize_row(columns: &[String], row: Vec<serde_json::Value>) -> Record {
    let mut doc = columns
        .iter()
        .cloned()
        .zip(row)
        .filter(|(_, v)| !v.is_null())
        .collect::<serde_json::Map<_, _>>();
    let index = take_string(&mut doc, "_index");
    let id = take_string(&mut doc, "_id");

    let mut record = normalize(serde_json::Value::Object(doc));
    record.index = index;
    record.id = id;
    record
}

fn normalize_doc(doc: AttrMap) -> Record {
    let mut record = Record::empty(parse_timestamp(&doc));

    record.service_name = locate(&doc, SERVICE_NAME).unwrap_or_default();
    record.container_id = locate(&doc, CONTAINER_ID);
    record.resource_attributes = resource_attributes(&doc);
    record.attributes = {
        let attributes = bag_at(&doc, "attributes");
        if attributes.is_empty() {
            bag_at(&doc, "labels")
        } else {
            attributes
        }
    };

    record.message = scalar(&doc, "message").unwrap_or_default();
    record.event_name = locate(&doc, EVENT_NAME);
    record.body = locate(&doc, BODY)
        .or_else(|| (!record.message.is_empty()).then(|| record.message.clone()))
        .or_else(|| record.event_name.clone())
        .unwrap_or_default();
    record.level = parse_level(&doc);

    record.trace_id = locate(&doc, TRACE_ID);
    record.span_id = locate(&doc, SPAN_ID);
    record.parent_span_id = locate(&doc, PARENT_SPAN_ID);
    record.name = locate(&doc, SPAN_NAME);
    record.kind = locate(&doc, SPAN_KIND);
    record.duration_nanos = parse_duration_nanos(&doc);
    record.status = parse_status(&doc);

    record.metrics = bag_at(&doc, "metrics");
    record.scope = bag_at(&doc, "scope");

    record.raw = doc;
    record
}

fn take_string(map: &mut serde_json::Map<String, serde_json::Value>, key: &str) -> String {
    match map.remove(key) {
        Some(serde_json::Value::String(s)) => s,
        _ => String::new(),
    }
}

fn resolve<'a>(doc: &'a AttrMap, locator: Locator) -> Option<&'a AttrValue> {
    match locator {
        Locator::Flat(key) => doc.get(key),
        Locator::Within(parents, rest) => {
            let mut current = doc;
            for parent in parents {
                current = current.get(*parent)?.as_bag()?;
            }
            attrs::lookup(current, rest)
        }
    }
}

fn locate(doc: &AttrMap, locators: &[Locator]) -> Option<String> {
    locators.iter().find_map(|locator| {
        resolve(doc, *locator)
            .and_then(AttrValue::scalar_text)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

fn locate_number(doc: &AttrMap, locators: &[Locator]) -> Option<f64> {
    locators
        .iter()
        .find_map(|locator| resolve(doc, *locator).and_then(AttrValue::as_f64))
        .filter(|n| n.is_finite() && *n >= 0.0)
}

fn scalar(doc: &AttrMap, key: &str) -> Option<String> {
    doc.get(key)
        .and_then(AttrValue::scalar_text)
        .filter(|s| !s.trim().is_empty())
}

/// Collect the bag stored under `prefix`, merged with literal
/// `prefix.`-keys from flattened documents.
fn bag_at(doc: &AttrMap, prefix: &str) -> AttrMap {
    let mut out = attrs::lookup(doc, prefix)
        .and_then(AttrValue::as_bag)
        .cloned()
        .unwrap_or_default();

    let dotted = format!("{prefix}.");
    for (key, value) in doc {
        if let Some(rest) = key.strip_prefix(&dotted)
            && !rest.is_empty()
        {
            out.entry(rest.to_string()).or_insert_with(|| value.clone());
        }
    }
    out
}

fn resource_attributes(doc: &AttrMap) -> AttrMap {
    let nested = bag_at(doc, "resource.attributes");
    if !nested.is_empty() {
        return nested;
    }
    let mut flat = bag_at(doc, "resource");
    flat.remove("attributes");
    flat
}

fn parse_timestamp(doc: &AttrMap) -> DateTime<Utc> {
    TIMESTAMP_FIELDS
        .iter()
        .filter_map(|key| attrs::lookup(doc, key))
        .find_map(timestamp_from_value)
        .unwrap_or_else(Utc::now)
}

fn timestamp_from_value(value: &AttrValue) -> Option<DateTime<Utc>> {
    match value {
        AttrValue::Number(n) if n.is_finite() => DateTime::from_timestamp_millis(*n as i64),
        AttrValue::String(s) => parse_timestamp_str(s.trim()),
        _ => None,
    }
}

/// Parse a timestamp string: epoch milliseconds, RFC 3339, or one of the
/// naive formats (read as UTC).
pub fn parse_timestamp_str(input: &str) -> Option<DateTime<Utc>> {
    if let Ok(n) = input.parse::<i64>()
        && n > EPOCH_MILLIS_FLOOR
    {
        return DateTime::from_timestamp_millis(n);
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(input, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(ts.with_timezone(&Utc));
    }

    NAIVE_TIMESTAMP_FORMATS.iter().find_map(|fmt| {
        NaiveDateTime::parse_from_str(input.trim_end_matches('Z'), fmt)
            .ok()
            .map(|naive| naive.and_utc())
    })
}

fn parse_level(doc: &AttrMap) -> String {
    if let Some(text) = locate(doc, LEVEL) {
        return text.to_ascii_uppercase();
    }
    locate_number(doc, &[Locator::Flat("severity_number")])
        .and_then(|n| Level::from_severity_number(n as i64))
        .map(|level| level.as_str().to_string())
        .unwrap_or_default()
}

fn parse_duration_nanos(doc: &AttrMap) -> Option<u64> {
    if let Some(nanos) = locate_number(doc, DURATION_NANOS) {
        return Some(nanos as u64);
    }
    locate_number(doc, DURATION_MICROS).map(|micros| (micros * 1_000.0) as u64)
}

fn parse_status(doc: &AttrMap) -> AttrMap {
    match doc.get("status") {
        Some(AttrValue::String(code)) if !code.is_empty() => {
            AttrMap::from([("code".to_string(), AttrValue::String(code.clone()))])
        }
        _ => bag_at(doc, "status"),
    }
}
