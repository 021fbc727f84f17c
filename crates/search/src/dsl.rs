//! Structured (JSON tree) query rendering.

use chrono::{DateTime, SecondsFormat, Utc};
use otq_core::filter::{FilterIntent, FilterSet, Predicate, TimeRange};
use otq_core::query::FieldInfo;
use serde_json::{Map, Value, json};

/// Aggregation name prefix for per-field metric aggregations (`m0`, `m1`,
/// ...). Field names are not valid aggregation names in general.
pub const METRIC_AGG_PREFIX: &str = "m";
/// Aggregation name prefix for per-field terms aggregations.
pub const TERMS_AGG_PREFIX: &str = "f";
pub const HISTOGRAM_PERCENTILE: f64 = 95.0;

const TARGET_BUCKETS: i64 = 60;
const INTERVALS: &[(i64, &str)] = &[
    (10, "10s"),
    (30, "30s"),
    (60, "1m"),
    (300, "5m"),
    (600, "10m"),
    (1_800, "30m"),
    (3_600, "1h"),
    (10_800, "3h"),
    (43_200, "12h"),
    (86_400, "1d"),
];

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Render a filter set as a `bool` query. Positive intents go to `must`,
/// negated intents to `must_not`. An empty set matches everything.
pub fn render_bool(set: &FilterSet) -> Value {
    let mut must = Vec::new();
    let mut must_not = Vec::new();

    for intent in &set.intents {
        let Some(clause) = render_intent(intent) else {
            continue;
        };
        if intent.negate {
            must_not.push(clause);
        } else {
            must.push(clause);
        }
    }

    if must.is_empty() && must_not.is_empty() {
        return json!({"match_all": {}});
    }

    let mut bool_query = Map::new();
    for (key, clauses) in [("must", must), ("must_not", must_not)] {
        if !clauses.is_empty() {
            bool_query.insert(key.to_string(), Value::Array(clauses));
        }
    }
    json!({"bool": bool_query})
}

fn render_intent(intent: &FilterIntent) -> Option<Value> {
    if let Predicate::Text(query) = &intent.predicate {
        return Some(json!({
            "multi_match": {
                "query": query,
                "fields": intent.fields,
                "type": "phrase_prefix",
                "lenient": true
            }
        }));
    }

    let clauses = intent
        .fields
        .iter()
        .filter_map(|field| render_predicate(field, &intent.predicate))
        .collect::<Vec<_>>();

    match clauses.len() {
        0 => None,
        1 => clauses.into_iter().next(),
        _ => Some(json!({
            "bool": {"should": clauses, "minimum_should_match": 1}
        })),
    }
}

fn render_predicate(field: &str, predicate: &Predicate) -> Option<Value> {
    let clause = match predicate {
        Predicate::Time(range) => {
            let mut bounds = Map::new();
            match range {
                TimeRange::Lookback(lookback) => {
                    bounds.insert("gte".into(), json!(lookback.as_date_math()?));
                }
                TimeRange::Absolute { from, to } => {
                    if let Some(from) = from {
                        bounds.insert("gte".into(), json!(format_timestamp(*from)));
                    }
                    if let Some(to) = to {
                        bounds.insert("lte".into(), json!(format_timestamp(*to)));
                    }
                    bounds.insert("format".into(), json!("strict_date_optional_time"));
                }
            }
            json!({"range": {field: bounds}})
        }
        Predicate::Terms(values) => match values.as_slice() {
            [] => return None,
            [value] => json!({"term": {field: value}}),
            values => json!({"terms": {field: values}}),
        },
        Predicate::Prefix(prefix) => json!({"prefix": {field: prefix}}),
        Predicate::Exists => json!({"exists": {"field": field}}),
        Predicate::Text(query) => json!({"match_phrase_prefix": {field: query}}),
    };
    Some(clause)
}

/// Spans of one trace, oldest first.
pub fn trace_body(query: Value, timestamp_field: &str, size: usize) -> Value {
    json!({
        "query": query,
        "size": size,
        "sort": [{timestamp_field: {"order": "asc"}}],
        "track_total_hits": true
    })
}

/// One `terms` aggregation per field spelling (`f0`, `f1`, ...); callers
/// merge the buckets.
pub fn terms_body(query: Value, fields: &[String], size: usize) -> Value {
    let aggs = fields
        .iter()
        .enumerate()
        .map(|(idx, field)| {
            (
                format!("{TERMS_AGG_PREFIX}{idx}"),
                json!({"terms": {"field": field, "size": size}}),
            )
        })
        .collect::<Map<_, _>>();
    json!({"size": 0, "query": query, "aggs": aggs})
}

/// Time series for each metric field: a `date_histogram` whose buckets hold
/// one `avg` (or 95th `percentiles` for histogram fields) per field plus
/// the latest document as a sample.
pub fn metrics_body(
    query: Value,
    timestamp_field: &str,
    fields: &[FieldInfo],
    interval: &str,
) -> Value {
    let mut per_bucket = fields
        .iter()
        .enumerate()
        .map(|(idx, field)| {
            let agg = if field.is_histogram() {
                json!({"percentiles": {"field": field.name, "percents": [HISTOGRAM_PERCENTILE]}})
            } else {
                json!({"avg": {"field": field.name}})
            };
            (format!("{METRIC_AGG_PREFIX}{idx}"), agg)
        })
        .collect::<Map<_, _>>();
    per_bucket.insert(
        "sample".to_string(),
        json!({"top_hits": {"size": 1, "sort": [{timestamp_field: {"order": "desc"}}]}}),
    );

    json!({
        "size": 0,
        "query": query,
        "aggs": {
            "over_time": {
                "date_histogram": {
                    "field": timestamp_field,
                    "fixed_interval": interval,
                    "min_doc_count": 0
                },
                "aggs": per_bucket
            }
        }
    })
}

/// Pick a histogram interval giving roughly sixty buckets over `span`.
pub fn histogram_interval(span: chrono::Duration) -> &'static str {
    let per_bucket = span.num_seconds().max(1) / TARGET_BUCKETS;
    INTERVALS
        .iter()
        .find(|(secs, _)| *secs >= per_bucket)
        .map(|(_, label)| *label)
        .unwrap_or("1d")
}
