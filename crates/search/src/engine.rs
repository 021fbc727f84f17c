use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use otq_core::config::Config;
use otq_core::filter::{FieldConventions, FilterBuilder, FilterSet, IntentKind, TimeRange};
use otq_core::ids::TraceId;
use otq_core::model::Record;
use otq_core::normalize::{normalize_hit, normalize_row};
use otq_core::query::{
    ClusterInfo, DetectedRange, DocumentPage, FieldInfo, MetricPoint, MetricSeries, OperationStats,
    PerspectiveCount, QueryOptions, Signal,
};
use otq_core::time::{Lookback, lookback_candidates};
use otq_core::{OtqError, Result};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::autorange::{self, RangeCounter};
use crate::classify::{Classification, classify};
use crate::client::{ClientConfig, EsClient};
use crate::dsl;
use crate::esql::{Renderer, Statement};
use crate::lifecycle::{Completion, RequestContext, RequestKind, RequestManager};

/// Spans fetched for one trace.
pub const MAX_TRACE_SPANS: usize = 5_000;
/// Lookback used to size histogram buckets when a query has no lower bound.
const UNBOUNDED_SPAN_DAYS: i64 = 365;

/// Everything the engine needs, as plain values.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub client: ClientConfig,
    pub logs_index: String,
    pub traces_index: String,
    pub metrics_index: String,
    pub document_timeout: Duration,
    pub aggregation_timeout: Duration,
    pub discovery_timeout: Duration,
    pub auto_range_threshold: u64,
    pub max_aggregation_fields: usize,
    pub fields: FieldConventions,
}

impl From<&Config> for EngineConfig {
    fn from(cfg: &Config) -> Self {
        Self {
            client: ClientConfig {
                url: cfg.url.clone(),
                username: cfg.username.clone(),
                password: cfg.password.clone(),
                api_key: cfg.api_key.clone(),
                insecure: cfg.insecure,
                headers: cfg.headers.clone(),
            },
            logs_index: cfg.logs_index.clone(),
            traces_index: cfg.traces_index.clone(),
            metrics_index: cfg.metrics_index.clone(),
            document_timeout: cfg.document_timeout,
            aggregation_timeout: cfg.aggregation_timeout,
            discovery_timeout: cfg.discovery_timeout,
            auto_range_threshold: cfg.auto_range_threshold,
            max_aggregation_fields: cfg.max_aggregation_fields,
            fields: cfg.fields.clone(),
        }
    }
}

/// What a perspective count groups by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Perspective {
    Services,
    Environments,
    Field(String),
}

impl FromStr for Perspective {
    type Err = OtqError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" => Err(OtqError::InvalidArgument("empty perspective".to_string())),
            "services" | "service" => Ok(Self::Services),
            "environments" | "environment" | "envs" | "env" => Ok(Self::Environments),
            field => Ok(Self::Field(field.to_string())),
        }
    }
}

/// Query engine over one store. Every operation takes the
/// [`RequestContext`] of the request it belongs to.
#[derive(Debug)]
pub struct Engine {
    client: EsClient,
    cfg: EngineConfig,
    requests: RequestManager,
}

impl Engine {
    pub fn new(cfg: EngineConfig) -> Result<Self> {
        let client = EsClient::new(&cfg.client)?;
        Ok(Self {
            client,
            cfg,
            requests: RequestManager::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn requests(&self) -> &RequestManager {
        &self.requests
    }

    pub fn timeout_for(&self, kind: RequestKind) -> Duration {
        match kind {
            RequestKind::Documents | RequestKind::Spans => self.cfg.document_timeout,
            RequestKind::FieldDiscovery => self.cfg.discovery_timeout,
            RequestKind::MetricAggregation
            | RequestKind::OperationNames
            | RequestKind::PerspectiveCounts
            | RequestKind::AutoRange
            | RequestKind::Maintenance => self.cfg.aggregation_timeout,
        }
    }

    /// Start a request of `kind` with its configured timeout, superseding
    /// the previous one.
    pub fn start(&self, kind: RequestKind) -> (RequestContext, Completion) {
        self.requests.start(kind, self.timeout_for(kind))
    }

    pub fn shutdown(&self) {
        self.requests.shutdown();
    }

    pub fn index_for(&self, signal: Signal) -> &str {
        match signal {
            Signal::Logs => &self.cfg.logs_index,
            Signal::Traces => &self.cfg.traces_index,
            Signal::Metrics => &self.cfg.metrics_index,
        }
    }

    /// Turn empty-state store errors into an empty successful result.
    pub fn absorb_empty<T: Default>(result: Result<T>) -> Result<T> {
        match result {
            Err(err) => match classify(&err) {
                Classification::EmptyState(state) => {
                    debug!(?state, "store reported an empty state; returning no results");
                    Ok(T::default())
                }
                Classification::Genuine => Err(err),
            },
            ok => ok,
        }
    }

    pub async fn tail(&self, ctx: &RequestContext, opts: &QueryOptions) -> Result<DocumentPage> {
        let filters = opts.filters(&self.cfg.fields);
        Self::absorb_empty(self.documents(ctx, opts.signal, &filters, opts.limit).await)
    }

    pub async fn search(
        &self,
        ctx: &RequestContext,
        text: &str,
        opts: &QueryOptions,
    ) -> Result<DocumentPage> {
        let mut filters = opts.filters(&self.cfg.fields);
        filters.extend(FilterBuilder::new(&self.cfg.fields).add_text(text, &[]).build());
        Self::absorb_empty(self.documents(ctx, opts.signal, &filters, opts.limit).await)
    }

    async fn documents(
        &self,
        ctx: &RequestContext,
        signal: Signal,
        filters: &FilterSet,
        limit: usize,
    ) -> Result<DocumentPage> {
        let index = self.index_for(signal);
        let known = self.known_fields(ctx, index, referenced_fields(filters)).await?;
        let renderer = Renderer::new(&self.cfg.fields).with_known_fields(&known);
        let condition = renderer.condition(filters);
        let ts = renderer.field(&self.cfg.fields.timestamp);

        let rows = Statement::from_source_with_metadata(index, &["_index", "_id"])
            .where_clause(condition.clone())
            .sort(&format!("{ts} DESC"))
            .limit(limit);
        let count = Statement::from_source(index)
            .where_clause(condition)
            .stats("total = COUNT(*)", None);

        let query = rows.render();
        let count_query = count.render();
        debug!(kind = %ctx.kind(), %query, "rendered piped statement");

        let (rows, count) = tokio::try_join!(
            self.client.esql(ctx, &query),
            self.client.esql(ctx, &count_query)
        )?;

        let columns = rows.column_names();
        let records = rows
            .values
            .into_iter()
            .map(|row| normalize_row(&columns, row))
            .collect();
        Ok(DocumentPage {
            records,
            total: count.single_count(),
            query,
        })
    }

    /// Count documents matching `opts` without fetching them.
    pub async fn count(&self, ctx: &RequestContext, opts: &QueryOptions) -> Result<u64> {
        let filters = opts.filters(&self.cfg.fields);
        Self::absorb_empty(self.count_inner(ctx, opts.signal, &filters).await)
    }

    async fn count_inner(
        &self,
        ctx: &RequestContext,
        signal: Signal,
        filters: &FilterSet,
    ) -> Result<u64> {
        let index = self.index_for(signal);
        let known = self.known_fields(ctx, index, referenced_fields(filters)).await?;
        let renderer = Renderer::new(&self.cfg.fields).with_known_fields(&known);
        let statement = Statement::from_source(index)
            .where_clause(renderer.condition(filters))
            .stats("total = COUNT(*)", None)
            .render();
        debug!(kind = %ctx.kind(), query = %statement, "rendered count statement");
        Ok(self.client.esql(ctx, &statement).await?.single_count())
    }

    pub async fn aggregate_metrics(
        &self,
        ctx: &RequestContext,
        opts: &QueryOptions,
    ) -> Result<Vec<MetricSeries>> {
        Self::absorb_empty(self.metric_series(ctx, opts).await)
    }

    async fn metric_series(
        &self,
        ctx: &RequestContext,
        opts: &QueryOptions,
    ) -> Result<Vec<MetricSeries>> {
        let index = self.cfg.metrics_index.as_str();
        let fields = self.field_infos(ctx, index).await?;
        let mut selected = select_metric_fields(fields, &self.cfg.fields);
        if selected.is_empty() {
            return Ok(Vec::new());
        }
        if selected.len() > self.cfg.max_aggregation_fields {
            warn!(
                found = selected.len(),
                max = self.cfg.max_aggregation_fields,
                "too many metric fields; aggregating the first ones only"
            );
            selected.truncate(self.cfg.max_aggregation_fields);
        }

        let filters = opts.filters(&self.cfg.fields);
        let interval = dsl::histogram_interval(range_span(&opts.range, Utc::now()));
        let body = dsl::metrics_body(
            dsl::render_bool(&filters),
            &self.cfg.fields.timestamp,
            &selected,
            interval,
        );
        debug!(kind = %ctx.kind(), %body, "rendered metrics aggregation");

        let resp = self.client.search(ctx, index, &body).await?;
        parse_metric_series(&resp, &selected)
    }

    pub async fn list_operation_names(
        &self,
        ctx: &RequestContext,
        opts: &QueryOptions,
    ) -> Result<Vec<OperationStats>> {
        Self::absorb_empty(self.operation_stats(ctx, opts).await)
    }

    async fn operation_stats(
        &self,
        ctx: &RequestContext,
        opts: &QueryOptions,
    ) -> Result<Vec<OperationStats>> {
        let conventions = &self.cfg.fields;
        let index = self.cfg.traces_index.as_str();
        let filters = opts.filters(conventions);

        let mut wanted = referenced_fields(&filters);
        wanted.extend(conventions.operation.iter().cloned());
        wanted.push(conventions.duration.clone());
        let known = self.known_fields(ctx, index, wanted).await?;

        let Some(op_field) = conventions.operation.iter().find(|f| known.contains(*f)) else {
            debug!("no operation name field in trace indices");
            return Ok(Vec::new());
        };

        let renderer = Renderer::new(conventions).with_known_fields(&known);
        let op = renderer.field(op_field);
        let mut columns = vec![op.clone(), "count".to_string()];
        let aggregates = if known.contains(&conventions.duration) {
            let duration = renderer.field(&conventions.duration);
            columns.extend(["avg_duration".to_string(), "p95_duration".to_string()]);
            format!(
                "count = COUNT(*), avg_duration = AVG({duration}), \
                 p95_duration = PERCENTILE({duration}, 95)"
            )
        } else {
            "count = COUNT(*)".to_string()
        };

        let statement = Statement::from_source(index)
            .where_clause(renderer.condition(&filters))
            .where_clause(Some(format!("{op} IS NOT NULL")))
            .stats(&aggregates, Some(&op))
            .sort("count DESC")
            .limit(opts.limit)
            .keep(&columns)
            .render();
        debug!(kind = %ctx.kind(), query = %statement, "rendered operation statement");

        let resp = self.client.esql(ctx, &statement).await?;
        let name_col = resp.column_index(op_field);
        let count_col = resp.column_index("count");
        let avg_col = resp.column_index("avg_duration");
        let p95_col = resp.column_index("p95_duration");

        let cell = |row: &[Value], col: Option<usize>| col.and_then(|c| row.get(c)).cloned();
        let millis = |row: &[Value], col| cell(row, col).and_then(|v| v.as_f64()).map(nanos_to_ms);
        Ok(resp
            .values
            .iter()
            .filter_map(|row| {
                let name = cell(row, name_col)?.as_str()?.to_string();
                Some(OperationStats {
                    name,
                    count: cell(row, count_col).and_then(|v| v.as_u64()).unwrap_or(0),
                    avg_duration_ms: millis(row, avg_col),
                    p95_duration_ms: millis(row, p95_col),
                })
            })
            .collect())
    }

    /// Every span of a trace, oldest first.
    pub async fn spans_for_trace(
        &self,
        ctx: &RequestContext,
        trace_id: &TraceId,
    ) -> Result<Vec<Record>> {
        let filters = FilterBuilder::new(&self.cfg.fields)
            .add_trace_id(trace_id.as_str())
            .build();
        let body = dsl::trace_body(
            dsl::render_bool(&filters),
            &self.cfg.fields.timestamp,
            MAX_TRACE_SPANS,
        );
        debug!(kind = %ctx.kind(), %body, trace_id = %trace_id, "rendered trace query");

        let result = self.client.search(ctx, &self.cfg.traces_index, &body).await;
        match Self::absorb_empty(result.map(Some))? {
            Some(resp) => hits(&resp),
            None => Ok(Vec::new()),
        }
    }

    pub async fn perspective_counts(
        &self,
        ctx: &RequestContext,
        perspective: &Perspective,
        opts: &QueryOptions,
    ) -> Result<Vec<PerspectiveCount>> {
        Self::absorb_empty(self.perspective_inner(ctx, perspective, opts).await)
    }

    async fn perspective_inner(
        &self,
        ctx: &RequestContext,
        perspective: &Perspective,
        opts: &QueryOptions,
    ) -> Result<Vec<PerspectiveCount>> {
        let conventions = &self.cfg.fields;
        let (fields, own_kind) = match perspective {
            Perspective::Services => (conventions.service.clone(), Some(IntentKind::Service)),
            Perspective::Environments => {
                (conventions.environment.clone(), Some(IntentKind::Resource))
            }
            Perspective::Field(field) => (vec![field.clone()], None),
        };

        // The perspective's own filter would hide every other value.
        let mut filters = opts.filters(conventions);
        if let Some(kind) = own_kind {
            filters.intents.retain(|intent| intent.kind != kind);
        }

        let body = dsl::terms_body(dsl::render_bool(&filters), &fields, opts.limit);
        debug!(kind = %ctx.kind(), %body, "rendered perspective aggregation");
        let resp = self.client.search(ctx, self.index_for(opts.signal), &body).await?;

        let mut merged = BTreeMap::<String, u64>::new();
        for idx in 0..fields.len() {
            let pointer = format!("/aggregations/{}{idx}/buckets", dsl::TERMS_AGG_PREFIX);
            for bucket in array_at(&resp, &pointer)? {
                let value = bucket
                    .get("key_as_string")
                    .or_else(|| bucket.get("key"))
                    .map(|key| match key {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .unwrap_or_default();
                let count = bucket["doc_count"].as_u64().unwrap_or(0);
                *merged.entry(value).or_default() += count;
            }
        }

        let mut counts = merged
            .into_iter()
            .map(|(value, count)| PerspectiveCount { value, count })
            .collect::<Vec<_>>();
        counts.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
        counts.truncate(opts.limit);
        Ok(counts)
    }

    pub async fn discover_fields(
        &self,
        ctx: &RequestContext,
        signal: Signal,
    ) -> Result<Vec<FieldInfo>> {
        Self::absorb_empty(self.field_infos(ctx, self.index_for(signal)).await)
    }

    async fn field_infos(&self, ctx: &RequestContext, index: &str) -> Result<Vec<FieldInfo>> {
        let caps = self.client.field_caps(ctx, index, "*").await?;
        parse_field_caps(&caps)
    }

    /// Subset of `fields` mapped in `index`.
    async fn known_fields(
        &self,
        ctx: &RequestContext,
        index: &str,
        mut fields: Vec<String>,
    ) -> Result<HashSet<String>> {
        fields.sort();
        fields.dedup();
        if fields.is_empty() {
            return Ok(HashSet::new());
        }
        let caps = self.client.field_caps(ctx, index, &fields.join(",")).await?;
        Ok(object_at(&caps, "/fields")?.keys().cloned().collect())
    }

    /// Pick the narrowest lookback holding enough documents.
    pub async fn detect_lookback(
        &self,
        ctx: &RequestContext,
        opts: &QueryOptions,
    ) -> Result<DetectedRange> {
        let counter = WindowCounter {
            engine: self,
            ctx,
            opts,
        };
        autorange::detect(&counter, &lookback_candidates(), self.cfg.auto_range_threshold).await
    }

    pub async fn ping(&self, ctx: &RequestContext) -> Result<ClusterInfo> {
        debug!(url = self.client.base_url(), "pinging store");
        let info = self.client.info(ctx).await?;
        let version = info
            .pointer("/version/number")
            .and_then(Value::as_str)
            .ok_or_else(|| decode_error("/version/number", "a string"))?;
        let text = |v: &Value| v.as_str().unwrap_or_default().to_string();
        Ok(ClusterInfo {
            name: text(&info["name"]),
            cluster_name: text(&info["cluster_name"]),
            version: version.to_string(),
        })
    }

    /// Delete every document of `signal`. Returns the number deleted.
    pub async fn clear(&self, ctx: &RequestContext, signal: Signal) -> Result<u64> {
        let index = self.index_for(signal);
        let body = json!({"query": {"match_all": {}}});
        let result = self.client.delete_by_query(ctx, index, &body).await;
        let deleted = match Self::absorb_empty(result.map(Some))? {
            Some(resp) => resp
                .get("deleted")
                .and_then(Value::as_u64)
                .ok_or_else(|| decode_error("/deleted", "a count"))?,
            None => 0,
        };
        debug!(index, deleted, "cleared signal");
        Ok(deleted)
    }
}

struct WindowCounter<'a> {
    engine: &'a Engine,
    ctx: &'a RequestContext,
    opts: &'a QueryOptions,
}

impl RangeCounter for WindowCounter<'_> {
    fn count(&self, lookback: &Lookback) -> impl Future<Output = Result<u64>> + Send {
        let opts = self
            .opts
            .clone()
            .with_range(TimeRange::Lookback(lookback.clone()));
        let engine = self.engine;
        let ctx = self.ctx;
        async move { engine.count(ctx, &opts).await }
    }
}

fn referenced_fields(filters: &FilterSet) -> Vec<String> {
    filters
        .intents
        .iter()
        .flat_map(|intent| intent.fields.iter().cloned())
        .collect()
}

fn nanos_to_ms(nanos: f64) -> f64 {
    nanos / 1_000_000.0
}

fn decode_error(pointer: &str, expected: &str) -> OtqError {
    OtqError::Decode(format!("expected {expected} at `{pointer}` in store response"))
}

fn array_at<'a>(resp: &'a Value, pointer: &str) -> Result<&'a Vec<Value>> {
    resp.pointer(pointer)
        .and_then(Value::as_array)
        .ok_or_else(|| decode_error(pointer, "an array"))
}

fn object_at<'a>(resp: &'a Value, pointer: &str) -> Result<&'a Map<String, Value>> {
    resp.pointer(pointer)
        .and_then(Value::as_object)
        .ok_or_else(|| decode_error(pointer, "an object"))
}

fn hits(resp: &Value) -> Result<Vec<Record>> {
    let hits = array_at(resp, "/hits/hits")?;
    Ok(hits.iter().cloned().map(normalize_hit).collect())
}

fn range_span(range: &TimeRange, now: DateTime<Utc>) -> chrono::Duration {
    let unbounded = chrono::Duration::days(UNBOUNDED_SPAN_DAYS);
    match range {
        TimeRange::Lookback(lookback) => lookback
            .since(now)
            .map(|since| now - since)
            .unwrap_or(unbounded),
        TimeRange::Absolute { from, to } => {
            let to = to.unwrap_or(now);
            from.map(|from| to - from).unwrap_or(unbounded)
        }
    }
}

/// Field caps response into field descriptions, sorted by name. Internal
/// (`_`-prefixed) fields and object containers are skipped; when a field is
/// mapped with several types the first mapped one is reported.
pub fn parse_field_caps(caps: &Value) -> Result<Vec<FieldInfo>> {
    let mut out = object_at(caps, "/fields")?
        .iter()
        .filter(|(name, _)| !name.starts_with('_'))
        .filter_map(|(name, types)| {
            let (ty, caps) = types
                .as_object()?
                .iter()
                .find(|(ty, _)| ty.as_str() != "unmapped")?;
            if matches!(ty.as_str(), "object" | "nested") {
                return None;
            }
            Some(FieldInfo {
                name: name.clone(),
                ty: ty.clone(),
                aggregatable: caps["aggregatable"].as_bool().unwrap_or(false),
                searchable: caps["searchable"].as_bool().unwrap_or(false),
                time_series_metric: caps["time_series_metric"].as_str().map(str::to_string),
                time_series_dimension: caps["time_series_dimension"].as_bool().unwrap_or(false),
            })
        })
        .collect::<Vec<_>>();
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

/// Numeric and histogram fields worth charting. When the mapping marks
/// time-series metrics, only those are used.
fn select_metric_fields(fields: Vec<FieldInfo>, conventions: &FieldConventions) -> Vec<FieldInfo> {
    let candidates = fields
        .into_iter()
        .filter(|f| f.aggregatable || f.is_histogram())
        .filter(|f| f.is_numeric() || f.is_histogram())
        .filter(|f| !f.time_series_dimension && f.name != conventions.timestamp)
        .collect::<Vec<_>>();

    if candidates.iter().any(|f| f.time_series_metric.is_some()) {
        candidates
            .into_iter()
            .filter(|f| f.time_series_metric.is_some())
            .collect()
    } else {
        candidates
    }
}

fn parse_metric_series(resp: &Value, fields: &[FieldInfo]) -> Result<Vec<MetricSeries>> {
    let buckets = array_at(resp, "/aggregations/over_time/buckets")?;

    let sample = buckets
        .iter()
        .rev()
        .find_map(|bucket| bucket["sample"]["hits"]["hits"].get(0).cloned())
        .map(normalize_hit);

    let series = fields
        .iter()
        .enumerate()
        .filter_map(|(idx, field)| {
            let agg = format!("{}{idx}", dsl::METRIC_AGG_PREFIX);
            let points = buckets
                .iter()
                .filter_map(|bucket| {
                    let timestamp = DateTime::from_timestamp_millis(bucket["key"].as_i64()?)?;
                    let value = if field.is_histogram() {
                        bucket[&agg]["values"]
                            .as_object()
                            .and_then(|values| values.values().next())
                            .and_then(Value::as_f64)
                    } else {
                        bucket[&agg]["value"].as_f64()
                    };
                    Some(MetricPoint { timestamp, value })
                })
                .collect::<Vec<_>>();

            let values = points.iter().filter_map(|p| p.value).collect::<Vec<_>>();
            if values.is_empty() {
                return None;
            }
            Some(MetricSeries {
                field: field.name.clone(),
                stat: (if field.is_histogram() { "p95" } else { "avg" }).to_string(),
                latest: values.last().copied(),
                min: values.iter().copied().reduce(f64::min),
                max: values.iter().copied().reduce(f64::max),
                points,
                sample: sample.clone(),
            })
        })
        .collect::<Vec<_>>();
    Ok(series)
}
