//! Test fixtures: raw documents in the shapes real shippers write, and a
//! fake Elasticsearch-compatible store serving canned responses.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Context;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Value, json};
use tokio::sync::oneshot;

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap()
}

fn ts(offset_ms: i64) -> String {
    (base_time() + chrono::Duration::milliseconds(offset_ms))
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// An OTel-native log document (`logs-*.otel-*` mapping).
pub fn otel_log(offset_ms: i64, service: &str, severity: &str, body: &str) -> Value {
    json!({
        "@timestamp": ts(offset_ms),
        "resource": {"attributes": {
            "service.name": service,
            "deployment.environment": "prod",
            "container.id": "c0ffee1234"
        }},
        "severity_text": severity,
        "body": {"text": body},
        "attributes": {"http.method": "GET"},
        "scope": {"name": "app"}
    })
}

/// An ECS-shaped log document.
pub fn ecs_log(offset_ms: i64, service: &str, level: &str, message: &str) -> Value {
    json!({
        "@timestamp": ts(offset_ms),
        "service": {"name": service, "environment": "staging"},
        "log": {"level": level},
        "message": message,
        "labels": {"team": "payments"}
    })
}

/// Search hits for a two-span trace: a server span and a slow cache call.
pub fn sample_trace_hits(trace_id: &str) -> Value {
    let spans = vec![
        json!({
            "_index": ".ds-traces-generic.otel-default-2026.02.01-000001",
            "_id": "span-root",
            "_source": {
                "@timestamp": ts(0),
                "trace_id": trace_id,
                "span_id": "aaaaaaaaaaaaaaaa",
                "name": "GET /v1/orders",
                "kind": "Server",
                "duration": 1_800_000_000u64,
                "status": {"code": "Error"},
                "resource": {"attributes": {"service.name": "api"}}
            }
        }),
        json!({
            "_index": ".ds-traces-generic.otel-default-2026.02.01-000001",
            "_id": "span-child",
            "_source": {
                "@timestamp": ts(900),
                "trace_id": trace_id,
                "span_id": "bbbbbbbbbbbbbbbb",
                "parent_span_id": "aaaaaaaaaaaaaaaa",
                "name": "cache.get redis",
                "kind": "Client",
                "duration": 700_000,
                "resource": {"attributes": {"service.name": "api"}},
                "attributes": {"peer": "redis:6379"}
            }
        }),
    ];
    search_hits(spans)
}

pub fn search_hits(hits: Vec<Value>) -> Value {
    json!({
        "took": 1,
        "timed_out": false,
        "hits": {"total": {"value": hits.len(), "relation": "eq"}, "hits": hits}
    })
}

/// Column/row response for a piped query.
pub fn esql_response(columns: &[(&str, &str)], rows: Vec<Vec<Value>>) -> Value {
    let columns = columns
        .iter()
        .map(|(name, ty)| json!({"name": name, "type": ty}))
        .collect::<Vec<_>>();
    json!({"columns": columns, "values": rows})
}

pub fn esql_count(total: u64) -> Value {
    esql_response(&[("total", "long")], vec![vec![json!(total)]])
}

/// Three flattened log rows as the piped endpoint returns them.
pub fn sample_log_rows() -> Value {
    esql_response(
        &[
            ("@timestamp", "date"),
            ("_index", "keyword"),
            ("_id", "keyword"),
            ("resource.attributes.service.name", "keyword"),
            ("severity_text", "keyword"),
            ("body.text", "text"),
            ("service.name", "keyword"),
            ("log.level", "keyword"),
            ("message", "text"),
        ],
        vec![
            vec![
                json!(ts(2_000)),
                json!("logs-otel"),
                json!("1"),
                json!("checkout"),
                json!("ERROR"),
                json!("payment declined"),
                Value::Null,
                Value::Null,
                Value::Null,
            ],
            vec![
                json!(ts(1_000)),
                json!("logs-ecs"),
                json!("2"),
                Value::Null,
                Value::Null,
                Value::Null,
                json!("frontend"),
                json!("warn"),
                json!("slow render"),
            ],
            vec![
                json!(ts(0)),
                json!("logs-otel"),
                json!("3"),
                json!("checkout"),
                json!("INFO"),
                json!("order placed"),
                Value::Null,
                Value::Null,
                Value::Null,
            ],
        ],
    )
}

/// Field caps response. Each entry is `(name, type)`; names starting with
/// `metrics.` are flagged as gauges.
pub fn field_caps(fields: &[(&str, &str)]) -> Value {
    let fields = fields
        .iter()
        .map(|(name, ty)| {
            let mut caps = json!({"type": ty, "searchable": true, "aggregatable": *ty != "text"});
            if name.starts_with("metrics.") {
                caps["time_series_metric"] = json!("gauge");
            }
            let mut types = serde_json::Map::new();
            types.insert(ty.to_string(), caps);
            (name.to_string(), Value::Object(types))
        })
        .collect::<serde_json::Map<_, _>>();
    json!({"indices": ["fake-index"], "fields": fields})
}

pub fn unknown_index_error(index: &str) -> Value {
    json!({
        "error": {
            "type": "verification_exception",
            "reason": format!("Found 1 problem\nline 1:6: Unknown index [{index}]"),
            "root_cause": [{
                "type": "verification_exception",
                "reason": format!("Found 1 problem\nline 1:6: Unknown index [{index}]")
            }]
        },
        "status": 400
    })
}

#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub body: Value,
}

impl Reply {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn error(status: u16, body: Value) -> Self {
        Self { status, body }
    }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub body: Value,
}

#[derive(Debug, Default)]
struct StoreState {
    esql_rules: Vec<(String, Reply)>,
    search_rules: Vec<(String, Reply)>,
    field_caps: Option<Value>,
    info: Option<Value>,
    deleted: u64,
    delay: Option<Duration>,
    requests: Vec<RecordedRequest>,
}

/// Canned-response store. Rules are matched in insertion order by
/// substring: piped-query rules against the statement text, search rules
/// against `"<index> <body json>"`. Unmatched requests get an empty
/// result.
#[derive(Debug, Clone, Default)]
pub struct FakeStore {
    state: Arc<Mutex<StoreState>>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn on_esql(self, needle: &str, reply: Reply) -> Self {
        self.lock().esql_rules.push((needle.to_string(), reply));
        self
    }

    pub fn on_search(self, needle: &str, reply: Reply) -> Self {
        self.lock().search_rules.push((needle.to_string(), reply));
        self
    }

    pub fn with_field_caps(self, caps: Value) -> Self {
        self.lock().field_caps = Some(caps);
        self
    }

    /// Replace the cluster info document served at `/`.
    pub fn with_info(self, info: Value) -> Self {
        self.lock().info = Some(info);
        self
    }

    pub fn with_deleted(self, deleted: u64) -> Self {
        self.lock().deleted = deleted;
        self
    }

    /// Delay every response, for timeout and cancellation tests.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.lock().delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.lock().requests.clone()
    }

    /// Piped statements received so far.
    pub fn statements(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter(|r| r.path == "/_query")
            .filter_map(|r| r.body["query"].as_str().map(str::to_string))
            .collect()
    }

    fn record(&self, method: &str, path: String, body: Value) -> Option<Duration> {
        let mut state = self.lock();
        state.requests.push(RecordedRequest {
            method: method.to_string(),
            path,
            body,
        });
        state.delay
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/", get(info))
            .route("/_query", post(esql))
            .route("/{index}/_search", post(search))
            .route("/{index}/_field_caps", get(field_caps_handler))
            .route("/{index}/_delete_by_query", post(delete_by_query))
            .with_state(self.clone())
    }

    /// Serve on an ephemeral port from a dedicated thread, so blocking
    /// test code (spawning the CLI) can talk to it.
    pub fn spawn(&self) -> anyhow::Result<RunningStore> {
        let router = self.router();
        let (addr_tx, addr_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        std::thread::spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(runtime) => runtime,
                Err(err) => {
                    let _ = addr_tx.send(Err(anyhow::Error::from(err)));
                    return;
                }
            };
            runtime.block_on(async move {
                let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
                    Ok(listener) => listener,
                    Err(err) => {
                        let _ = addr_tx.send(Err(err.into()));
                        return;
                    }
                };
                let _ = addr_tx.send(listener.local_addr().map_err(anyhow::Error::from));
                let _ = axum::serve(listener, router)
                    .with_graceful_shutdown(async {
                        let _ = shutdown_rx.await;
                    })
                    .await;
            });
        });

        let addr = addr_rx.recv().context("fake store thread exited")??;
        Ok(RunningStore {
            addr,
            _shutdown: shutdown_tx,
        })
    }
}

/// Stops the fake store when dropped.
#[derive(Debug)]
pub struct RunningStore {
    addr: SocketAddr,
    _shutdown: oneshot::Sender<()>,
}

impl RunningStore {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

fn respond(reply: Reply) -> (StatusCode, Json<Value>) {
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(reply.body))
}

async fn pause(delay: Option<Duration>) {
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
}

async fn info(State(store): State<FakeStore>) -> (StatusCode, Json<Value>) {
    pause(store.record("GET", "/".to_string(), Value::Null)).await;
    let info = store.lock().info.clone().unwrap_or_else(|| {
        json!({
            "name": "fake-node",
            "cluster_name": "fake-cluster",
            "version": {"number": "8.17.0"},
            "tagline": "You Know, for Search"
        })
    });
    respond(Reply::ok(info))
}

async fn esql(
    State(store): State<FakeStore>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let query = body["query"].as_str().unwrap_or_default().to_string();
    let delay = store.record("POST", "/_query".to_string(), body);
    pause(delay).await;

    let reply = store
        .lock()
        .esql_rules
        .iter()
        .find(|(needle, _)| query.contains(needle.as_str()))
        .map(|(_, reply)| reply.clone());
    respond(reply.unwrap_or_else(|| Reply::ok(esql_response(&[], Vec::new()))))
}

async fn search(
    State(store): State<FakeStore>,
    Path(index): Path<String>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let haystack = format!("{index} {body}");
    let delay = store.record("POST", format!("/{index}/_search"), body);
    pause(delay).await;

    let reply = store
        .lock()
        .search_rules
        .iter()
        .find(|(needle, _)| haystack.contains(needle.as_str()))
        .map(|(_, reply)| reply.clone());
    respond(reply.unwrap_or_else(|| Reply::ok(search_hits(Vec::new()))))
}

async fn field_caps_handler(
    State(store): State<FakeStore>,
    Path(index): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, Json<Value>) {
    let delay = store.record("GET", format!("/{index}/_field_caps"), json!(params));
    pause(delay).await;

    let caps = store
        .lock()
        .field_caps
        .clone()
        .unwrap_or_else(|| json!({"indices": [], "fields": {}}));

    // Answer only for the requested fields, as the real endpoint does.
    let requested = params.get("fields").cloned().unwrap_or_else(|| "*".to_string());
    if requested == "*" {
        return respond(Reply::ok(caps));
    }
    let wanted = requested.split(',').collect::<Vec<_>>();
    let fields = caps["fields"]
        .as_object()
        .map(|all| {
            all.iter()
                .filter(|(name, _)| wanted.contains(&name.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<serde_json::Map<_, _>>()
        })
        .unwrap_or_default();
    respond(Reply::ok(json!({"indices": caps["indices"], "fields": fields})))
}

async fn delete_by_query(
    State(store): State<FakeStore>,
    Path(index): Path<String>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let delay = store.record("POST", format!("/{index}/_delete_by_query"), body);
    pause(delay).await;
    let deleted = store.lock().deleted;
    respond(Reply::ok(json!({"deleted": deleted, "failures": []})))
}
