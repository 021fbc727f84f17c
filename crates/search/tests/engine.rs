use std::time::Duration;

use anyhow::Result;
use otq_core::config::Config;
use otq_core::ids::TraceId;
use otq_core::query::{QueryOptions, Signal};
use otq_core::time::Lookback;
use otq_core::OtqError;
use otq_search::{Engine, EngineConfig, Perspective, RequestKind};
use serde_json::json;
use testkit::{FakeStore, Reply, RunningStore};

const TRACE: &str = "4bf92f3577b34da6a3ce929d0e0e4736";

fn engine_for(store: &RunningStore, tweak: impl FnOnce(&mut Config)) -> Result<Engine> {
    let mut cfg = Config {
        url: store.url(),
        ..Config::default()
    };
    tweak(&mut cfg);
    Ok(Engine::new(EngineConfig::from(&cfg))?)
}

#[tokio::test]
async fn tail_renders_statements_and_normalizes_rows() -> Result<()> {
    let fake = FakeStore::new()
        .on_esql("COUNT(*)", Reply::ok(testkit::esql_count(42)))
        .on_esql("METADATA _index, _id", Reply::ok(testkit::sample_log_rows()));
    let store = fake.spawn()?;
    let engine = engine_for(&store, |_| {})?;

    let opts = QueryOptions {
        level: Some("error".into()),
        ..QueryOptions::default()
    };
    let (ctx, done) = engine.start(RequestKind::Documents);
    let page = engine.tail(&ctx, &opts).await?;
    done.complete();

    assert_eq!(page.total, 42);
    assert_eq!(page.records.len(), 3);
    assert!(page.query.starts_with("FROM logs-* METADATA _index, _id\n| WHERE "));
    assert!(page.query.ends_with("| SORT @timestamp DESC\n| LIMIT 100"));

    let first = &page.records[0];
    assert_eq!(first.service_name, "checkout");
    assert_eq!(first.level, "ERROR");
    assert_eq!(first.display_message(), "payment declined");
    assert_eq!(first.index, "logs-otel");
    assert_eq!(first.id, "1");

    let ecs = &page.records[1];
    assert_eq!(ecs.service_name, "frontend");
    assert_eq!(ecs.level, "WARN");
    assert_eq!(ecs.display_message(), "slow render");

    let statements = fake.statements();
    assert_eq!(statements.len(), 2);
    // No field caps configured: every level spelling was pruned.
    assert!(statements.iter().all(|s| s.contains("@timestamp >= NOW() - 1 hour AND false")));
    Ok(())
}

#[tokio::test]
async fn known_fields_keep_present_spellings_only() -> Result<()> {
    let fake = FakeStore::new().with_field_caps(testkit::field_caps(&[
        ("@timestamp", "date"),
        ("service.name", "keyword"),
        ("message", "text"),
    ]));
    let store = fake.spawn()?;
    let engine = engine_for(&store, |_| {})?;

    let opts = QueryOptions {
        services: vec!["api".into()],
        ..QueryOptions::default()
    };
    let (ctx, _done) = engine.start(RequestKind::Documents);
    let page = engine.search(&ctx, "timeout", &opts).await?;

    assert!(page.records.is_empty());
    assert!(page.query.contains("service.name == \"api\""));
    assert!(!page.query.contains("resource.attributes.service.name"));
    assert!(page.query.contains("message LIKE \"*timeout*\""));
    assert!(!page.query.contains("body.text"));
    Ok(())
}

#[tokio::test]
async fn unknown_index_is_an_empty_page() -> Result<()> {
    let fake = FakeStore::new().on_esql(
        "FROM logs-*",
        Reply::error(400, testkit::unknown_index_error("logs-*")),
    );
    let store = fake.spawn()?;
    let engine = engine_for(&store, |_| {})?;

    let (ctx, _done) = engine.start(RequestKind::Documents);
    let page = engine.tail(&ctx, &QueryOptions::default()).await?;
    assert!(page.records.is_empty());
    assert_eq!(page.total, 0);
    Ok(())
}

#[tokio::test]
async fn genuine_errors_surface() -> Result<()> {
    let fake = FakeStore::new().on_esql(
        "FROM logs-*",
        Reply::error(
            400,
            json!({"error": {"type": "parsing_exception", "reason": "line 1:1: mismatched input"}}),
        ),
    );
    let store = fake.spawn()?;
    let engine = engine_for(&store, |_| {})?;

    let (ctx, _done) = engine.start(RequestKind::Documents);
    let err = engine.tail(&ctx, &QueryOptions::default()).await.unwrap_err();
    match err {
        OtqError::Backend { status, body } => {
            assert_eq!(status, 400);
            assert!(body.contains("mismatched input"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn malformed_piped_response_is_a_decode_error() -> Result<()> {
    let fake = FakeStore::new().on_esql("FROM", Reply::ok(json!({"unexpected": "shape"})));
    let store = fake.spawn()?;
    let engine = engine_for(&store, |_| {})?;

    let (ctx, _done) = engine.start(RequestKind::Documents);
    let err = engine.tail(&ctx, &QueryOptions::default()).await.unwrap_err();
    assert!(matches!(err, OtqError::Decode(_)), "got {err:?}");

    let (ctx, _done) = engine.start(RequestKind::AutoRange);
    let err = engine.count(&ctx, &QueryOptions::default()).await.unwrap_err();
    assert!(matches!(err, OtqError::Decode(_)), "got {err:?}");
    Ok(())
}

#[tokio::test]
async fn malformed_search_response_is_a_decode_error() -> Result<()> {
    let shape = Reply::ok(json!({"unexpected": "shape"}));
    let fake = FakeStore::new().on_search("\"query\"", shape);
    let store = fake.spawn()?;
    let engine = engine_for(&store, |_| {})?;

    let (ctx, _done) = engine.start(RequestKind::Spans);
    let err = engine
        .spans_for_trace(&ctx, &TraceId::parse(TRACE)?)
        .await
        .unwrap_err();
    assert!(matches!(err, OtqError::Decode(_)), "got {err:?}");

    let (ctx, _done) = engine.start(RequestKind::PerspectiveCounts);
    let err = engine
        .perspective_counts(&ctx, &Perspective::Services, &QueryOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, OtqError::Decode(_)), "got {err:?}");
    Ok(())
}

#[tokio::test]
async fn malformed_field_caps_is_a_decode_error() -> Result<()> {
    let fake = FakeStore::new().with_field_caps(json!({"indices": []}));
    let store = fake.spawn()?;
    let engine = engine_for(&store, |_| {})?;

    let (ctx, _done) = engine.start(RequestKind::FieldDiscovery);
    let err = engine.discover_fields(&ctx, Signal::Logs).await.unwrap_err();
    assert!(matches!(err, OtqError::Decode(_)), "got {err:?}");

    let (ctx, _done) = engine.start(RequestKind::MetricAggregation);
    let opts = QueryOptions {
        signal: Signal::Metrics,
        ..QueryOptions::default()
    };
    let err = engine.aggregate_metrics(&ctx, &opts).await.unwrap_err();
    assert!(matches!(err, OtqError::Decode(_)), "got {err:?}");
    Ok(())
}

#[tokio::test]
async fn ping_without_version_is_a_decode_error() -> Result<()> {
    let fake = FakeStore::new().with_info(json!({"name": "node", "tagline": "hello"}));
    let store = fake.spawn()?;
    let engine = engine_for(&store, |_| {})?;

    let (ctx, _done) = engine.start(RequestKind::Maintenance);
    let err = engine.ping(&ctx).await.unwrap_err();
    assert!(matches!(err, OtqError::Decode(_)), "got {err:?}");
    Ok(())
}

#[tokio::test]
async fn slow_store_times_out() -> Result<()> {
    let fake = FakeStore::new().with_delay(Duration::from_millis(500));
    let store = fake.spawn()?;
    let engine = engine_for(&store, |cfg| cfg.document_timeout = Duration::from_millis(50))?;

    let (ctx, _done) = engine.start(RequestKind::Documents);
    let err = engine.tail(&ctx, &QueryOptions::default()).await.unwrap_err();
    assert!(matches!(err, OtqError::Timeout(_)), "got {err:?}");
    Ok(())
}

#[tokio::test]
async fn newer_request_cancels_older_one() -> Result<()> {
    let fake = FakeStore::new().with_delay(Duration::from_millis(300));
    let store = fake.spawn()?;
    let engine = engine_for(&store, |_| {})?;

    let (first, _first_done) = engine.start(RequestKind::Documents);
    let (second, _second_done) = engine.start(RequestKind::Documents);
    assert!(first.token().is_cancelled());
    assert!(!second.token().is_cancelled());

    let err = engine.tail(&first, &QueryOptions::default()).await.unwrap_err();
    assert!(err.is_cancelled());
    Ok(())
}

#[tokio::test]
async fn spans_for_trace_are_normalized() -> Result<()> {
    let fake = FakeStore::new().on_search(TRACE, Reply::ok(testkit::sample_trace_hits(TRACE)));
    let store = fake.spawn()?;
    let engine = engine_for(&store, |_| {})?;

    let trace_id = TraceId::parse(&TRACE.to_uppercase())?;
    let (ctx, _done) = engine.start(RequestKind::Spans);
    let spans = engine.spans_for_trace(&ctx, &trace_id).await?;

    assert_eq!(spans.len(), 2);
    assert_eq!(spans[0].name.as_deref(), Some("GET /v1/orders"));
    assert_eq!(spans[0].duration_nanos, Some(1_800_000_000));
    assert_eq!(spans[0].status_code().as_deref(), Some("Error"));
    assert_eq!(spans[1].parent_span_id.as_deref(), Some("aaaaaaaaaaaaaaaa"));
    assert_eq!(spans[1].service_name, "api");

    let requests = fake.requests();
    let search = requests
        .iter()
        .find(|r| r.path == "/traces-*/_search")
        .expect("trace search sent");
    assert_eq!(search.body["size"], 5_000);
    Ok(())
}

#[tokio::test]
async fn spans_for_missing_trace_index_is_empty() -> Result<()> {
    let fake = FakeStore::new().on_search(
        "traces-*",
        Reply::error(
            404,
            json!({"error": {
                "type": "index_not_found_exception",
                "reason": "no such index [traces-*]"
            }}),
        ),
    );
    let store = fake.spawn()?;
    let engine = engine_for(&store, |_| {})?;

    let (ctx, _done) = engine.start(RequestKind::Spans);
    let spans = engine.spans_for_trace(&ctx, &TraceId::parse(TRACE)?).await?;
    assert!(spans.is_empty());
    Ok(())
}

#[tokio::test]
async fn perspective_merges_spellings_and_drops_own_filter() -> Result<()> {
    let fake = FakeStore::new().on_search(
        "\"f0\"",
        Reply::ok(json!({
            "hits": {"total": {"value": 17}, "hits": []},
            "aggregations": {
                "f0": {"buckets": [
                    {"key": "api", "doc_count": 5},
                    {"key": "web", "doc_count": 2}
                ]},
                "f1": {"buckets": [
                    {"key": "api", "doc_count": 3},
                    {"key": "worker", "doc_count": 7}
                ]}
            }
        })),
    );
    let store = fake.spawn()?;
    let engine = engine_for(&store, |_| {})?;

    let opts = QueryOptions {
        services: vec!["api".into()],
        ..QueryOptions::default()
    };
    let (ctx, _done) = engine.start(RequestKind::PerspectiveCounts);
    let counts = engine
        .perspective_counts(&ctx, &Perspective::Services, &opts)
        .await?;

    let pairs = counts
        .iter()
        .map(|c| (c.value.as_str(), c.count))
        .collect::<Vec<_>>();
    assert_eq!(pairs, vec![("api", 8), ("worker", 7), ("web", 2)]);

    let sent = fake.requests();
    let body = sent[0].body.to_string();
    assert!(!body.contains("\"api\""), "own filter leaked: {body}");
    Ok(())
}

#[tokio::test]
async fn metrics_aggregate_over_time() -> Result<()> {
    let t0 = testkit::base_time().timestamp_millis();
    let fake = FakeStore::new()
        .with_field_caps(testkit::field_caps(&[
            ("@timestamp", "date"),
            ("metrics.cpu", "double"),
            ("host.name", "keyword"),
        ]))
        .on_search(
            "over_time",
            Reply::ok(json!({
                "hits": {"total": {"value": 2}, "hits": []},
                "aggregations": {"over_time": {"buckets": [
                    {"key": t0, "doc_count": 1, "m0": {"value": 0.25},
                     "sample": {"hits": {"hits": []}}},
                    {"key": t0 + 60_000, "doc_count": 1, "m0": {"value": 0.75},
                     "sample": {"hits": {"hits": [
                         {"_id": "x", "_source": {"service.name": "api"}}
                     ]}}}
                ]}}
            })),
        );
    let store = fake.spawn()?;
    let engine = engine_for(&store, |_| {})?;

    let opts = QueryOptions {
        signal: Signal::Metrics,
        ..QueryOptions::default()
    };
    let (ctx, _done) = engine.start(RequestKind::MetricAggregation);
    let series = engine.aggregate_metrics(&ctx, &opts).await?;

    assert_eq!(series.len(), 1);
    assert_eq!(series[0].field, "metrics.cpu");
    assert_eq!(series[0].latest, Some(0.75));
    assert_eq!(series[0].min, Some(0.25));
    assert_eq!(series[0].sample.as_ref().map(|r| r.service_name.as_str()), Some("api"));
    Ok(())
}

#[tokio::test]
async fn operation_stats_keep_summary_columns() -> Result<()> {
    let rows = testkit::esql_response(
        &[
            ("count", "long"),
            ("avg_duration", "double"),
            ("p95_duration", "double"),
            ("name", "keyword"),
        ],
        vec![
            vec![json!(4), json!(2_000_000.0), json!(5_000_000.0), json!("GET /")],
            vec![json!(1), json!(null), json!(null), json!("cache.get")],
        ],
    );
    let fake = FakeStore::new()
        .with_field_caps(testkit::field_caps(&[
            ("@timestamp", "date"),
            ("name", "keyword"),
            ("duration", "long"),
        ]))
        .on_esql("STATS", Reply::ok(rows));
    let store = fake.spawn()?;
    let engine = engine_for(&store, |_| {})?;

    let opts = QueryOptions {
        signal: Signal::Traces,
        ..QueryOptions::default()
    };
    let (ctx, _done) = engine.start(RequestKind::OperationNames);
    let ops = engine.list_operation_names(&ctx, &opts).await?;

    assert_eq!(ops.len(), 2);
    assert_eq!(ops[0].name, "GET /");
    assert_eq!(ops[0].count, 4);
    assert_eq!(ops[0].avg_duration_ms, Some(2.0));
    assert_eq!(ops[0].p95_duration_ms, Some(5.0));
    assert_eq!(ops[1].avg_duration_ms, None);

    let statements = fake.statements();
    let statement = statements.last().expect("operation statement sent");
    assert!(statement.starts_with("FROM traces-*\n"));
    assert!(statement.contains("PERCENTILE(duration, 95) BY name"));
    assert!(statement.ends_with(
        "| SORT count DESC\n| LIMIT 100\n| KEEP name, count, avg_duration, p95_duration"
    ));
    Ok(())
}

#[tokio::test]
async fn discover_fields_lists_mapped_fields() -> Result<()> {
    let fake = FakeStore::new().with_field_caps(testkit::field_caps(&[
        ("service.name", "keyword"),
        ("metrics.cpu", "double"),
        ("@timestamp", "date"),
    ]));
    let store = fake.spawn()?;
    let engine = engine_for(&store, |_| {})?;

    let (ctx, _done) = engine.start(RequestKind::FieldDiscovery);
    let fields = engine.discover_fields(&ctx, Signal::Logs).await?;
    let names = fields.iter().map(|f| f.name.as_str()).collect::<Vec<_>>();
    assert_eq!(names, vec!["@timestamp", "metrics.cpu", "service.name"]);
    assert!(fields[1].is_numeric());
    Ok(())
}

#[tokio::test]
async fn detect_lookback_stops_at_threshold() -> Result<()> {
    let fake = FakeStore::new()
        .on_esql("NOW() - 5 minutes", Reply::ok(testkit::esql_count(10)))
        .on_esql("NOW() - 15 minutes", Reply::ok(testkit::esql_count(20)))
        .on_esql("NOW() - 1 hour", Reply::ok(testkit::esql_count(12_000)));
    let store = fake.spawn()?;
    let engine = engine_for(&store, |_| {})?;

    let (ctx, _done) = engine.start(RequestKind::AutoRange);
    let detected = engine.detect_lookback(&ctx, &QueryOptions::default()).await?;

    assert_eq!(detected.lookback, Lookback::hours(1));
    assert_eq!(detected.count, 12_000);
    assert_eq!(fake.statements().len(), 3);
    Ok(())
}

#[tokio::test]
async fn ping_and_clear() -> Result<()> {
    let fake = FakeStore::new().with_deleted(7);
    let store = fake.spawn()?;
    let engine = engine_for(&store, |_| {})?;

    let (ctx, _done) = engine.start(RequestKind::Maintenance);
    let info = engine.ping(&ctx).await?;
    assert_eq!(info.cluster_name, "fake-cluster");
    assert_eq!(info.version, "8.17.0");

    let deleted = engine.clear(&ctx, Signal::Traces).await?;
    assert_eq!(deleted, 7);
    assert!(
        fake.requests()
            .iter()
            .any(|r| r.path == "/traces-*/_delete_by_query")
    );
    Ok(())
}
