mod follow;
mod output;
mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use otq_core::config::Config;
use otq_core::filter::TimeRange;
use otq_core::ids::TraceId;
use otq_core::query::{QueryOptions, Signal};
use otq_core::time::{Lookback, parse_duration_str, parse_time_or_relative};
use otq_search::{Engine, EngineConfig, Perspective, RequestKind};
use serde::Serialize;
use tracing::{debug, info};

use crate::follow::{FollowConfig, follow};
use crate::output::{
    print_cluster, print_detected, print_fields, print_metrics, print_operations, print_page,
    print_perspective, print_trace,
};
use crate::telemetry::{init_cli_tracing, shutdown_tracing};

#[derive(Parser, Debug)]
#[command(name = "otq")]
#[command(about = "Query logs, metrics and traces stored in Elasticsearch")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true)]
    json: bool,

    #[arg(long, global = true, help = "Store URL (overrides config and OTQ_URL)")]
    url: Option<String>,

    #[arg(long, global = true, help = "Print the rendered query")]
    show_query: bool,

    #[arg(long, global = true, help = "Config file (defaults to $OTQ_CONFIG)")]
    config: Option<PathBuf>,
}

#[derive(Args, Debug, Clone, Default)]
struct FilterArgs {
    #[arg(long, help = "Lookback (15m, 1h, 7d, all, auto) or start time")]
    since: Option<String>,
    #[arg(long, help = "End time (RFC3339 or duration ago)")]
    until: Option<String>,
    #[arg(long = "service")]
    services: Vec<String>,
    #[arg(long = "exclude-service")]
    exclude_services: Vec<String>,
    #[arg(long = "env")]
    environments: Vec<String>,
    #[arg(long = "exclude-env")]
    exclude_environments: Vec<String>,
    #[arg(long)]
    level: Option<String>,
    #[arg(long, help = "Container id prefix")]
    container: Option<String>,
    #[arg(long = "has-field")]
    has_fields: Vec<String>,
    #[arg(long)]
    operation: Option<String>,
    #[arg(long)]
    event_type: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Show the most recent documents")]
    Tail {
        #[command(flatten)]
        filters: FilterArgs,
        #[arg(long, default_value = "logs")]
        signal: Signal,
        #[arg(short, long, help = "Keep refreshing and print new documents")]
        follow: bool,
        #[arg(long, help = "Refresh interval for --follow (e.g. 2s)")]
        interval: Option<String>,
        #[arg(long, help = "Stop --follow after this many refreshes")]
        refreshes: Option<usize>,
    },
    #[command(about = "Search documents for text")]
    Search {
        text: String,
        #[command(flatten)]
        filters: FilterArgs,
        #[arg(long, default_value = "logs")]
        signal: Signal,
    },
    #[command(about = "Aggregate numeric metric fields over time")]
    Metrics {
        #[command(flatten)]
        filters: FilterArgs,
    },
    #[command(about = "List span operations with counts and latencies")]
    Ops {
        #[command(flatten)]
        filters: FilterArgs,
    },
    #[command(about = "Show every span of a trace")]
    Trace { trace_id: String },
    #[command(about = "Count documents per service, environment or field value")]
    Perspective {
        #[arg(help = "services, environments or a field name")]
        perspective: Perspective,
        #[command(flatten)]
        filters: FilterArgs,
        #[arg(long, default_value = "logs")]
        signal: Signal,
    },
    #[command(about = "List mapped fields")]
    Fields {
        #[arg(long, default_value = "logs")]
        signal: Signal,
    },
    #[command(about = "Find the narrowest lookback holding enough documents")]
    Detect {
        #[command(flatten)]
        filters: FilterArgs,
        #[arg(long, default_value = "logs")]
        signal: Signal,
    },
    #[command(about = "Check the store is reachable")]
    Ping,
    #[command(about = "Delete every document of a signal")]
    Clear {
        #[arg(long, default_value = "logs")]
        signal: Signal,
        #[arg(long, help = "Confirm the deletion")]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_cli_tracing();
    let result = run(cli).await;
    shutdown_tracing();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut cfg = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("load config from {}", path.display()))?,
        None => Config::load().context("load config")?,
    };
    if let Some(url) = &cli.url {
        cfg.url = url.clone();
    }
    debug!(url = %cfg.url, "using store");

    let engine = Arc::new(Engine::new(EngineConfig::from(&cfg)).context("create query engine")?);

    match cli.command {
        Commands::Tail {
            filters,
            signal,
            follow: follow_mode,
            interval,
            refreshes,
        } => {
            let opts = resolve_options(&engine, &filters, signal, &cfg).await?;
            if follow_mode {
                let interval = match interval {
                    Some(v) => parse_duration_str(&v).context("invalid --interval")?,
                    None => cfg.refresh_interval,
                };
                return follow(
                    engine,
                    opts,
                    FollowConfig {
                        interval,
                        json: cli.json,
                        show_query: cli.show_query,
                        refreshes,
                    },
                )
                .await;
            }

            let (ctx, done) = engine.start(RequestKind::Documents);
            let page = engine.tail(&ctx, &opts).await?;
            done.complete();
            emit(cli.json, &page, |p| print_page(p, cli.show_query))
        }
        Commands::Search {
            text,
            filters,
            signal,
        } => {
            let opts = resolve_options(&engine, &filters, signal, &cfg).await?;
            let (ctx, done) = engine.start(RequestKind::Documents);
            let page = engine.search(&ctx, &text, &opts).await?;
            done.complete();
            emit(cli.json, &page, |p| print_page(p, cli.show_query))
        }
        Commands::Metrics { filters } => {
            let opts = resolve_options(&engine, &filters, Signal::Metrics, &cfg).await?;
            let (ctx, done) = engine.start(RequestKind::MetricAggregation);
            let series = engine.aggregate_metrics(&ctx, &opts).await?;
            done.complete();
            emit(cli.json, &series, |s| print_metrics(s))
        }
        Commands::Ops { filters } => {
            let opts = resolve_options(&engine, &filters, Signal::Traces, &cfg).await?;
            let (ctx, done) = engine.start(RequestKind::OperationNames);
            let ops = engine.list_operation_names(&ctx, &opts).await?;
            done.complete();
            emit(cli.json, &ops, |o| print_operations(o))
        }
        Commands::Trace { trace_id } => {
            let trace_id = TraceId::parse(&trace_id)?;
            let (ctx, done) = engine.start(RequestKind::Spans);
            let spans = engine.spans_for_trace(&ctx, &trace_id).await?;
            done.complete();
            if spans.is_empty() {
                anyhow::bail!("trace {trace_id} not found");
            }
            emit(cli.json, &spans, |s| print_trace(trace_id.as_str(), s))
        }
        Commands::Perspective {
            perspective,
            filters,
            signal,
        } => {
            let opts = resolve_options(&engine, &filters, signal, &cfg).await?;
            let (ctx, done) = engine.start(RequestKind::PerspectiveCounts);
            let counts = engine.perspective_counts(&ctx, &perspective, &opts).await?;
            done.complete();
            emit(cli.json, &counts, |c| print_perspective(c))
        }
        Commands::Fields { signal } => {
            let (ctx, done) = engine.start(RequestKind::FieldDiscovery);
            let fields = engine.discover_fields(&ctx, signal).await?;
            done.complete();
            emit(cli.json, &fields, |f| print_fields(f))
        }
        Commands::Detect { filters, signal } => {
            let opts = query_options(&filters, signal, &cfg)?;
            let (ctx, done) = engine.start(RequestKind::AutoRange);
            let detected = engine.detect_lookback(&ctx, &opts).await?;
            done.complete();
            emit(cli.json, &detected, print_detected)
        }
        Commands::Ping => {
            let (ctx, done) = engine.start(RequestKind::Maintenance);
            let info = engine
                .ping(&ctx)
                .await
                .with_context(|| format!("ping {}", cfg.url))?;
            done.complete();
            emit(cli.json, &info, print_cluster)
        }
        Commands::Clear { signal, yes } => {
            if !yes {
                anyhow::bail!(
                    "refusing to delete every {signal} document in {} without --yes",
                    engine.index_for(signal)
                );
            }
            let (ctx, done) = engine.start(RequestKind::Maintenance);
            let deleted = engine.clear(&ctx, signal).await?;
            done.complete();
            info!(%signal, deleted, "cleared documents");
            emit(cli.json, &serde_json::json!({ "deleted": deleted }), |_| {
                println!("deleted={deleted}")
            })
        }
    }
}

fn emit<T: Serialize + ?Sized>(
    json: bool,
    value: &T,
    human: impl FnOnce(&T),
) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        human(value);
    }
    Ok(())
}

/// Query options from flags, with `--since auto` resolved by probing the
/// store.
async fn resolve_options(
    engine: &Engine,
    args: &FilterArgs,
    signal: Signal,
    cfg: &Config,
) -> anyhow::Result<QueryOptions> {
    let opts = query_options(args, signal, cfg)?;
    if args.since.as_deref() != Some("auto") {
        return Ok(opts);
    }

    let (ctx, done) = engine.start(RequestKind::AutoRange);
    let detected = engine.detect_lookback(&ctx, &opts).await?;
    done.complete();
    debug!(lookback = %detected.lookback, count = detected.count, "auto-detected range");
    Ok(opts.with_range(TimeRange::Lookback(detected.lookback)))
}

fn query_options(args: &FilterArgs, signal: Signal, cfg: &Config) -> anyhow::Result<QueryOptions> {
    let since = args.since.as_deref().filter(|s| *s != "auto");
    Ok(QueryOptions {
        signal,
        range: parse_range(since, args.until.as_deref())?,
        services: args.services.clone(),
        exclude_services: args.exclude_services.clone(),
        environments: args.environments.clone(),
        exclude_environments: args.exclude_environments.clone(),
        level: args.level.clone(),
        container: args.container.clone(),
        has_fields: args.has_fields.clone(),
        operation: args.operation.clone(),
        event_type: args.event_type.clone(),
        limit: args.limit.unwrap_or(cfg.default_limit),
    })
}

/// `--since` alone is a lookback when it reads as one; anything involving
/// an absolute time or `--until` becomes explicit bounds.
fn parse_range(since: Option<&str>, until: Option<&str>) -> anyhow::Result<TimeRange> {
    if until.is_none() {
        return Ok(match since {
            None => QueryOptions::default().range,
            Some(since) => match Lookback::parse(since) {
                Ok(lookback) => TimeRange::Lookback(lookback),
                Err(_) => TimeRange::Absolute {
                    from: Some(parse_time_or_relative(since)?),
                    to: None,
                },
            },
        });
    }

    let from = match since {
        None => None,
        Some(s) if Lookback::parse(s).is_ok_and(|l| l.is_all_time()) => None,
        Some(s) => Some(parse_time_or_relative(s)?),
    };
    let to = until.map(parse_time_or_relative).transpose()?;
    if let (Some(from), Some(to)) = (from, to)
        && from > to
    {
        anyhow::bail!("--since is after --until");
    }
    Ok(TimeRange::Absolute { from, to })
}
