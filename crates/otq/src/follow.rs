use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use otq_core::query::{DocumentPage, QueryOptions};
use otq_search::{Engine, RequestKind};
use tokio::sync::mpsc;
use tracing::debug;

use crate::output::print_record;

#[derive(Debug, Clone)]
pub struct FollowConfig {
    pub interval: Duration,
    pub json: bool,
    pub show_query: bool,
    /// Stop after this many completed refreshes.
    pub refreshes: Option<usize>,
}

struct Update {
    seq: u64,
    result: otq_core::Result<DocumentPage>,
}

/// Re-run the document query every interval and print records not seen in
/// the previous page. Fetches run as spawned tasks; this loop is the only
/// consumer of their results, and only the newest request's result is
/// shown.
pub async fn follow(
    engine: Arc<Engine>,
    opts: QueryOptions,
    cfg: FollowConfig,
) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::channel::<Update>(8);
    let mut ticker = tokio::time::interval(cfg.interval);
    let mut latest_seq = None;
    let mut seen = HashSet::<(String, String)>::new();
    let mut has_results = false;
    let mut completed = 0usize;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let (ctx, done) = engine.start(RequestKind::Documents);
                latest_seq = Some(ctx.seq());
                let engine = Arc::clone(&engine);
                let opts = opts.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let result = engine.tail(&ctx, &opts).await;
                    let _ = tx.send(Update { seq: ctx.seq(), result }).await;
                    done.complete();
                });
            }
            Some(update) = rx.recv() => {
                if Some(update.seq) != latest_seq {
                    debug!(seq = update.seq, "dropping superseded refresh");
                    continue;
                }
                match update.result {
                    Ok(page) => {
                        if cfg.show_query && !has_results {
                            println!("{}\n", page.query);
                        }
                        show_new(&page, &mut seen, cfg.json)?;
                        has_results = true;
                    }
                    Err(err) if err.is_cancelled() => continue,
                    Err(err) if has_results => eprintln!("refresh failed: {err}"),
                    Err(err) => eprintln!("no results: {err}"),
                }
                completed += 1;
                if cfg.refreshes.is_some_and(|max| completed >= max) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                debug!("interrupted; cancelling in-flight requests");
                break;
            }
        }
    }

    engine.shutdown();
    Ok(())
}

fn show_new(
    page: &DocumentPage,
    seen: &mut HashSet<(String, String)>,
    json: bool,
) -> anyhow::Result<()> {
    let key = |r: &otq_core::model::Record| (r.index.clone(), r.id.clone());
    for record in page.records.iter().rev() {
        if seen.contains(&key(record)) {
            continue;
        }
        if json {
            println!("{}", serde_json::to_string(record)?);
        } else {
            print_record(record);
        }
    }
    // Records that fell off the page are older than everything on it.
    *seen = page.records.iter().map(key).collect();
    Ok(())
}
