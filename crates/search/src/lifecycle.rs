//! Per-kind request lifecycle.
//!
//! Each [`RequestKind`] has at most one live request. Starting a new one
//! cancels the previous request of that kind, so a slow response can never
//! overwrite a newer one. Completion is guarded by the sequence number the
//! request was started with: a superseded request that finishes late does
//! not remove its successor's record.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use otq_core::{OtqError, Result};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Documents,
    MetricAggregation,
    OperationNames,
    Spans,
    PerspectiveCounts,
    FieldDiscovery,
    AutoRange,
    Maintenance,
}

impl RequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Documents => "documents",
            Self::MetricAggregation => "metric_aggregation",
            Self::OperationNames => "operation_names",
            Self::Spans => "spans",
            Self::PerspectiveCounts => "perspective_counts",
            Self::FieldDiscovery => "field_discovery",
            Self::AutoRange => "auto_range",
            Self::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handed to every engine call. Carries the cancellation signal and the
/// deadline the HTTP layer races against.
#[derive(Debug, Clone)]
pub struct RequestContext {
    kind: RequestKind,
    seq: u64,
    token: CancellationToken,
    timeout: Duration,
    deadline: Instant,
}

impl RequestContext {
    /// A context outside any manager; only its own timeout applies.
    pub fn detached(kind: RequestKind, timeout: Duration) -> Self {
        Self {
            kind,
            seq: 0,
            token: CancellationToken::new(),
            timeout,
            deadline: Instant::now() + timeout,
        }
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Drive `fut` until it finishes, the request is cancelled, or the
    /// deadline passes, whichever comes first.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.token.is_cancelled() {
            return Err(OtqError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(OtqError::Cancelled),
            res = tokio::time::timeout_at(self.deadline, fut) => match res {
                Ok(out) => out,
                Err(_) => Err(OtqError::Timeout(format!("{:?}", self.timeout()))),
            },
        }
    }
}

#[derive(Debug)]
struct ActiveRequest {
    seq: u64,
    token: CancellationToken,
}

#[derive(Debug, Default)]
struct State {
    next_seq: u64,
    active: HashMap<RequestKind, ActiveRequest>,
}

#[derive(Debug)]
struct Shared {
    parent: CancellationToken,
    state: Mutex<State>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone)]
pub struct RequestManager {
    shared: Arc<Shared>,
}

impl Default for RequestManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestManager {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                parent: CancellationToken::new(),
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Register a new request of `kind`, superseding any live one.
    pub fn start(&self, kind: RequestKind, timeout: Duration) -> (RequestContext, Completion) {
        let token = self.shared.parent.child_token();
        let (seq, previous) = {
            let mut state = self.shared.lock();
            state.next_seq += 1;
            let seq = state.next_seq;
            let previous = state.active.insert(
                kind,
                ActiveRequest {
                    seq,
                    token: token.clone(),
                },
            );
            (seq, previous)
        };

        if let Some(previous) = previous {
            tracing::debug!(
                kind = %kind,
                superseded = previous.seq,
                seq,
                "cancelling superseded request"
            );
            previous.token.cancel();
        }

        let ctx = RequestContext {
            kind,
            seq,
            token: token.clone(),
            timeout,
            deadline: Instant::now() + timeout,
        };
        let completion = Completion {
            shared: Arc::clone(&self.shared),
            kind,
            seq,
            token,
            done: false,
        };
        (ctx, completion)
    }

    pub fn active_seq(&self, kind: RequestKind) -> Option<u64> {
        self.shared.lock().active.get(&kind).map(|r| r.seq)
    }

    pub fn is_active(&self, kind: RequestKind) -> bool {
        self.active_seq(kind).is_some()
    }

    /// Cancel every live request and refuse new work. Contexts started
    /// afterwards are born cancelled.
    pub fn shutdown(&self) {
        self.shared.parent.cancel();
        let drained = {
            let mut state = self.shared.lock();
            state.active.drain().count()
        };
        tracing::debug!(cancelled = drained, "request manager shut down");
    }
}

/// Ends a request. Dropping it has the same effect as calling
/// [`Completion::complete`].
#[derive(Debug)]
pub struct Completion {
    shared: Arc<Shared>,
    kind: RequestKind,
    seq: u64,
    token: CancellationToken,
    done: bool,
}

impl Completion {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn complete(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        {
            let mut state = self.shared.lock();
            if state.active.get(&self.kind).is_some_and(|r| r.seq == self.seq) {
                state.active.remove(&self.kind);
            }
        }
        self.token.cancel();
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn starting_a_kind_cancels_the_previous_request() {
        let manager = RequestManager::new();
        let (first, _first_done) = manager.start(RequestKind::Documents, TIMEOUT);
        let (second, _second_done) = manager.start(RequestKind::Documents, TIMEOUT);

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert!(second.seq() > first.seq());
        assert_eq!(manager.active_seq(RequestKind::Documents), Some(second.seq()));

        let result = first.run(async { Ok::<_, OtqError>(1) }).await;
        assert!(matches!(result, Err(OtqError::Cancelled)));
    }

    #[tokio::test]
    async fn late_completion_does_not_remove_successor() {
        let manager = RequestManager::new();
        let (_, first_done) = manager.start(RequestKind::Spans, TIMEOUT);
        let (second, second_done) = manager.start(RequestKind::Spans, TIMEOUT);

        first_done.complete();
        assert_eq!(manager.active_seq(RequestKind::Spans), Some(second.seq()));

        second_done.complete();
        assert!(!manager.is_active(RequestKind::Spans));
        assert!(second.is_cancelled());
    }

    #[tokio::test]
    async fn kinds_are_independent() {
        let manager = RequestManager::new();
        let (docs, _docs_done) = manager.start(RequestKind::Documents, TIMEOUT);
        let (_metrics, _metrics_done) = manager.start(RequestKind::MetricAggregation, TIMEOUT);
        assert!(!docs.is_cancelled());
    }

    #[tokio::test]
    async fn dropping_the_completion_completes() {
        let manager = RequestManager::new();
        {
            let (_ctx, _done) = manager.start(RequestKind::FieldDiscovery, TIMEOUT);
            assert!(manager.is_active(RequestKind::FieldDiscovery));
        }
        assert!(!manager.is_active(RequestKind::FieldDiscovery));
    }

    #[tokio::test]
    async fn run_times_out_at_the_deadline() {
        let ctx = RequestContext::detached(RequestKind::Documents, Duration::from_millis(20));
        let result = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, OtqError>(())
            })
            .await;
        assert!(matches!(result, Err(OtqError::Timeout(_))));
    }

    #[tokio::test]
    async fn cancellation_interrupts_in_flight_work() {
        let manager = RequestManager::new();
        let (ctx, _done) = manager.start(RequestKind::AutoRange, TIMEOUT);
        let pending = tokio::spawn({
            let ctx = ctx.clone();
            async move {
                ctx.run(async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, OtqError>(())
                })
                .await
            }
        });
        let (_next, _next_done) = manager.start(RequestKind::AutoRange, TIMEOUT);
        let result = pending.await.unwrap();
        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn shutdown_cancels_everything() {
        let manager = RequestManager::new();
        let (docs, _a) = manager.start(RequestKind::Documents, TIMEOUT);
        let (ops, _b) = manager.start(RequestKind::OperationNames, TIMEOUT);
        manager.shutdown();
        assert!(docs.is_cancelled());
        assert!(ops.is_cancelled());

        let (late, _c) = manager.start(RequestKind::Documents, TIMEOUT);
        assert!(late.is_cancelled());
    }
}
