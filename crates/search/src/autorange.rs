use std::future::Future;

use otq_core::query::DetectedRange;
use otq_core::time::Lookback;
use otq_core::{OtqError, Result};

/// Counts matching documents inside a lookback window.
pub trait RangeCounter {
    fn count(&self, lookback: &Lookback) -> impl Future<Output = Result<u64>> + Send;
}

/// Walk `candidates` (narrowest first) and return the first window holding
/// at least `threshold` documents. When none does, the window with the
/// most documents wins, the narrower one on ties; if every window is
/// empty the widest is returned.
///
/// A failing candidate counts as zero. Cancellation stops the walk.
pub async fn detect<C>(
    counter: &C,
    candidates: &[Lookback],
    threshold: u64,
) -> Result<DetectedRange>
where
    C: RangeCounter + Sync,
{
    let Some(widest) = candidates.last() else {
        return Err(OtqError::InvalidArgument(
            "auto-range needs at least one candidate".to_string(),
        ));
    };

    let mut best: Option<DetectedRange> = None;
    for candidate in candidates {
        let count = match counter.count(candidate).await {
            Ok(count) => count,
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => {
                tracing::warn!(lookback = %candidate, error = %err, "auto-range count failed");
                0
            }
        };
        tracing::debug!(lookback = %candidate, count, "auto-range count");

        if count >= threshold {
            return Ok(DetectedRange {
                lookback: candidate.clone(),
                count,
            });
        }
        if count > best.as_ref().map_or(0, |b| b.count) {
            best = Some(DetectedRange {
                lookback: candidate.clone(),
                count,
            });
        }
    }

    Ok(best.unwrap_or_else(|| DetectedRange {
        lookback: widest.clone(),
        count: 0,
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use otq_core::time::lookback_candidates;

    use super::*;

    struct Scripted {
        counts: Vec<Result<u64>>,
        seen: Mutex<Vec<Lookback>>,
    }

    impl Scripted {
        fn new(counts: Vec<Result<u64>>) -> Self {
            Self {
                counts,
                seen: Mutex::new(Vec::new()),
            }
        }

        fn seen(&self) -> Vec<Lookback> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl RangeCounter for Scripted {
        fn count(&self, lookback: &Lookback) -> impl Future<Output = Result<u64>> + Send {
            let idx = {
                let mut seen = self.seen.lock().unwrap();
                seen.push(lookback.clone());
                seen.len() - 1
            };
            let out = match self.counts.get(idx) {
                Some(Ok(n)) => Ok(*n),
                Some(Err(OtqError::Cancelled)) => Err(OtqError::Cancelled),
                Some(Err(_)) => Err(OtqError::Transport("count failed".into())),
                None => Ok(0),
            };
            async move { out }
        }
    }

    fn candidates(n: usize) -> Vec<Lookback> {
        lookback_candidates().into_iter().take(n).collect()
    }

    #[tokio::test]
    async fn stops_at_first_window_over_threshold() {
        let counter = Scripted::new(vec![Ok(50), Ok(200), Ok(15_000), Ok(5)]);
        let range = detect(&counter, &candidates(4), 10_000).await.unwrap();

        assert_eq!(range.lookback, Lookback::hours(1));
        assert_eq!(range.count, 15_000);
        assert_eq!(counter.seen().len(), 3);
    }

    #[tokio::test]
    async fn falls_back_to_the_fullest_window() {
        let counter = Scripted::new(vec![Ok(50), Ok(200), Ok(200), Ok(5)]);
        let range = detect(&counter, &candidates(4), 10_000).await.unwrap();

        assert_eq!(range.lookback, Lookback::Relative("now-15m".into()));
        assert_eq!(range.count, 200);
        assert_eq!(counter.seen().len(), 4);
    }

    #[tokio::test]
    async fn failed_counts_count_as_zero() {
        let counter = Scripted::new(vec![
            Err(OtqError::Transport(String::new())),
            Ok(3),
            Err(OtqError::Transport(String::new())),
        ]);
        let range = detect(&counter, &candidates(3), 10).await.unwrap();
        assert_eq!(range.count, 3);
    }

    #[tokio::test]
    async fn empty_store_selects_widest_window() {
        let counter = Scripted::new(Vec::new());
        let all = lookback_candidates();
        let range = detect(&counter, &all, 10).await.unwrap();
        assert_eq!(range.lookback, Lookback::AllTime);
        assert_eq!(range.count, 0);
    }

    #[tokio::test]
    async fn cancellation_aborts_the_walk() {
        let counter = Scripted::new(vec![Ok(1), Err(OtqError::Cancelled), Ok(50_000)]);
        let err = detect(&counter, &candidates(3), 10).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(counter.seen().len(), 2);
    }

    #[tokio::test]
    async fn no_candidates_is_an_error() {
        let counter = Scripted::new(Vec::new());
        assert!(detect(&counter, &[], 10).await.is_err());
    }
}
