use std::fmt;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use serde::{Deserialize, Serialize};

use vmquery_ast::label::LabelFilter;

use crate::provider::Deadline;
use crate::runtime_error::{RuntimeError, RuntimeResult};
use crate::types::{MetricName, Timeseries, Timestamp, TimestampTrait};

/// Source of raw samples for the evaluator.
///
/// Implementations are responsible for honoring the deadline; the evaluator never checks it.
pub trait MetricStorage: Sync + Send {
    fn search(&self, sq: &SearchQuery, deadline: &Deadline) -> RuntimeResult<QueryResults>;
}

/// Storage without any data.
pub struct NullMetricStorage {}

impl MetricStorage for NullMetricStorage {
    fn search(&self, _sq: &SearchQuery, _deadline: &Deadline) -> RuntimeResult<QueryResults> {
        Ok(QueryResults::default())
    }
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantId {
    pub account_id: u32,
    pub project_id: u32,
}

impl TenantId {
    pub fn new(account_id: u32, project_id: u32) -> Self {
        Self {
            account_id,
            project_id,
        }
    }
}

impl Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.account_id, self.project_id)
    }
}

/// SearchQuery is sent to the storage for fetching raw samples.
#[derive(Default, Debug, Clone)]
pub struct SearchQuery {
    pub tenant: TenantId,

    /// The time range for searching time series. Both ends are inclusive.
    pub start: Timestamp,
    pub end: Timestamp,

    /// Series match if they match every filter of at least one group.
    pub matchers: Vec<Vec<LabelFilter>>,

    /// The maximum number of time series the search can return.
    pub max_series: usize,
}

impl SearchQuery {
    pub fn new(
        tenant: TenantId,
        start: Timestamp,
        end: Timestamp,
        matchers: Vec<Vec<LabelFilter>>,
        max_series: usize,
    ) -> Self {
        let max_series = if max_series == 0 {
            2e9 as usize
        } else {
            max_series
        };
        SearchQuery {
            tenant,
            start: start.max(0),
            end,
            matchers,
            max_series,
        }
    }
}

impl Display for SearchQuery {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let filters = self
            .matchers
            .iter()
            .map(|tfs| {
                let inner = tfs.iter().map(|tf| tf.to_string()).collect::<Vec<_>>();
                format!("{{{}}}", inner.join(","))
            })
            .collect::<Vec<_>>();
        write!(
            f,
            "tenant={}, filters={}, timeRange=[{}..{}], max={}",
            self.tenant,
            filters.join(" or "),
            self.start.to_rfc3339(),
            self.end.to_rfc3339(),
            self.max_series
        )
    }
}

/// A single raw series returned from the storage. Timestamps are sorted in ascending order.
#[derive(Default, Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub metric: MetricName,
    pub values: Vec<f64>,
    pub timestamps: Vec<i64>,
}

impl QueryResult {
    pub fn new(metric: MetricName, timestamps: Vec<i64>, values: Vec<f64>) -> Self {
        QueryResult {
            metric,
            values,
            timestamps,
        }
    }

    pub fn into_timeseries(self) -> Timeseries {
        Timeseries {
            metric_name: self.metric,
            values: self.values,
            timestamps: Arc::new(self.timestamps),
        }
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// The result set of a storage search.
#[derive(Debug, Default)]
pub struct QueryResults {
    pub series: Vec<QueryResult>,
    /// Set when some storage nodes did not respond and the data is incomplete.
    pub is_partial: bool,
    cancelled: AtomicBool,
}

impl QueryResults {
    pub fn new(series: Vec<QueryResult>, is_partial: bool) -> Self {
        QueryResults {
            series,
            is_partial,
            cancelled: AtomicBool::new(false),
        }
    }

    /// Returns the number of series in the result set.
    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Releases the result set without processing it. Any pending or later
    /// `for_each_parallel` call stops early with an error.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Runs `f` for every series on the worker pool. The second argument of `f` is the index
    /// of the worker running it, which is stable for the duration of one call and smaller
    /// than [`worker_count`].
    ///
    /// Processing stops at the first error, which is returned.
    pub fn for_each_parallel<F>(&self, f: F) -> RuntimeResult<()>
    where
        F: Fn(&QueryResult, usize) -> RuntimeResult<()> + Send + Sync,
    {
        self.series.par_iter().try_for_each(|rs| {
            if self.is_cancelled() {
                return Err(RuntimeError::General("search was cancelled".to_string()));
            }
            let worker_id = rayon::current_thread_index().unwrap_or(0);
            f(rs, worker_id)
        })
    }

    /// Folds the series on the worker pool. Each worker task folds into its own state
    /// created by `init`, without any synchronization, and the states are then combined
    /// pairwise with `reduce`.
    ///
    /// Processing stops at the first error, which is returned.
    pub fn fold_parallel<T, I, F, R>(&self, init: I, fold: F, reduce: R) -> RuntimeResult<T>
    where
        T: Send,
        I: Fn() -> T + Send + Sync,
        F: Fn(&mut T, &QueryResult) -> RuntimeResult<()> + Send + Sync,
        R: Fn(T, T) -> T + Send + Sync,
    {
        self.series
            .par_iter()
            .try_fold(&init, |mut acc, rs| {
                if self.is_cancelled() {
                    return Err(RuntimeError::General("search was cancelled".to_string()));
                }
                fold(&mut acc, rs)?;
                Ok(acc)
            })
            .try_reduce(&init, |a, b| Ok(reduce(a, b)))
    }
}

/// The number of distinct worker ids `QueryResults::for_each_parallel` can hand out.
pub fn worker_count() -> usize {
    rayon::current_num_threads().max(1)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn results(n: usize) -> QueryResults {
        let series = (0..n)
            .map(|i| {
                let mut mn = MetricName::new("foo");
                mn.set_tag("i", i.to_string());
                QueryResult::new(mn, vec![1000, 2000], vec![i as f64, 1.0])
            })
            .collect();
        QueryResults::new(series, false)
    }

    #[test]
    fn visits_every_series_once() {
        let rss = results(100);
        let sum = Mutex::new(0.0);
        rss.for_each_parallel(|rs, worker_id| {
            assert!(worker_id < worker_count());
            *sum.lock().unwrap() += rs.values[0];
            Ok(())
        })
        .unwrap();
        assert_eq!(*sum.lock().unwrap(), (0..100).sum::<usize>() as f64);
    }

    #[test]
    fn stops_on_first_error() {
        let rss = results(10);
        let err = rss
            .for_each_parallel(|_, _| Err(RuntimeError::from("boom")))
            .unwrap_err();
        assert_eq!(err, RuntimeError::General("boom".to_string()));
    }

    #[test]
    fn cancelled_results_are_not_processed() {
        let rss = results(3);
        rss.cancel();
        assert!(rss.for_each_parallel(|_, _| Ok(())).is_err());
        assert!(rss.fold_parallel(|| 0, |_, _| Ok(()), |a, b| a + b).is_err());
    }

    #[test]
    fn fold_combines_private_states() {
        let rss = results(100);
        let (count, sum) = rss
            .fold_parallel(
                || (0usize, 0.0),
                |acc, rs| {
                    acc.0 += 1;
                    acc.1 += rs.values[0];
                    Ok(())
                },
                |a, b| (a.0 + b.0, a.1 + b.1),
            )
            .unwrap();
        assert_eq!(count, 100);
        assert_eq!(sum, (0..100).sum::<usize>() as f64);

        let err = rss
            .fold_parallel(|| 0, |_, _| Err(RuntimeError::from("boom")), |a, b| a + b)
            .unwrap_err();
        assert_eq!(err, RuntimeError::General("boom".to_string()));
    }

    #[test]
    fn zero_max_series_means_unlimited() {
        let sq = SearchQuery::new(TenantId::default(), -5, 10, vec![], 0);
        assert_eq!(sq.start, 0);
        assert_eq!(sq.max_series, 2e9 as usize);
    }
}
