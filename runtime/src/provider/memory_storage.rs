use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use itertools::Itertools;

use vmquery_ast::label::{LabelFilter, NAME_LABEL};
use vmquery_common::hash::Signature;

use crate::provider::{Deadline, MetricStorage, QueryResult, QueryResults, SearchQuery};
use crate::runtime_error::{RuntimeError, RuntimeResult};
use crate::types::MetricName;

#[derive(Debug, Clone, Copy)]
struct Point {
    t: i64,
    v: f64,
}

#[derive(Debug, Default)]
struct Storage {
    series: BTreeMap<Signature, (MetricName, Vec<Point>)>,
}

impl Storage {
    fn append(&mut self, metric: &MetricName, t: i64, v: f64) {
        let entry = self
            .series
            .entry(metric.signature())
            .or_insert_with(|| (metric.clone(), vec![]));
        entry.1.push(Point { t, v });
    }

    fn get_range(&self, metric: &MetricName, points: &[Point], start: i64, end: i64) -> QueryResult {
        let (timestamps, values): (Vec<i64>, Vec<f64>) = points
            .iter()
            .filter(|p| p.t >= start && p.t <= end)
            .sorted_by_key(|p| p.t)
            .map(|p| (p.t, p.v))
            .unzip();
        QueryResult::new(metric.clone(), timestamps, values)
    }
}

fn matches_filter(metric: &MetricName, filter: &LabelFilter) -> bool {
    if filter.label == NAME_LABEL {
        return filter.is_match(&metric.metric_group);
    }
    filter.is_match(metric.get_tag_value(&filter.label).unwrap_or(""))
}

/// In-memory [`MetricStorage`], used by tests and by embedders who load samples up front.
#[derive(Debug, Default)]
pub struct MemoryMetricStorage {
    inner: RwLock<Storage>,
    partial: AtomicBool,
}

impl MemoryMetricStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, metric: &MetricName, timestamp: i64, value: f64) -> RuntimeResult<()> {
        let mut inner = self.write()?;
        inner.append(metric, timestamp, value);
        Ok(())
    }

    pub fn add_series(
        &self,
        metric: &MetricName,
        timestamps: &[i64],
        values: &[f64],
    ) -> RuntimeResult<()> {
        if timestamps.len() != values.len() {
            return Err(RuntimeError::ArgumentError(format!(
                "timestamps and values must have the same length; got {} vs {}",
                timestamps.len(),
                values.len()
            )));
        }
        let mut inner = self.write()?;
        for (t, v) in timestamps.iter().zip(values.iter()) {
            inner.append(metric, *t, *v);
        }
        Ok(())
    }

    /// Makes subsequent searches report their results as partial.
    pub fn set_partial(&self, partial: bool) {
        self.partial.store(partial, Ordering::Relaxed);
    }

    pub fn clear(&self) -> RuntimeResult<()> {
        self.write()?.series.clear();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|s| s.series.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write(&self) -> RuntimeResult<std::sync::RwLockWriteGuard<'_, Storage>> {
        self.inner
            .write()
            .map_err(|_| RuntimeError::StorageError("memory storage lock is poisoned".to_string()))
    }
}

impl MetricStorage for MemoryMetricStorage {
    fn search(&self, sq: &SearchQuery, _deadline: &Deadline) -> RuntimeResult<QueryResults> {
        let inner = self
            .inner
            .read()
            .map_err(|_| RuntimeError::StorageError("memory storage lock is poisoned".to_string()))?;

        let mut results = vec![];
        for (metric, points) in inner.series.values() {
            let matched = sq
                .matchers
                .iter()
                .any(|group| group.iter().all(|f| matches_filter(metric, f)));
            if !matched {
                continue;
            }
            let rs = inner.get_range(metric, points, sq.start, sq.end);
            if rs.is_empty() {
                continue;
            }
            if results.len() >= sq.max_series {
                return Err(RuntimeError::TooManyTimeseries(format!(
                    "the number of matching series exceeds {}",
                    sq.max_series
                )));
            }
            results.push(rs);
        }

        Ok(QueryResults::new(results, self.partial.load(Ordering::Relaxed)))
    }
}

#[cfg(test)]
mod tests {
    use vmquery_ast::label::LabelFilterOp;

    use crate::provider::TenantId;

    use super::*;

    fn storage() -> MemoryMetricStorage {
        let s = MemoryMetricStorage::new();
        let mut a = MetricName::new("http_requests");
        a.set_tag("job", "api");
        let mut b = MetricName::new("http_requests");
        b.set_tag("job", "db");
        s.add_series(&a, &[3000, 1000, 2000], &[3.0, 1.0, 2.0]).unwrap();
        s.add_series(&b, &[1000], &[10.0]).unwrap();
        s
    }

    fn query(filters: Vec<LabelFilter>) -> SearchQuery {
        SearchQuery::new(TenantId::default(), 0, 2500, vec![filters], 0)
    }

    #[test]
    fn selects_by_name_and_tags() {
        let s = storage();
        let filters = vec![
            LabelFilter::equal(NAME_LABEL, "http_requests"),
            LabelFilter::new(LabelFilterOp::RegexEqual, "job", "a.*").unwrap(),
        ];
        let rss = s.search(&query(filters), &Deadline::default()).unwrap();
        assert_eq!(rss.len(), 1);
        assert_eq!(rss.series[0].timestamps, vec![1000, 2000]);
        assert_eq!(rss.series[0].values, vec![1.0, 2.0]);
        assert!(!rss.is_partial);
    }

    #[test]
    fn reports_partial_results() {
        let s = storage();
        s.set_partial(true);
        let filters = vec![LabelFilter::equal(NAME_LABEL, "http_requests")];
        let rss = s.search(&query(filters), &Deadline::default()).unwrap();
        assert_eq!(rss.len(), 2);
        assert!(rss.is_partial);
    }

    #[test]
    fn enforces_max_series() {
        let s = storage();
        let filters = vec![LabelFilter::equal(NAME_LABEL, "http_requests")];
        let sq = SearchQuery::new(TenantId::default(), 0, 2500, vec![filters], 1);
        assert!(matches!(
            s.search(&sq, &Deadline::default()),
            Err(RuntimeError::TooManyTimeseries(_))
        ));
    }
}
