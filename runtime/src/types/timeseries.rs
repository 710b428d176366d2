use std::fmt::Debug;
use std::sync::Arc;

use super::MetricName;

/// A single result series. All series produced by one evaluation share the same `timestamps`
/// allocation; it is never mutated in place once shared.
#[derive(Default, Debug, Clone, PartialEq)]
pub struct Timeseries {
    pub metric_name: MetricName,
    pub values: Vec<f64>,
    pub timestamps: Arc<Vec<i64>>, //Arc used vs Rc since Rc is !Send
}

impl Timeseries {
    pub fn new(timestamps: Vec<i64>, values: Vec<f64>) -> Self {
        Timeseries {
            metric_name: MetricName::default(),
            values,
            timestamps: Arc::new(timestamps),
        }
    }

    pub fn with_shared_timestamps(timestamps: &Arc<Vec<i64>>, values: &[f64]) -> Self {
        Timeseries {
            metric_name: MetricName::default(),
            values: Vec::from(values),
            timestamps: Arc::clone(timestamps),
        }
    }

    /// Creates a series holding `value` at every point of the grid.
    pub fn constant(timestamps: &Arc<Vec<i64>>, value: f64) -> Self {
        Timeseries {
            metric_name: MetricName::default(),
            values: vec![value; timestamps.len()],
            timestamps: Arc::clone(timestamps),
        }
    }

    /// Copies the name and the values, sharing the timestamps.
    pub fn copy_from_shallow_timestamps(src: &Timeseries) -> Self {
        Timeseries {
            metric_name: src.metric_name.clone(),
            values: src.values.clone(),
            timestamps: Arc::clone(&src.timestamps),
        }
    }

    pub fn reset(&mut self) {
        self.values.clear();
        self.timestamps = Arc::new(vec![]);
        self.metric_name.reset();
    }

    pub fn is_all_nans(&self) -> bool {
        self.values.iter().all(|v| v.is_nan())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[inline]
    pub fn tag_count(&self) -> usize {
        self.metric_name.tag_count()
    }
}

/// Verifies that every series has the same timestamps with a fixed `step` between them.
/// A mismatch is an internal invariant violation.
pub(crate) fn assert_identical_timestamps(tss: &[Timeseries], step: i64) {
    if tss.is_empty() {
        return;
    }
    let ts_golden = &tss[0];
    if ts_golden.values.len() != ts_golden.timestamps.len() {
        panic!(
            "BUG: ts_golden.values.len() must match ts_golden.timestamps.len(); got {} vs {}",
            ts_golden.values.len(),
            ts_golden.timestamps.len()
        );
    }
    for pair in ts_golden.timestamps.windows(2) {
        if pair[1] - pair[0] != step {
            panic!(
                "BUG: invalid step between timestamps; got {}; want {}",
                pair[1] - pair[0],
                step
            );
        }
    }
    for ts in tss.iter().skip(1) {
        if ts.values.len() != ts_golden.values.len() {
            panic!(
                "BUG: unexpected ts.values.len(); got {}; want {}",
                ts.values.len(),
                ts_golden.values.len()
            );
        }
        if Arc::ptr_eq(&ts.timestamps, &ts_golden.timestamps) {
            // Fast path - shared timestamps.
            continue;
        }
        if ts.timestamps.as_slice() != ts_golden.timestamps.as_slice() {
            panic!("BUG: timestamps mismatch between series");
        }
    }
}

/// Drops series containing nothing but NaNs.
pub(crate) fn remove_empty_series(tss: &mut Vec<Timeseries>) {
    tss.retain(|ts| !ts.is_all_nans());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_series_shares_grid() {
        let timestamps = Arc::new(vec![1000, 2000, 3000]);
        let ts = Timeseries::constant(&timestamps, 2.5);
        assert_eq!(ts.values, vec![2.5, 2.5, 2.5]);
        assert!(Arc::ptr_eq(&ts.timestamps, &timestamps));
    }

    #[test]
    fn identical_timestamps_pass() {
        let timestamps = Arc::new(vec![1000, 2000, 3000]);
        let a = Timeseries::with_shared_timestamps(&timestamps, &[1.0, 2.0, 3.0]);
        let b = Timeseries::new(vec![1000, 2000, 3000], vec![f64::NAN, 1.0, 0.0]);
        assert_identical_timestamps(&[a, b], 1000);
    }

    #[test]
    #[should_panic(expected = "BUG: invalid step")]
    fn wrong_step_panics() {
        let a = Timeseries::new(vec![1000, 2000, 4000], vec![1.0, 2.0, 3.0]);
        assert_identical_timestamps(&[a], 1000);
    }

    #[test]
    #[should_panic(expected = "BUG: unexpected ts.values.len()")]
    fn mismatched_lengths_panic() {
        let timestamps = Arc::new(vec![1000, 2000]);
        let a = Timeseries::with_shared_timestamps(&timestamps, &[1.0, 2.0]);
        let mut b = Timeseries::with_shared_timestamps(&timestamps, &[1.0, 2.0]);
        b.values.pop();
        assert_identical_timestamps(&[a, b], 1000);
    }

    #[test]
    fn removes_all_nan_series() {
        let mut tss = vec![
            Timeseries::new(vec![1, 2], vec![f64::NAN, f64::NAN]),
            Timeseries::new(vec![1, 2], vec![f64::NAN, 1.0]),
        ];
        remove_empty_series(&mut tss);
        assert_eq!(tss.len(), 1);
    }
}
