use std::sync::Arc;

use vmquery_common::hash::FastHashMap;

use crate::types::{MetricName, Timeseries};

/// Collects the series produced by window functions which fan out a single input series into
/// several output series distinguished by a label value.
#[derive(Clone, Debug)]
pub(crate) struct TimeseriesMap {
    origin: Timeseries,
    m: FastHashMap<String, Timeseries>,
}

impl TimeseriesMap {
    pub fn new(
        keep_metric_names: bool,
        shared_timestamps: &Arc<Vec<i64>>,
        mn_src: &MetricName,
    ) -> TimeseriesMap {
        let mut origin = Timeseries::constant(shared_timestamps, f64::NAN);
        origin.metric_name = mn_src.clone();
        if !keep_metric_names {
            origin.metric_name.reset_metric_group();
        }
        TimeseriesMap {
            origin,
            m: FastHashMap::default(),
        }
    }

    pub fn get_or_create_timeseries(
        &mut self,
        label_name: &str,
        label_value: &str,
    ) -> &mut Timeseries {
        let origin = &self.origin;
        self.m
            .entry(label_value.to_string())
            .or_insert_with(|| {
                let mut ts = Timeseries::copy_from_shallow_timestamps(origin);
                ts.metric_name.set_tag(label_name, label_value);
                ts
            })
    }

    pub fn len(&self) -> usize {
        self.m.len()
    }

    pub fn is_empty(&self) -> bool {
        self.m.is_empty()
    }

    /// Moves all collected series to dst.
    pub fn append_timeseries_to(self, dst: &mut Vec<Timeseries>) {
        dst.extend(self.m.into_iter().map(|(_, v)| v))
    }
}
