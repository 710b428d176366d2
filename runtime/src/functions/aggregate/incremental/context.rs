use std::sync::Arc;

use vmquery_ast::expr::AggregationExpr;
use vmquery_common::hash::FastHashMap;
use vmquery_common::pool::get_pooled_buffer;

use crate::functions::aggregate::IncrementalAggregationHandler;
use crate::runtime_error::{RuntimeError, RuntimeResult};
use crate::types::Timeseries;

/// Running state of a single output group.
#[derive(Default, Debug, Clone)]
pub struct IncrementalAggrContext {
    pub ts: Timeseries,
    /// Per-point number of inputs folded into `ts`.
    pub values: Vec<f64>,
}

/// Groups accumulated by a single worker, keyed by the marshaled group name.
pub type IncrementalAggrShard = FastHashMap<Vec<u8>, IncrementalAggrContext>;

/// Aggregates rollup results as they are produced instead of materializing all of them.
///
/// Every worker folds into a shard it owns exclusively, so updates need no synchronization.
/// Shards are combined pairwise with `merge_shards` and turned into output series by
/// `finalize_timeseries`. The context itself holds no group state and may be reused.
pub struct IncrementalAggrFuncContext<'a> {
    ae: &'a AggregationExpr,
    workers: usize,
    handler: IncrementalAggregationHandler,
}

impl<'a> IncrementalAggrFuncContext<'a> {
    pub(crate) fn new(ae: &'a AggregationExpr, workers: usize) -> RuntimeResult<Self> {
        let handler = IncrementalAggregationHandler::new(ae.function).ok_or_else(|| {
            RuntimeError::General(format!(
                "cannot create incremental aggregation handler for {}",
                ae.function
            ))
        })?;
        Ok(Self {
            ae,
            workers: workers.max(1),
            handler,
        })
    }

    /// Upper bound on the number of shards alive at once.
    pub fn worker_count(&self) -> usize {
        self.workers
    }

    /// Folds `ts` into the group it belongs to. The metric name of `ts` is reduced to its
    /// group name in the process.
    pub fn update_timeseries(&self, shard: &mut IncrementalAggrShard, ts: &mut Timeseries) {
        ts.metric_name.remove_group_tags(&self.ae.modifier);
        let mut key = get_pooled_buffer(256);
        ts.metric_name.marshal(&mut key);

        if let Some(iac) = shard.get_mut(key.as_slice()) {
            self.handler.update(iac, &ts.values);
            return;
        }

        if self.limit_reached(shard) {
            return;
        }

        let value_len = ts.values.len();
        let mut iac = IncrementalAggrContext {
            ts: Timeseries {
                metric_name: ts.metric_name.clone(),
                values: vec![0.0; value_len],
                timestamps: Arc::clone(&ts.timestamps),
            },
            values: vec![0.0; value_len],
        };
        self.handler.update(&mut iac, &ts.values);
        shard.insert(key.to_vec(), iac);
    }

    /// Merges the groups of `src` into `dst`. Groups of `src` missing from `dst` are dropped
    /// once `dst` holds `limit` groups.
    pub fn merge_shards(
        &self,
        mut dst: IncrementalAggrShard,
        src: IncrementalAggrShard,
    ) -> IncrementalAggrShard {
        for (k, iac) in src.into_iter() {
            if let Some(iac_dst) = dst.get_mut(&k) {
                self.handler.merge(iac_dst, &iac);
                continue;
            }
            if self.limit_reached(&dst) {
                continue;
            }
            dst.insert(k, iac);
        }
        dst
    }

    /// Returns one series per group of the fully merged `shard`.
    pub fn finalize_timeseries(&self, shard: IncrementalAggrShard) -> Vec<Timeseries> {
        shard
            .into_values()
            .map(|mut iac| {
                self.handler.finalize(&mut iac);
                iac.ts
            })
            .collect()
    }

    fn limit_reached(&self, shard: &IncrementalAggrShard) -> bool {
        self.ae.limit > 0 && shard.len() >= self.ae.limit
    }
}
