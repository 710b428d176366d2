use vmquery_ast::functions::AggregateFunction;

use super::any::IncrementalAggrAny;
use super::avg::IncrementalAggrAvg;
use super::context::IncrementalAggrContext;
use super::count::IncrementalAggrCount;
use super::geomean::IncrementalAggrGeomean;
use super::group::IncrementalAggrGroup;
use super::max::IncrementalAggrMax;
use super::min::IncrementalAggrMin;
use super::sum::IncrementalAggrSum;
use super::sum2::IncrementalAggrSum2;

/// Folds series into an accumulator one at a time.
///
/// The accumulator keeps the running value per point in `iac.ts.values` and the number of
/// inputs folded into that point in `iac.values`. A point with a zero count has seen only NaNs.
pub trait IncrementalAggrHandler {
    /// Maps an input value to its contribution.
    fn seed(&self, v: f64) -> f64 {
        v
    }

    /// Combines a running value with a contribution or with another running value.
    fn combine(&self, acc: f64, v: f64) -> f64;

    fn update(&self, iac: &mut IncrementalAggrContext, values: &[f64]) {
        let dst = iac.ts.values.iter_mut().zip(iac.values.iter_mut());
        for (v, (dst, count)) in values.iter().zip(dst) {
            if v.is_nan() {
                continue;
            }
            let v = self.seed(*v);
            *dst = if *count == 0.0 { v } else { self.combine(*dst, v) };
            *count += 1.0;
        }
    }

    fn merge(&self, dst: &mut IncrementalAggrContext, src: &IncrementalAggrContext) {
        let src_points = src.ts.values.iter().zip(src.values.iter());
        let dst_points = dst.ts.values.iter_mut().zip(dst.values.iter_mut());
        for ((v, src_count), (dst, dst_count)) in src_points.zip(dst_points) {
            if *src_count == 0.0 {
                continue;
            }
            *dst = if *dst_count == 0.0 {
                *v
            } else {
                self.combine(*dst, *v)
            };
            *dst_count += src_count;
        }
    }

    fn finalize(&self, iac: &mut IncrementalAggrContext) {
        for (count, v) in iac.values.iter().zip(iac.ts.values.iter_mut()) {
            if *count == 0.0 {
                *v = f64::NAN
            }
        }
    }
}

/// All the incremental aggregation functions.
/// Using an enum because this needs to be Send + Sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrementalAggregationHandler {
    Avg(IncrementalAggrAvg),
    Count(IncrementalAggrCount),
    Geomean(IncrementalAggrGeomean),
    Min(IncrementalAggrMin),
    Max(IncrementalAggrMax),
    Sum(IncrementalAggrSum),
    Sum2(IncrementalAggrSum2),
    Any(IncrementalAggrAny),
    Group(IncrementalAggrGroup),
}

impl IncrementalAggregationHandler {
    pub fn handles(func: AggregateFunction) -> bool {
        Self::new(func).is_some()
    }

    pub fn new(func: AggregateFunction) -> Option<Self> {
        use IncrementalAggregationHandler::*;
        let handler = match func {
            AggregateFunction::Avg => Avg(IncrementalAggrAvg),
            AggregateFunction::Count => Count(IncrementalAggrCount),
            AggregateFunction::GeoMean => Geomean(IncrementalAggrGeomean),
            AggregateFunction::Min => Min(IncrementalAggrMin),
            AggregateFunction::Max => Max(IncrementalAggrMax),
            AggregateFunction::Sum => Sum(IncrementalAggrSum),
            AggregateFunction::Sum2 => Sum2(IncrementalAggrSum2),
            AggregateFunction::Any => Any(IncrementalAggrAny),
            AggregateFunction::Group => Group(IncrementalAggrGroup),
            _ => return None,
        };
        Some(handler)
    }

    fn inner(&self) -> &dyn IncrementalAggrHandler {
        use IncrementalAggregationHandler::*;
        match self {
            Avg(h) => h,
            Count(h) => h,
            Geomean(h) => h,
            Min(h) => h,
            Max(h) => h,
            Sum(h) => h,
            Sum2(h) => h,
            Any(h) => h,
            Group(h) => h,
        }
    }

    pub fn update(&self, iac: &mut IncrementalAggrContext, values: &[f64]) {
        self.inner().update(iac, values)
    }

    pub fn merge(&self, dst: &mut IncrementalAggrContext, src: &IncrementalAggrContext) {
        self.inner().merge(dst, src)
    }

    pub fn finalize(&self, iac: &mut IncrementalAggrContext) {
        self.inner().finalize(iac)
    }
}
