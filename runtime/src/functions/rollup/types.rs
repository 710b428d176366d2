use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use crate::functions::rollup::TimeseriesMap;
use crate::types::Timestamp;

/// The state handed to a window function for a single output point.
pub(crate) struct RollupFuncArg<'a> {
    /// The value preceding values if it fits staleness interval.
    pub(crate) prev_value: f64,

    /// The timestamp for prev_value.
    pub(crate) prev_timestamp: Timestamp,

    /// Values that fit window ending at curr_timestamp.
    pub(crate) values: &'a [f64],

    /// Timestamps for values.
    pub(crate) timestamps: &'a [i64],

    /// Real value preceding values.
    /// Is populated if preceding value is within the lookback delta.
    pub(crate) real_prev_value: f64,

    /// Real value which goes after values.
    pub(crate) real_next_value: f64,

    /// Current timestamp for rollup evaluation.
    pub(crate) curr_timestamp: Timestamp,

    /// Index for the currently evaluated point relative to time range for query evaluation.
    pub(crate) idx: usize,

    /// Time window for rollup calculations.
    pub(crate) window: i64,

    /// Output for functions producing several series per input series.
    pub(crate) tsm: Option<&'a mut TimeseriesMap>,
}

impl<'a> Default for RollupFuncArg<'a> {
    fn default() -> Self {
        RollupFuncArg {
            prev_value: f64::NAN,
            prev_timestamp: 0,
            values: &[],
            timestamps: &[],
            real_prev_value: f64::NAN,
            real_next_value: f64::NAN,
            curr_timestamp: 0,
            idx: 0,
            window: 0,
            tsm: None,
        }
    }
}

/// RollupFunc must return rollup value for the given rfa.
///
/// prev_value may be NAN, values and timestamps may be empty.
pub(crate) type RollupFunc = fn(rfa: &RollupFuncArg) -> f64;

/// A window function taking a scalar parameter which may vary per output point,
/// e.g. `quantile_over_time(phi, ...)`.
pub(crate) type RollupFuncWithParam = fn(rfa: &RollupFuncArg, param: f64) -> f64;

/// A window function taking two per-point scalar parameters (`holt_winters`).
pub(crate) type RollupFuncWithParams = fn(rfa: &RollupFuncArg, p1: f64, p2: f64) -> f64;

/// One value per output point. Evaluated function arguments are either broadcast constants or
/// series on the output grid, so a point index is all that is needed to look a value up.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct PointParam(Arc<Vec<f64>>);

impl PointParam {
    pub(crate) fn new(values: Vec<f64>) -> Self {
        PointParam(Arc::new(values))
    }

    #[inline]
    pub(crate) fn get(&self, idx: usize) -> f64 {
        self.0.get(idx).copied().unwrap_or(f64::NAN)
    }
}

/// Per-series output of `quantiles_over_time`.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct QuantilesParams {
    pub(crate) label: String,
    pub(crate) phis: Vec<f64>,
    pub(crate) phi_labels: Vec<String>,
}

#[derive(Clone)]
pub(crate) enum RollupHandler {
    Wrapped(RollupFunc),
    /// Placeholder for meta functions which are expanded into several configs before execution.
    Fake(&'static str),
    FloatArg(PointParam, RollupFuncWithParam),
    TwoFloatArgs(PointParam, PointParam, RollupFuncWithParams),
    Quantiles(Arc<QuantilesParams>),
}

impl RollupHandler {
    pub const fn wrap(f: RollupFunc) -> Self {
        RollupHandler::Wrapped(f)
    }

    pub const fn fake(name: &'static str) -> Self {
        RollupHandler::Fake(name)
    }

    pub(crate) fn eval(&self, rfa: &mut RollupFuncArg) -> f64 {
        match self {
            RollupHandler::Wrapped(f) => f(rfa),
            RollupHandler::Fake(name) => {
                panic!("BUG: {name} shouldn't be called");
            }
            RollupHandler::FloatArg(param, f) => f(rfa, param.get(rfa.idx)),
            RollupHandler::TwoFloatArgs(p1, p2, f) => {
                let idx = rfa.idx;
                f(rfa, p1.get(idx), p2.get(idx))
            }
            RollupHandler::Quantiles(params) => super::quantiles::rollup_quantiles(rfa, params),
        }
    }

    /// Whether the handler writes its output to a [`TimeseriesMap`] instead of returning it.
    pub(crate) fn uses_timeseries_map(&self) -> bool {
        matches!(self, RollupHandler::Quantiles(_))
    }
}

impl Debug for RollupHandler {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RollupHandler::Wrapped(_) => f.write_str("Wrapped"),
            RollupHandler::Fake(name) => write!(f, "Fake({name})"),
            RollupHandler::FloatArg(..) => f.write_str("FloatArg"),
            RollupHandler::TwoFloatArgs(..) => f.write_str("TwoFloatArgs"),
            RollupHandler::Quantiles(params) => write!(f, "Quantiles({:?})", params.phis),
        }
    }
}

impl Default for RollupHandler {
    fn default() -> Self {
        RollupHandler::fake("default")
    }
}
