//! Expression evaluation: the recursive evaluator, per-evaluation configuration and the
//! service container it runs against.
pub use context::*;
pub use eval::eval_expr;
pub use eval_config::{
    adjust_start_end, align_start_end, EvalConfig, DEFAULT_MAX_POINTS_PER_TIMESERIES,
};
pub(crate) use eval_config::{
    eval_number, eval_time, get_timestamps, validate_max_points_per_timeseries,
};
pub use exec::*;

mod binary;
mod context;
mod eval;
mod eval_config;
mod exec;
mod rollup;
