use vmquery_ast::functions::TransformFunction;

use crate::execution::{eval_number, eval_time, EvalConfig};
use crate::runtime_error::{check_arg_count, RuntimeResult};
use crate::types::{QueryValue, Timeseries};

use super::union::{transform_scalar, transform_union, transform_vector};

pub struct TransformFuncArg<'a> {
    pub ec: &'a EvalConfig,
    pub args: Vec<QueryValue>,
    pub keep_metric_names: bool,
}

impl<'a> TransformFuncArg<'a> {
    pub fn new(ec: &'a EvalConfig, args: Vec<QueryValue>, keep_metric_names: bool) -> Self {
        Self {
            ec,
            args,
            keep_metric_names,
        }
    }

    /// Takes ownership of the series for the arg at `idx`. Scalars and strings are broadcast onto
    /// the evaluation grid.
    pub(super) fn take_series(&mut self, idx: usize) -> RuntimeResult<Vec<Timeseries>> {
        let timestamps = self.ec.get_timestamps()?;
        let arg = std::mem::replace(&mut self.args[idx], QueryValue::nan());
        Ok(arg.into_instant_vector(&timestamps))
    }

    fn scalar_values(&self, idx: usize) -> RuntimeResult<Vec<f64>> {
        self.args[idx].get_scalar_values(idx, self.ec.data_points())
    }
}

pub type TransformFuncHandler = fn(&mut TransformFuncArg) -> RuntimeResult<Vec<Timeseries>>;

macro_rules! math_fn {
    ($name: ident, $fname: literal, $func: expr) => {
        fn $name(tfa: &mut TransformFuncArg) -> RuntimeResult<Vec<Timeseries>> {
            check_arg_count($fname, tfa.args.len(), 1, 1)?;
            transform_series(tfa, |values: &mut [f64]| {
                for value in values.iter_mut() {
                    *value = $func(*value)
                }
            })
        }
    };
}

math_fn!(transform_abs, "abs", |x: f64| x.abs());
math_fn!(transform_ceil, "ceil", |x: f64| x.ceil());
math_fn!(transform_exp, "exp", |x: f64| x.exp());
math_fn!(transform_floor, "floor", |x: f64| x.floor());
math_fn!(transform_ln, "ln", |x: f64| x.ln());
math_fn!(transform_sqrt, "sqrt", |x: f64| x.sqrt());

pub fn get_transform_func(f: TransformFunction) -> TransformFuncHandler {
    use TransformFunction::*;
    match f {
        Abs => transform_abs,
        Ceil => transform_ceil,
        ClampMax => transform_clamp_max,
        ClampMin => transform_clamp_min,
        End => transform_end,
        Exp => transform_exp,
        Floor => transform_floor,
        Ln => transform_ln,
        Round => transform_round,
        Scalar => transform_scalar,
        Sqrt => transform_sqrt,
        Start => transform_start,
        Step => transform_step,
        Time => transform_time,
        Union => transform_union,
        Vector => transform_vector,
    }
}

/// Applies `tf` to the values of every series in the first arg. The metric group is dropped
/// unless metric names are kept.
pub(super) fn transform_series(
    tfa: &mut TransformFuncArg,
    mut tf: impl FnMut(&mut [f64]),
) -> RuntimeResult<Vec<Timeseries>> {
    let mut series = tfa.take_series(0)?;
    for ts in series.iter_mut() {
        if !tfa.keep_metric_names {
            ts.metric_name.reset_metric_group();
        }
        tf(&mut ts.values);
    }
    Ok(series)
}

fn transform_round(tfa: &mut TransformFuncArg) -> RuntimeResult<Vec<Timeseries>> {
    check_arg_count("round", tfa.args.len(), 1, 2)?;
    let nearest = if tfa.args.len() == 1 {
        vec![1_f64; tfa.ec.data_points()]
    } else {
        tfa.scalar_values(1)?
    };

    transform_series(tfa, move |values: &mut [f64]| {
        // Ties are rounded up. Dividing by the inverse keeps decimal steps such as 0.1 exact
        // more often than multiplying by them.
        for (v, n) in values.iter_mut().zip(nearest.iter()) {
            let inverse = 1.0 / n;
            *v = (*v * inverse + 0.5).floor() / inverse;
        }
    })
}

fn transform_clamp_max(tfa: &mut TransformFuncArg) -> RuntimeResult<Vec<Timeseries>> {
    check_arg_count("clamp_max", tfa.args.len(), 2, 2)?;
    let max_values = tfa.scalar_values(1)?;
    transform_series(tfa, |values: &mut [f64]| {
        for (v, max) in values.iter_mut().zip(max_values.iter()) {
            if *v > *max {
                *v = *max;
            }
        }
    })
}

fn transform_clamp_min(tfa: &mut TransformFuncArg) -> RuntimeResult<Vec<Timeseries>> {
    check_arg_count("clamp_min", tfa.args.len(), 2, 2)?;
    let min_values = tfa.scalar_values(1)?;
    transform_series(tfa, |values: &mut [f64]| {
        for (v, min) in values.iter_mut().zip(min_values.iter()) {
            if *v < *min {
                *v = *min;
            }
        }
    })
}

fn transform_time(tfa: &mut TransformFuncArg) -> RuntimeResult<Vec<Timeseries>> {
    check_arg_count("time", tfa.args.len(), 0, 0)?;
    eval_time(tfa.ec)
}

fn transform_start(tfa: &mut TransformFuncArg) -> RuntimeResult<Vec<Timeseries>> {
    check_arg_count("start", tfa.args.len(), 0, 0)?;
    eval_number(tfa.ec, tfa.ec.start as f64 / 1e3_f64)
}

fn transform_end(tfa: &mut TransformFuncArg) -> RuntimeResult<Vec<Timeseries>> {
    check_arg_count("end", tfa.args.len(), 0, 0)?;
    eval_number(tfa.ec, tfa.ec.end as f64 / 1e3_f64)
}

fn transform_step(tfa: &mut TransformFuncArg) -> RuntimeResult<Vec<Timeseries>> {
    check_arg_count("step", tfa.args.len(), 0, 0)?;
    eval_number(tfa.ec, tfa.ec.step as f64 / 1e3_f64)
}
