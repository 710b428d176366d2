use crate::common::math::linear_regression;
use crate::functions::rollup::RollupFuncArg;
use crate::types::Timestamp;

/// Change of `dv` over `dt` milliseconds, per second.
#[inline]
fn per_second(dv: f64, dt: i64) -> f64 {
    dv / (dt as f64 / 1e3_f64)
}

/// Replaces every value with the per-second derivative to the next sample. Samples sharing a
/// timestamp with their predecessor repeat the previous derivative.
pub(crate) fn deriv_values(values: &mut [f64], timestamps: &[Timestamp]) {
    let Some(&first) = values.first() else {
        return;
    };
    let (mut prev_value, mut prev_ts) = (first, timestamps[0]);
    let mut deriv = 0.0;

    for i in 1..values.len() {
        let ts = timestamps[i];
        if ts != prev_ts {
            let v = values[i];
            deriv = per_second(v - prev_value, ts - prev_ts);
            prev_value = v;
            prev_ts = ts;
        }
        values[i - 1] = deriv;
    }

    if let Some(last) = values.last_mut() {
        *last = deriv;
    }
}

/// Least-squares slope of the window.
pub(super) fn rollup_deriv_slow(rfa: &RollupFuncArg) -> f64 {
    linear_regression(rfa.values, rfa.timestamps, rfa.curr_timestamp).1
}

/// Serves `deriv_fast` and `rate`: the slope between the sample before the window (or the
/// first one in it) and the last one.
pub(super) fn rollup_deriv_fast(rfa: &RollupFuncArg) -> f64 {
    let (values, timestamps) = (rfa.values, rfa.timestamps);
    let (Some(&v_end), Some(&t_end)) = (values.last(), timestamps.last()) else {
        return if rfa.prev_value.is_nan() { f64::NAN } else { 0.0 };
    };
    let (v_start, t_start) = if !rfa.prev_value.is_nan() {
        (rfa.prev_value, rfa.prev_timestamp)
    } else if values.len() > 1 {
        (values[0], timestamps[0])
    } else {
        // a lone sample says nothing about how fast it was reached
        return f64::NAN;
    };
    per_second(v_end - v_start, t_end - t_start)
}

/// Serves `ideriv` and `irate`: the slope over the last two distinct timestamps.
pub(super) fn rollup_ideriv(rfa: &RollupFuncArg) -> f64 {
    let (values, timestamps) = (rfa.values, rfa.timestamps);
    let n = values.len();
    match n {
        0 => f64::NAN,
        1 if rfa.prev_value.is_nan() => f64::NAN,
        1 => per_second(values[0] - rfa.prev_value, timestamps[0] - rfa.prev_timestamp),
        _ => {
            let (v_end, t_end) = (values[n - 1], timestamps[n - 1]);
            let start = timestamps[..n - 1].iter().rposition(|&t| t < t_end);
            let (v_start, t_start) = match start {
                Some(i) => (values[i], timestamps[i]),
                None if rfa.prev_value.is_nan() => return 0.0,
                None => (rfa.prev_value, rfa.prev_timestamp),
            };
            per_second(v_end - v_start, t_end - t_start)
        }
    }
}

/// Extrapolates the regression line of the window `secs` seconds past the current point.
pub(super) fn rollup_predict_linear(rfa: &RollupFuncArg, secs: f64) -> f64 {
    match linear_regression(rfa.values, rfa.timestamps, rfa.curr_timestamp) {
        (v, _) if v.is_nan() => f64::NAN,
        (v, k) => v + k * secs,
    }
}
