use std::sync::Arc;

use vmquery_ast::functions::RollupFunction;
use vmquery_common::hash::FastHashSet;
use vmquery_common::pool::get_pooled_vec_f64;

use crate::common::math::{is_stale_nan, mad, mode_no_nans, quantile, stddev, stdvar};
use crate::functions::rollup::candlestick::{rollup_close, rollup_high, rollup_low, rollup_open};
use crate::functions::rollup::delta::{
    rollup_delta, rollup_delta_prometheus, rollup_idelta, rollup_increase_pure,
};
use crate::functions::rollup::deriv::{
    rollup_deriv_fast, rollup_deriv_slow, rollup_ideriv, rollup_predict_linear,
};
use crate::functions::rollup::filtered_counts::{
    count_eq, count_gt, count_le, count_ne, share_eq, share_gt, share_le, sum_eq, sum_gt, sum_le,
};
use crate::functions::rollup::hoeffding_bound::{
    rollup_hoeffding_bound_lower, rollup_hoeffding_bound_upper,
};
use crate::functions::rollup::holt_winters::rollup_holt_winters;
use crate::functions::rollup::quantiles::{rollup_outlier_iqr, rollup_quantile};
use crate::functions::rollup::{PointParam, QuantilesParams, RollupFunc, RollupFuncArg, RollupHandler};
use crate::runtime_error::{check_arg_count, RuntimeError, RuntimeResult};
use crate::types::QueryValue;

const NAN: f64 = f64::NAN;

/// The maximum interval without previous rows.
pub const MAX_SILENCE_INTERVAL: i64 = 5 * 60 * 1000;

pub(crate) const FN_FAKE: RollupHandler = RollupHandler::fake("rollup_fake");

/// Returns the plain window function implementing `func`, if there is one. Functions taking
/// extra arguments and the `rollup*` meta functions have none.
pub(crate) fn get_rollup_fn(func: RollupFunction) -> RuntimeResult<RollupFunc> {
    use RollupFunction::*;

    let res: RollupFunc = match func {
        AbsentOverTime => rollup_absent,
        AscentOverTime => rollup_ascent_over_time,
        AvgOverTime => rollup_avg,
        Changes => rollup_changes,
        ChangesPrometheus => rollup_changes_prometheus,
        CountOverTime => rollup_count,
        DecreasesOverTime => rollup_resets,
        DefaultRollup => rollup_default,
        Delta => rollup_delta,
        DeltaPrometheus => rollup_delta_prometheus,
        Deriv => rollup_deriv_slow,
        DerivFast => rollup_deriv_fast,
        DescentOverTime => rollup_descent_over_time,
        DistinctOverTime => rollup_distinct,
        FirstOverTime => rollup_first,
        GeomeanOverTime => rollup_geomean,
        IDelta => rollup_idelta,
        IDeriv => rollup_ideriv,
        Increase => rollup_delta,
        IncreasePrometheus => rollup_delta_prometheus,
        IncreasePure => rollup_increase_pure,
        IncreasesOverTime => rollup_increases,
        Integrate => rollup_integrate,
        IQROverTime => rollup_outlier_iqr,
        IRate => rollup_ideriv,
        Lag => rollup_lag,
        LastOverTime => rollup_default,
        Lifetime => rollup_lifetime,
        MadOverTime => rollup_mad,
        MaxOverTime => rollup_max,
        MedianOverTime => rollup_median,
        MinOverTime => rollup_min,
        ModeOverTime => rollup_mode_over_time,
        OutlierIQROverTime => rollup_outlier_iqr,
        PresentOverTime => rollup_present,
        RangeOverTime => rollup_range,
        Rate => rollup_deriv_fast,
        RateOverSum => rollup_rate_over_sum,
        Resets => rollup_resets,
        ScrapeInterval => rollup_scrape_interval,
        StaleSamplesOverTime => rollup_stale_samples,
        StddevOverTime => rollup_stddev,
        StdvarOverTime => rollup_stdvar,
        SumOverTime => rollup_sum,
        Sum2OverTime => rollup_sum2,
        TFirstOverTime => rollup_tfirst,
        Timestamp => rollup_tlast,
        TimestampWithName => rollup_tlast,
        TLastChangeOverTime => rollup_tlast_change,
        TLastOverTime => rollup_tlast,
        TMaxOverTime => rollup_tmax,
        TMinOverTime => rollup_tmin,
        ZScoreOverTime => rollup_zscore_over_time,
        _ => {
            return Err(RuntimeError::General(format!(
                "{} cannot be used as a plain window function",
                func.name()
            )))
        }
    };

    Ok(res)
}

/// Builds the handler for `func` from its evaluated arguments. The argument at the position
/// of the series selector is ignored. `points` is the number of output points; per-point
/// parameters are expanded to it.
pub(crate) fn get_rollup_handler(
    func: RollupFunction,
    args: &[QueryValue],
    points: usize,
) -> RuntimeResult<RollupHandler> {
    use RollupFunction::*;

    let name = func.name();
    let expect_args = |n: usize| check_arg_count(name, args.len(), n, n);
    let param = |idx: usize| -> RuntimeResult<PointParam> {
        Ok(PointParam::new(args[idx].get_scalar_values(idx, points)?))
    };

    let handler = match func {
        AggrOverTime => {
            check_arg_count(name, args.len(), 2, usize::MAX)?;
            FN_FAKE
        }
        Rollup | RollupCandlestick | RollupDelta | RollupDeriv | RollupIncrease | RollupRate
        | RollupScrapeInterval => {
            check_arg_count(name, args.len(), 1, 2)?;
            FN_FAKE
        }
        CountEqOverTime => filter_handler(&expect_args, param(1)?, count_eq)?,
        CountGtOverTime => filter_handler(&expect_args, param(1)?, count_gt)?,
        CountLeOverTime => filter_handler(&expect_args, param(1)?, count_le)?,
        CountNeOverTime => filter_handler(&expect_args, param(1)?, count_ne)?,
        ShareEqOverTime => filter_handler(&expect_args, param(1)?, share_eq)?,
        ShareGtOverTime => filter_handler(&expect_args, param(1)?, share_gt)?,
        ShareLeOverTime => filter_handler(&expect_args, param(1)?, share_le)?,
        SumEqOverTime => filter_handler(&expect_args, param(1)?, sum_eq)?,
        SumGtOverTime => filter_handler(&expect_args, param(1)?, sum_gt)?,
        SumLeOverTime => filter_handler(&expect_args, param(1)?, sum_le)?,
        DurationOverTime => {
            expect_args(2)?;
            RollupHandler::FloatArg(param(1)?, rollup_duration_over_time)
        }
        HoeffdingBoundLower => {
            expect_args(2)?;
            RollupHandler::FloatArg(param(0)?, rollup_hoeffding_bound_lower)
        }
        HoeffdingBoundUpper => {
            expect_args(2)?;
            RollupHandler::FloatArg(param(0)?, rollup_hoeffding_bound_upper)
        }
        HoltWinters => {
            expect_args(3)?;
            RollupHandler::TwoFloatArgs(param(1)?, param(2)?, rollup_holt_winters)
        }
        PredictLinear => {
            expect_args(2)?;
            RollupHandler::FloatArg(param(1)?, rollup_predict_linear)
        }
        QuantileOverTime => {
            expect_args(2)?;
            RollupHandler::FloatArg(param(0)?, rollup_quantile)
        }
        QuantilesOverTime => new_rollup_quantiles(args)?,
        _ => {
            expect_args(1)?;
            RollupHandler::wrap(get_rollup_fn(func)?)
        }
    };

    Ok(handler)
}

fn filter_handler(
    expect_args: &dyn Fn(usize) -> RuntimeResult<()>,
    limits: PointParam,
    f: fn(&RollupFuncArg, f64) -> f64,
) -> RuntimeResult<RollupHandler> {
    expect_args(2)?;
    Ok(RollupHandler::FloatArg(limits, f))
}

fn new_rollup_quantiles(args: &[QueryValue]) -> RuntimeResult<RollupHandler> {
    if args.len() < 3 {
        return Err(RuntimeError::ArgumentError(format!(
            "unexpected number of args: {}; want at least 3 args",
            args.len()
        )));
    }
    let label = args[0].get_string(0)?;
    let phi_args = &args[1..args.len() - 1];
    let mut phis = Vec::with_capacity(phi_args.len());
    let mut phi_labels = Vec::with_capacity(phi_args.len());
    for (i, arg) in phi_args.iter().enumerate() {
        let phi = arg.get_scalar(i + 1).map_err(|err| {
            RuntimeError::ArgumentError(format!("cannot obtain phi from arg #{}: {err}", i + 1))
        })?;
        phis.push(phi);
        phi_labels.push(format!("{phi}"));
    }
    Ok(RollupHandler::Quantiles(Arc::new(QuantilesParams {
        label,
        phis,
        phi_labels,
    })))
}

pub(super) fn rollup_avg(rfa: &RollupFuncArg) -> f64 {
    // Do not take into account rfa.prev_value, since it may lead
    // to inconsistent results comparing to Prometheus on broken time series
    // with irregular data points.
    let values = rfa.values;
    if values.is_empty() {
        return NAN;
    }
    let sum: f64 = values.iter().sum();
    sum / values.len() as f64
}

pub(super) fn rollup_min(rfa: &RollupFuncArg) -> f64 {
    let values = rfa.values;
    if values.is_empty() {
        return NAN;
    }
    values.iter().copied().fold(values[0], |min, v| if v < min { v } else { min })
}

pub(super) fn rollup_max(rfa: &RollupFuncArg) -> f64 {
    let values = rfa.values;
    if values.is_empty() {
        return NAN;
    }
    values.iter().copied().fold(values[0], |max, v| if v > max { v } else { max })
}

pub(super) fn rollup_median(rfa: &RollupFuncArg) -> f64 {
    quantile(0.5, rfa.values)
}

pub(super) fn rollup_mad(rfa: &RollupFuncArg) -> f64 {
    mad(rfa.values)
}

pub(super) fn rollup_tmin(rfa: &RollupFuncArg) -> f64 {
    let values = rfa.values;
    let timestamps = rfa.timestamps;
    if values.is_empty() {
        return NAN;
    }
    let mut min_value = values[0];
    let mut min_timestamp = timestamps[0];
    for (v, ts) in values.iter().zip(timestamps.iter()) {
        // Get the last timestamp for the minimum value as most users expect.
        if *v <= min_value {
            min_value = *v;
            min_timestamp = *ts;
        }
    }
    min_timestamp as f64 / 1e3
}

pub(super) fn rollup_tmax(rfa: &RollupFuncArg) -> f64 {
    let values = rfa.values;
    let timestamps = rfa.timestamps;
    if values.is_empty() {
        return NAN;
    }
    let mut max_value = values[0];
    let mut max_timestamp = timestamps[0];
    for (v, ts) in values.iter().zip(timestamps.iter()) {
        // Get the last timestamp for the maximum value as most users expect.
        if *v >= max_value {
            max_value = *v;
            max_timestamp = *ts;
        }
    }
    max_timestamp as f64 / 1e3
}

pub(super) fn rollup_tfirst(rfa: &RollupFuncArg) -> f64 {
    match rfa.timestamps.first() {
        Some(ts) => *ts as f64 / 1e3,
        None => NAN,
    }
}

pub(super) fn rollup_tlast(rfa: &RollupFuncArg) -> f64 {
    match rfa.timestamps.last() {
        Some(ts) => *ts as f64 / 1e3,
        None => NAN,
    }
}

pub(super) fn rollup_tlast_change(rfa: &RollupFuncArg) -> f64 {
    let values = rfa.values;
    if values.is_empty() {
        return NAN;
    }
    let timestamps = rfa.timestamps;
    let last = values.len() - 1;
    let last_value = values[last];
    for i in (0..last).rev() {
        if values[i] != last_value {
            return timestamps[i + 1] as f64 / 1e3;
        }
    }
    if rfa.prev_value.is_nan() || rfa.prev_value != last_value {
        return timestamps[0] as f64 / 1e3;
    }
    NAN
}

pub(super) fn rollup_sum(rfa: &RollupFuncArg) -> f64 {
    if rfa.values.is_empty() {
        return NAN;
    }
    rfa.values.iter().sum()
}

pub(super) fn rollup_rate_over_sum(rfa: &RollupFuncArg) -> f64 {
    if rfa.timestamps.is_empty() {
        return NAN;
    }
    let sum: f64 = rfa.values.iter().sum();
    sum / (rfa.window as f64 / 1e3)
}

pub(super) fn rollup_range(rfa: &RollupFuncArg) -> f64 {
    rollup_max(rfa) - rollup_min(rfa)
}

pub(super) fn rollup_sum2(rfa: &RollupFuncArg) -> f64 {
    if rfa.values.is_empty() {
        return NAN;
    }
    rfa.values.iter().map(|v| v * v).sum()
}

pub(super) fn rollup_geomean(rfa: &RollupFuncArg) -> f64 {
    let values = rfa.values;
    if values.is_empty() {
        return NAN;
    }
    let p: f64 = values.iter().product();
    p.powf(1.0 / values.len() as f64)
}

pub(super) fn rollup_absent(rfa: &RollupFuncArg) -> f64 {
    if rfa.values.is_empty() {
        return 1.0;
    }
    NAN
}

pub(super) fn rollup_present(rfa: &RollupFuncArg) -> f64 {
    if !rfa.values.is_empty() {
        return 1.0;
    }
    NAN
}

pub(super) fn rollup_count(rfa: &RollupFuncArg) -> f64 {
    if rfa.values.is_empty() {
        return NAN;
    }
    rfa.values.len() as f64
}

pub(super) fn rollup_stale_samples(rfa: &RollupFuncArg) -> f64 {
    if rfa.values.is_empty() {
        return NAN;
    }
    rfa.values.iter().filter(|v| is_stale_nan(**v)).count() as f64
}

pub(super) fn rollup_stddev(rfa: &RollupFuncArg) -> f64 {
    stddev(rfa.values)
}

pub(super) fn rollup_stdvar(rfa: &RollupFuncArg) -> f64 {
    stdvar(rfa.values)
}

/// Differences smaller than this relative to the value are float noise, not changes.
#[inline]
fn is_precision_error(v: f64, prev_value: f64) -> bool {
    (v - prev_value).abs() < 1e-12 * v.abs()
}

pub(super) fn rollup_changes_prometheus(rfa: &RollupFuncArg) -> f64 {
    // Do not take into account rfa.prev_value like Prometheus does.
    let values = rfa.values;
    if values.is_empty() {
        return NAN;
    }
    let mut prev_value = values[0];
    let mut n = 0;
    for v in &values[1..] {
        if *v != prev_value {
            if is_precision_error(*v, prev_value) {
                continue;
            }
            n += 1;
            prev_value = *v;
        }
    }
    n as f64
}

pub(super) fn rollup_changes(rfa: &RollupFuncArg) -> f64 {
    let mut values = rfa.values;
    let mut prev_value = rfa.prev_value;
    let mut n = 0;
    if prev_value.is_nan() {
        if values.is_empty() {
            return NAN;
        }
        prev_value = values[0];
        values = &values[1..];
        n += 1;
    }
    for v in values {
        if *v != prev_value {
            if is_precision_error(*v, prev_value) {
                continue;
            }
            n += 1;
            prev_value = *v;
        }
    }
    n as f64
}

pub(super) fn rollup_increases(rfa: &RollupFuncArg) -> f64 {
    let mut values = rfa.values;
    if values.is_empty() {
        if rfa.prev_value.is_nan() {
            return NAN;
        }
        return 0.0;
    }
    let mut prev_value = rfa.prev_value;
    if prev_value.is_nan() {
        prev_value = values[0];
        values = &values[1..];
    }
    let mut n = 0;
    for v in values {
        if *v > prev_value && !is_precision_error(*v, prev_value) {
            n += 1;
        }
        prev_value = *v;
    }
    n as f64
}

/// `decreases_over_time` logic is the same as `resets` logic.
pub(super) fn rollup_resets(rfa: &RollupFuncArg) -> f64 {
    let mut values = rfa.values;
    if values.is_empty() {
        if rfa.prev_value.is_nan() {
            return NAN;
        }
        return 0.0;
    }
    let mut prev_value = rfa.prev_value;
    if prev_value.is_nan() {
        prev_value = values[0];
        values = &values[1..];
    }
    let mut n = 0;
    for v in values {
        if *v < prev_value && !is_precision_error(*v, prev_value) {
            n += 1;
        }
        prev_value = *v;
    }
    n as f64
}

pub(super) fn rollup_lifetime(rfa: &RollupFuncArg) -> f64 {
    // Calculate the duration between the first and the last data points.
    let timestamps = rfa.timestamps;
    if rfa.prev_value.is_nan() {
        if timestamps.len() < 2 {
            return NAN;
        }
        return (timestamps[timestamps.len() - 1] - timestamps[0]) as f64 / 1e3;
    }
    match timestamps.last() {
        Some(last) => (last - rfa.prev_timestamp) as f64 / 1e3,
        None => NAN,
    }
}

pub(super) fn rollup_lag(rfa: &RollupFuncArg) -> f64 {
    // Calculate the duration between the current timestamp and the last data point.
    match rfa.timestamps.last() {
        Some(last) => (rfa.curr_timestamp - last) as f64 / 1e3,
        None => {
            if rfa.prev_value.is_nan() {
                return NAN;
            }
            (rfa.curr_timestamp - rfa.prev_timestamp) as f64 / 1e3
        }
    }
}

pub(super) fn rollup_scrape_interval(rfa: &RollupFuncArg) -> f64 {
    // Calculate the average interval between data points.
    let timestamps = rfa.timestamps;
    if rfa.prev_value.is_nan() {
        if timestamps.len() < 2 {
            return NAN;
        }
        let span = (timestamps[timestamps.len() - 1] - timestamps[0]) as f64 / 1e3;
        return span / (timestamps.len() - 1) as f64;
    }
    match timestamps.last() {
        Some(last) => ((last - rfa.prev_timestamp) as f64 / 1e3) / timestamps.len() as f64,
        None => NAN,
    }
}

pub(super) fn rollup_mode_over_time(rfa: &RollupFuncArg) -> f64 {
    // mode_no_nans reorders its input, so work on a copy.
    let mut a = get_pooled_vec_f64(rfa.values.len());
    a.extend_from_slice(rfa.values);
    mode_no_nans(rfa.prev_value, &mut a)
}

pub(super) fn rollup_ascent_over_time(rfa: &RollupFuncArg) -> f64 {
    let mut values = rfa.values;
    let mut prev_value = rfa.prev_value;
    if prev_value.is_nan() {
        if values.is_empty() {
            return NAN;
        }
        prev_value = values[0];
        values = &values[1..];
    }
    let mut s = 0.0;
    for v in values {
        let d = v - prev_value;
        if d > 0.0 {
            s += d;
        }
        prev_value = *v;
    }
    s
}

pub(super) fn rollup_descent_over_time(rfa: &RollupFuncArg) -> f64 {
    let mut values = rfa.values;
    let mut prev_value = rfa.prev_value;
    if prev_value.is_nan() {
        if values.is_empty() {
            return NAN;
        }
        prev_value = values[0];
        values = &values[1..];
    }
    let mut s = 0.0;
    for v in values {
        let d = prev_value - v;
        if d > 0.0 {
            s += d;
        }
        prev_value = *v;
    }
    s
}

pub(super) fn rollup_zscore_over_time(rfa: &RollupFuncArg) -> f64 {
    // See https://about.gitlab.com/blog/2019/07/23/anomaly-detection-using-prometheus/#using-z-score-for-anomaly-detection
    let scrape_interval = rollup_scrape_interval(rfa);
    let lag = rollup_lag(rfa);
    if scrape_interval.is_nan() || lag.is_nan() || lag > scrape_interval {
        return NAN;
    }
    let d = rollup_default(rfa) - rollup_avg(rfa);
    if d == 0.0 {
        return 0.0;
    }
    d / rollup_stddev(rfa)
}

pub(super) fn rollup_first(rfa: &RollupFuncArg) -> f64 {
    rfa.values.first().copied().unwrap_or(NAN)
}

/// Also serves `last_over_time`.
pub(super) fn rollup_default(rfa: &RollupFuncArg) -> f64 {
    // Intentionally do not skip the possible last Prometheus staleness mark.
    rfa.values.last().copied().unwrap_or(NAN)
}

pub(super) fn rollup_distinct(rfa: &RollupFuncArg) -> f64 {
    let values = rfa.values;
    if values.is_empty() {
        return NAN;
    }
    let set: FastHashSet<u64> = values.iter().map(|v| v.to_bits()).collect();
    set.len() as f64
}

pub(super) fn rollup_integrate(rfa: &RollupFuncArg) -> f64 {
    let mut values = rfa.values;
    let mut timestamps = rfa.timestamps;
    let mut prev_value = rfa.prev_value;
    let mut prev_timestamp = rfa.curr_timestamp - rfa.window;
    if prev_value.is_nan() {
        if values.is_empty() {
            return NAN;
        }
        prev_value = values[0];
        prev_timestamp = timestamps[0];
        values = &values[1..];
        timestamps = &timestamps[1..];
    }

    let mut sum = 0.0;
    for (v, ts) in values.iter().zip(timestamps.iter()) {
        let dt = (ts - prev_timestamp) as f64 / 1e3;
        sum += prev_value * dt;
        prev_timestamp = *ts;
        prev_value = *v;
    }
    let dt = (rfa.curr_timestamp - prev_timestamp) as f64 / 1e3;
    sum + prev_value * dt
}

pub(super) fn rollup_duration_over_time(rfa: &RollupFuncArg, max_interval: f64) -> f64 {
    let timestamps = rfa.timestamps;
    if timestamps.is_empty() {
        return NAN;
    }
    let d_max = (max_interval * 1000.0) as i64;
    let mut t_prev = timestamps[0];
    let mut d_sum: i64 = 0;
    for t in timestamps {
        let d = t - t_prev;
        if d <= d_max {
            d_sum += d;
        }
        t_prev = *t;
    }
    d_sum as f64 / 1e3
}

/// Window functions used by the `rollup*` meta functions, keyed by the `rollup` tag value.
pub(super) fn get_rollup_tag_fn(tag: &str) -> Option<RollupFunc> {
    let f: RollupFunc = match tag {
        "min" => rollup_min,
        "max" => rollup_max,
        "avg" => rollup_avg,
        "open" => rollup_open,
        "close" => rollup_close,
        "low" => rollup_low,
        "high" => rollup_high,
        _ => return None,
    };
    Some(f)
}
