use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

use vmquery_ast::expr::{Expr, FunctionExpr};
use vmquery_ast::functions::{BuiltinFunction, RollupFunction, TransformFunction};

use crate::common::math::quantile;
use crate::execution::validate_max_points_per_timeseries;
use crate::functions::rollup::delta::delta_values;
use crate::functions::rollup::deriv::deriv_values;
use crate::functions::rollup::rollup_fns::{get_rollup_fn, get_rollup_tag_fn};
use crate::functions::rollup::{RollupFuncArg, RollupHandler, TimeseriesMap};
use crate::runtime_error::{RuntimeError, RuntimeResult};
use crate::types::Timestamp;

/// Transformations applied in place to raw samples before window functions see them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PreFunction {
    RemoveCounterResets,
    DeltaValues,
    DerivValues,
    /// Replaces values with the interval in seconds to the preceding sample.
    SampleIntervals,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct PreFunctions {
    funcs: Vec<PreFunction>,
    /// Gap after which counter reset correction starts over. Zero disables the check.
    staleness_interval: i64,
}

impl PreFunctions {
    fn push(&mut self, f: PreFunction) {
        self.funcs.push(f)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }

    pub(crate) fn apply(&self, values: &mut [f64], timestamps: &[Timestamp]) {
        for f in &self.funcs {
            match f {
                PreFunction::RemoveCounterResets => {
                    remove_counter_resets(values, timestamps, self.staleness_interval)
                }
                PreFunction::DeltaValues => delta_values(values),
                PreFunction::DerivValues => deriv_values(values, timestamps),
                PreFunction::SampleIntervals => sample_intervals(values, timestamps),
            }
        }
    }
}

/// Makes counter values monotonic. A drop by less than 1/8 of the previous value is treated
/// as a partial reset.
pub(crate) fn remove_counter_resets(
    values: &mut [f64],
    timestamps: &[Timestamp],
    staleness_interval: i64,
) {
    // There is no need in handling NaNs here, since they are impossible
    // on values from storage.
    if values.is_empty() {
        return;
    }
    let mut correction: f64 = 0.0;
    let mut prev_value = values[0];
    for i in 0..values.len() {
        let v = values[i];
        let d = v - prev_value;
        if d < 0.0 {
            if (-d * 8.0) < prev_value {
                // See https://github.com/VictoriaMetrics/VictoriaMetrics/issues/2787
                correction += prev_value - v;
            } else {
                correction += prev_value;
            }
        }
        if i > 0 && staleness_interval > 0 {
            let gap = timestamps[i] - timestamps[i - 1];
            if gap > staleness_interval {
                // See https://github.com/VictoriaMetrics/VictoriaMetrics/issues/8072
                correction = 0.0;
                prev_value = v;
                continue;
            }
        }
        prev_value = v;
        values[i] = v + correction;
        // Float rounding may still produce a tiny decrease.
        // See https://github.com/VictoriaMetrics/VictoriaMetrics/issues/5571
        if i > 0 && values[i] < values[i - 1] {
            values[i] = values[i - 1];
        }
    }
}

fn sample_intervals(values: &mut [f64], timestamps: &[Timestamp]) {
    let mut ts_secs_prev = f64::NAN;
    for (value, ts) in values.iter_mut().zip(timestamps.iter()) {
        let ts_secs = *ts as f64 / 1000.0;
        *value = ts_secs - ts_secs_prev;
        ts_secs_prev = ts_secs;
    }

    if values.len() > 1 {
        // min, max and avg don't expect NaNs, so overwrite the first interval with the second.
        values[0] = values[1]
    }
}

/// Everything needed to run a window function over the samples of one series.
#[derive(Clone, Debug)]
pub(crate) struct RollupConfig {
    /// This tag value must be added to "rollup" tag if non-empty.
    pub tag_value: String,
    pub handler: RollupHandler,
    pub start: Timestamp,
    pub end: Timestamp,
    pub step: i64,
    pub window: i64,

    /// Whether window may be adjusted to 2 x interval between data points.
    /// This is needed for functions which have dt in the denominator
    /// such as rate, deriv, etc.
    /// Without the adjustment their value would jump in unexpected directions
    /// when using window smaller than 2 x scrape_interval.
    pub may_adjust_window: bool,

    pub timestamps: Arc<Vec<i64>>,

    /// lookback_delta is the analog to `-query.lookback-delta` from Prometheus world.
    pub lookback_delta: i64,

    /// Whether default_rollup is used.
    pub is_default_rollup: bool,

    /// The maximum number of points which can be generated per each series.
    pub max_points_per_series: usize,

    /// The estimated number of samples scanned per handler call.
    ///
    /// If zero, then it is considered that the handler scans all the samples passed to it.
    pub samples_scanned_per_call: usize,
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            tag_value: String::new(),
            handler: RollupHandler::fake("uninitialized"),
            start: 0,
            end: 0,
            step: 0,
            window: 0,
            may_adjust_window: false,
            timestamps: Arc::new(vec![]),
            lookback_delta: 0,
            is_default_rollup: false,
            max_points_per_series: 0,
            samples_scanned_per_call: 0,
        }
    }
}

impl Display for RollupConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "timeRange=[{}..{}], step={}, window={}, points={}",
            self.start,
            self.end,
            self.step,
            self.window,
            self.timestamps.len()
        )
    }
}

impl RollupConfig {
    fn with_handler(&self, handler: RollupHandler, tag_value: &str) -> Self {
        RollupConfig {
            tag_value: tag_value.to_string(),
            handler,
            timestamps: Arc::clone(&self.timestamps),
            ..*self
        }
    }

    /// Calculates rollup for the given timestamps and values, appends
    /// them to dst_values and returns the number of samples scanned.
    ///
    /// self.timestamps are used as timestamps for dst_values.
    ///
    /// timestamps must cover time range [start - window - MAX_SILENCE_INTERVAL ... end].
    pub(crate) fn exec(
        &self,
        dst_values: &mut Vec<f64>,
        values: &[f64],
        timestamps: &[Timestamp],
    ) -> RuntimeResult<u64> {
        self.do_internal(dst_values, None, values, timestamps)
    }

    /// Calculates rollup for the given timestamps and values and puts them to tsm.
    pub(crate) fn do_timeseries_map(
        &self,
        tsm: &mut TimeseriesMap,
        values: &[f64],
        timestamps: &[Timestamp],
    ) -> RuntimeResult<u64> {
        let mut scratch = Vec::with_capacity(self.timestamps.len());
        self.do_internal(&mut scratch, Some(tsm), values, timestamps)
    }

    fn do_internal(
        &self,
        dst_values: &mut Vec<f64>,
        mut tsm: Option<&mut TimeseriesMap>,
        values: &[f64],
        timestamps: &[Timestamp],
    ) -> RuntimeResult<u64> {
        self.validate();

        dst_values.reserve(self.timestamps.len());

        // Use step as the scrape interval for instant queries (when start == end).
        let mut max_prev_interval = self.step;
        if self.start < self.end {
            let scrape_interval = get_scrape_interval(timestamps, self.step);
            max_prev_interval = get_max_prev_interval(scrape_interval);
        }
        if self.lookback_delta > 0 && max_prev_interval > self.lookback_delta {
            max_prev_interval = self.lookback_delta
        }

        let mut window = self.window;
        if window <= 0 {
            window = self.step;
            if self.may_adjust_window && window < max_prev_interval {
                // Adjust lookbehind window only if it isn't set explicitly, e.g. rate(foo).
                // An explicit window such as rate(foo[1s]) is left untouched.
                // See https://github.com/VictoriaMetrics/VictoriaMetrics/issues/3483
                window = max_prev_interval
            }
            if self.is_default_rollup && self.lookback_delta > 0 && window > self.lookback_delta {
                // Implicit window exceeds the lookback delta, so limit it.
                // See https://github.com/VictoriaMetrics/VictoriaMetrics/issues/784
                window = self.lookback_delta
            }
        }

        let mut i = 0;
        let mut j = 0;
        let mut ni = 0;
        let mut nj = 0;

        let mut samples_scanned = values.len() as u64;
        let samples_scanned_per_call = self.samples_scanned_per_call as u64;

        for (idx, t_end) in self.timestamps.iter().enumerate() {
            let t_end = *t_end;
            let t_start = t_end - window;
            ni = seek_first_timestamp_idx_after(&timestamps[i..], t_start, ni);
            i += ni;
            if j < i {
                j = i;
            }

            nj = seek_first_timestamp_idx_after(&timestamps[j..], t_end, nj);
            j += nj;

            let mut prev_value = f64::NAN;
            let mut prev_timestamp = t_start - max_prev_interval;
            if i > 0 && i < timestamps.len() && timestamps[i - 1] > prev_timestamp {
                prev_value = values[i - 1];
                prev_timestamp = timestamps[i - 1];
            }

            let window_timestamps = &timestamps[i..j];
            let mut real_prev_value = f64::NAN;
            if i > 0 {
                // The previous sample only counts if it is within the lookback delta
                // of the first sample in the window.
                // See https://github.com/VictoriaMetrics/VictoriaMetrics/issues/894
                let curr_timestamp = window_timestamps.first().copied().unwrap_or(t_start);
                if self.lookback_delta == 0
                    || (curr_timestamp - timestamps[i - 1]) < self.lookback_delta
                {
                    real_prev_value = values[i - 1];
                }
            }

            let mut rfa = RollupFuncArg {
                prev_value,
                prev_timestamp,
                values: &values[i..j],
                timestamps: window_timestamps,
                real_prev_value,
                real_next_value: values.get(j).copied().unwrap_or(f64::NAN),
                curr_timestamp: t_end,
                idx,
                window,
                tsm: tsm.as_deref_mut(),
            };
            let value = self.handler.eval(&mut rfa);

            if samples_scanned_per_call > 0 {
                samples_scanned += samples_scanned_per_call
            } else {
                samples_scanned += (j - i) as u64;
            }

            dst_values.push(value);
        }

        Ok(samples_scanned)
    }

    fn validate(&self) {
        if self.step <= 0 {
            panic!("BUG: step must be bigger than 0; got {}", self.step);
        }
        if self.start > self.end {
            panic!(
                "BUG: start cannot exceed end; got {} vs {}",
                self.start, self.end
            );
        }
        if self.window < 0 {
            panic!("BUG: window must be non-negative; got {}", self.window);
        }
        if let Err(err) = validate_max_points_per_timeseries(
            self.start,
            self.end,
            self.step,
            self.max_points_per_series,
        ) {
            panic!("BUG: {err}; this must be validated before the call to RollupConfig::exec");
        }
    }
}

/// Parameters shared by all configs built for one rollup expression.
#[derive(Clone, Debug)]
pub(crate) struct RollupConfigParams {
    pub start: Timestamp,
    pub end: Timestamp,
    pub step: i64,
    pub window: i64,
    pub max_points_per_series: usize,
    pub lookback_delta: i64,
    pub timestamps: Arc<Vec<i64>>,
}

/// Expands a rollup function call into the configs it evaluates and the pre-processing applied
/// to raw samples first. The `rollup*` meta functions and `aggr_over_time` produce one config
/// per output tag; everything else produces a single untagged config.
pub(crate) fn get_rollup_configs(
    func: RollupFunction,
    handler: &RollupHandler,
    expr: &Expr,
    params: &RollupConfigParams,
) -> RuntimeResult<(PreFunctions, Vec<RollupConfig>)> {
    let mut pre_funcs = PreFunctions::default();
    if params.lookback_delta != 0 {
        // The window is added so that samples captured as prev_value in do_internal are
        // corrected the same way.
        pre_funcs.staleness_interval = params.lookback_delta + params.window;
    }

    if func.should_remove_counter_resets() {
        pre_funcs.push(PreFunction::RemoveCounterResets);
    }

    let template = RollupConfig {
        tag_value: String::new(),
        handler: RollupHandler::default(),
        start: params.start,
        end: params.end,
        step: params.step,
        window: params.window,
        may_adjust_window: func.can_adjust_window(),
        lookback_delta: params.lookback_delta,
        timestamps: Arc::clone(&params.timestamps),
        is_default_rollup: func == RollupFunction::DefaultRollup,
        max_points_per_series: params.max_points_per_series,
        samples_scanned_per_call: func.samples_scanned_per_call().unwrap_or(0),
    };

    let tagged = |tag: &str, tag_value: &str| -> RuntimeResult<RollupConfig> {
        let f = get_rollup_tag_fn(tag)
            .ok_or_else(|| RuntimeError::General(format!("BUG: unknown rollup tag {tag}")))?;
        Ok(template.with_handler(RollupHandler::wrap(f), tag_value))
    };

    let append_min_max_avg = |dst: &mut Vec<RollupConfig>| -> RuntimeResult<()> {
        match get_rollup_tag(expr)? {
            Some(tag @ ("min" | "max" | "avg")) => dst.push(tagged(tag, "")?),
            Some(tag) => {
                return Err(RuntimeError::ArgumentError(format!(
                    "unexpected second arg for {expr}: {tag:?}; want `min`, `max` or `avg`"
                )))
            }
            None => {
                for tag in ["min", "max", "avg"] {
                    dst.push(tagged(tag, tag)?)
                }
            }
        }
        Ok(())
    };

    let mut rcs: Vec<RollupConfig> = Vec::with_capacity(4);
    match func {
        RollupFunction::Rollup => append_min_max_avg(&mut rcs)?,
        RollupFunction::RollupRate | RollupFunction::RollupDeriv => {
            pre_funcs.push(PreFunction::DerivValues);
            append_min_max_avg(&mut rcs)?;
        }
        RollupFunction::RollupIncrease | RollupFunction::RollupDelta => {
            pre_funcs.push(PreFunction::DeltaValues);
            append_min_max_avg(&mut rcs)?;
        }
        RollupFunction::RollupScrapeInterval => {
            pre_funcs.push(PreFunction::SampleIntervals);
            append_min_max_avg(&mut rcs)?;
        }
        RollupFunction::RollupCandlestick => match get_rollup_tag(expr)? {
            Some(tag @ ("open" | "close" | "low" | "high")) => rcs.push(tagged(tag, tag)?),
            Some(tag) => {
                return Err(RuntimeError::ArgumentError(format!(
                    "unexpected second arg for {expr}: {tag:?}; want `open`, `close`, `low` or `high`"
                )))
            }
            None => {
                for tag in ["open", "close", "low", "high"] {
                    rcs.push(tagged(tag, tag)?)
                }
            }
        },
        RollupFunction::AggrOverTime => {
            let funcs = get_rollup_aggr_funcs(expr).map_err(|err| {
                RuntimeError::ArgumentError(format!("invalid args to {expr}: {err}"))
            })?;
            for rf in funcs {
                if rf.should_remove_counter_resets() && pre_funcs.is_empty() {
                    pre_funcs.push(PreFunction::RemoveCounterResets);
                }
                let handler = RollupHandler::wrap(get_rollup_fn(rf)?);
                rcs.push(template.with_handler(handler, rf.name()));
            }
        }
        _ => rcs.push(template.with_handler(handler.clone(), "")),
    }

    Ok((pre_funcs, rcs))
}

/// Returns the index of the first timestamp after seek_timestamp. n_hint is the result of the
/// previous call and bounds a linear scan before falling back to binary search.
pub(crate) fn seek_first_timestamp_idx_after(
    timestamps: &[Timestamp],
    seek_timestamp: Timestamp,
    n_hint: usize,
) -> usize {
    let mut timestamps = timestamps;
    let count = timestamps.len();

    if count == 0 || timestamps[0] > seek_timestamp {
        return 0;
    }
    let mut start_idx = n_hint.saturating_sub(2).min(count - 1);
    let mut end_idx = (n_hint + 2).min(count);

    if start_idx > 0 && timestamps[start_idx] <= seek_timestamp {
        timestamps = &timestamps[start_idx..];
        end_idx -= start_idx
    } else {
        start_idx = 0
    }
    if end_idx < timestamps.len() && timestamps[end_idx] > seek_timestamp {
        timestamps = &timestamps[0..end_idx];
    }
    if timestamps.len() < 16 {
        // Fast path: the number of timestamps to search is small, so scan them all.
        return match timestamps.iter().position(|ts| *ts > seek_timestamp) {
            Some(i) => start_idx + i,
            None => start_idx + timestamps.len(),
        };
    }
    // Slow path: too many timestamps, so use binary search.
    start_idx + timestamps.partition_point(|ts| *ts <= seek_timestamp)
}

/// Estimates the scrape interval as 0.6 quantile of the first 20 intervals.
pub(crate) fn get_scrape_interval(timestamps: &[Timestamp], default_interval: i64) -> i64 {
    if timestamps.len() < 2 {
        return default_interval;
    }

    let mut ts_prev = timestamps[0];
    let timestamps = &timestamps[1..];
    let len = timestamps.len().min(20);

    let mut intervals = [0_f64; 20];
    for (interval, ts) in intervals.iter_mut().zip(timestamps.iter()) {
        *interval = (ts - ts_prev) as f64;
        ts_prev = *ts
    }
    let scrape_interval = quantile(0.6, &intervals[0..len]) as i64;
    if scrape_interval <= 0 {
        return default_interval;
    }
    scrape_interval
}

pub(crate) fn get_max_prev_interval(scrape_interval: i64) -> i64 {
    // Increase scrape_interval more for smaller scrape intervals in order to hide possible gaps
    // when high jitter is present.
    // See https://github.com/VictoriaMetrics/VictoriaMetrics/issues/139 .
    let extra = match scrape_interval {
        i64::MIN..=2_000 => 4 * scrape_interval,
        2_001..=4_000 => 2 * scrape_interval,
        4_001..=8_000 => scrape_interval,
        8_001..=16_000 => scrape_interval / 2,
        16_001..=32_000 => scrape_interval / 4,
        _ => scrape_interval / 8,
    };
    scrape_interval + extra
}

fn unwrap_rollup_call(expr: &Expr) -> RuntimeResult<&FunctionExpr> {
    // Extract rollup_func() from aggr_func(rollup_func(q, tag)) for incremental aggregation.
    let expr = match expr {
        Expr::Aggregation(ae) if ae.args.len() == 1 => &ae.args[0],
        _ => expr,
    };
    match expr {
        Expr::Function(fe) => Ok(fe),
        _ => Err(RuntimeError::General(format!(
            "BUG: unexpected expression; want function call; got {}; value: {expr}",
            expr.variant_name()
        ))),
    }
}

fn get_rollup_tag(expr: &Expr) -> RuntimeResult<Option<&str>> {
    let fe = unwrap_rollup_call(expr)?;
    if fe.args.len() < 2 {
        return Ok(None);
    }
    if fe.args.len() != 2 {
        let msg = format!(
            "invalid args for {expr}: unexpected number of args; got {}; want 2",
            fe.args.len()
        );
        return Err(RuntimeError::ArgumentError(msg));
    }
    match &fe.args[1] {
        Expr::StringLiteral(s) if s.is_empty() => Err(RuntimeError::ArgumentError(format!(
            "invalid args for {expr}: rollup tag cannot be empty"
        ))),
        Expr::StringLiteral(s) => Ok(Some(s.as_str())),
        arg => Err(RuntimeError::ArgumentError(format!(
            "invalid args for {expr}: unexpected rollup tag type: {arg}; expecting string"
        ))),
    }
}

fn get_rollup_aggr_funcs(expr: &Expr) -> RuntimeResult<Vec<RollupFunction>> {
    fn get_func_by_name(name: &str) -> RuntimeResult<RollupFunction> {
        match RollupFunction::from_str(name) {
            Ok(func) if func.is_aggregate_function() => Ok(func),
            _ => Err(RuntimeError::ArgumentError(format!(
                "{name} cannot be used in `aggr_over_time` function; expecting quoted aggregate function name"
            ))),
        }
    }

    let fe = unwrap_rollup_call(expr)?;
    if fe.rollup_function() != Some(RollupFunction::AggrOverTime) {
        return Err(RuntimeError::General(format!(
            "BUG: unexpected function name: {}; want `aggr_over_time`",
            fe.name
        )));
    }
    if fe.args.len() < 2 {
        return Err(RuntimeError::ArgumentError(format!(
            "unexpected number of args to aggr_over_time(); got {}; want at least 2",
            fe.args.len()
        )));
    }
    if fe.args.len() > 2 {
        // aggr_over_time("f1", "f2", ..., q)
        let names = &fe.args[..fe.args.len() - 1];
        return names
            .iter()
            .map(|arg| match arg {
                Expr::StringLiteral(name) => get_func_by_name(name),
                _ => Err(RuntimeError::ArgumentError(format!(
                    "{arg} cannot be passed here; expecting quoted aggregate function name"
                ))),
            })
            .collect();
    }

    match &fe.args[0] {
        Expr::StringLiteral(name) => Ok(vec![get_func_by_name(name)?]),
        Expr::Function(list)
            if list.function == BuiltinFunction::Transform(TransformFunction::Union) =>
        {
            if list.args.is_empty() {
                return Err(RuntimeError::ArgumentError(
                    "aggr_over_time() must contain at least a single aggregate function name"
                        .to_string(),
                ));
            }
            list.args
                .iter()
                .map(|arg| match arg {
                    Expr::StringLiteral(name) => get_func_by_name(name),
                    _ => Err(RuntimeError::ArgumentError(format!(
                        "{arg} cannot be passed here; expecting quoted aggregate function name"
                    ))),
                })
                .collect()
        }
        arg => Err(RuntimeError::ArgumentError(format!(
            "{arg} cannot be passed to aggr_over_time(); expecting quoted aggregate function name or a list of quoted aggregate function names"
        ))),
    }
}
