use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tracing::{span_enabled, Level};

use vmquery_ast::label::LabelFilter;

use crate::execution::Context;
use crate::provider::{Deadline, TenantId};
use crate::runtime_error::{RuntimeError, RuntimeResult};
use crate::types::{Timeseries, Timestamp, TimestampTrait};

/// The minimum number of points per timeseries for enabling time rounding.
/// This improves cache hit ratio for frequently requested queries over
/// big time ranges.
const MIN_TIMESERIES_POINTS_FOR_TIME_ROUNDING: i64 = 50;

/// The maximum number of points which can be generated per each returned time series
/// when nothing else is configured.
pub const DEFAULT_MAX_POINTS_PER_TIMESERIES: usize = 30_000;

/// Checks the maximum number of points that may be returned per each time series.
pub(crate) fn validate_max_points_per_timeseries(
    start: Timestamp,
    end: Timestamp,
    step: i64,
    max_points_per_timeseries: usize,
) -> RuntimeResult<()> {
    let points = (end - start) / step.max(1) + 1;
    if max_points_per_timeseries > 0 && points > max_points_per_timeseries as i64 {
        let msg = format!(
            "too many points for the given step={}, start={} and end={}: {}; cannot exceed {}",
            step, start, end, points, max_points_per_timeseries
        );
        return Err(RuntimeError::ArgumentError(msg));
    }
    Ok(())
}

/// Aligns start and end to the step for queries with enough points, so repeated queries over
/// sliding ranges hit the rollup result cache.
pub fn adjust_start_end(start: Timestamp, end: Timestamp, step: i64) -> (Timestamp, Timestamp) {
    let points = (end - start) / step + 1;
    if points < MIN_TIMESERIES_POINTS_FOR_TIME_ROUNDING {
        // Too small number of points for rounding.
        return (start, end);
    }

    let (start, mut end) = align_start_end(start, end, step);

    // Keep the number of points unchanged.
    let mut new_points = (end - start) / step + 1;
    while new_points > points {
        end -= step;
        new_points -= 1;
    }

    (start, end)
}

pub fn align_start_end(start: Timestamp, end: Timestamp, step: i64) -> (Timestamp, Timestamp) {
    // Round start to the nearest smaller value divisible by step.
    let new_start = start - start.rem_euclid(step);
    // Round end to the nearest bigger value divisible by step.
    let adjust = end.rem_euclid(step);
    let mut new_end = end;
    if adjust > 0 {
        new_end += step - adjust
    }
    (new_start, new_end)
}

pub(crate) fn get_timestamps(
    start: Timestamp,
    end: Timestamp,
    step: i64,
    max_points_per_timeseries: usize,
) -> RuntimeResult<Vec<i64>> {
    if step <= 0 {
        panic!("BUG: step must be bigger than 0; got {step}");
    }
    if start > end {
        panic!("BUG: start cannot exceed end; got {start} vs {end}");
    }
    validate_max_points_per_timeseries(start, end, step, max_points_per_timeseries)?;

    let n = ((end - start) / step + 1) as usize;
    let mut timestamps = Vec::with_capacity(n);
    let mut ts = start;
    while ts <= end {
        timestamps.push(ts);
        ts += step;
    }
    Ok(timestamps)
}

/// Per-evaluation settings.
///
/// Everything is fixed for the lifetime of one evaluation except the partial-response flag,
/// which is shared by every config derived from the same root and only ever goes from
/// `false` to `true`.
#[derive(Debug)]
pub struct EvalConfig {
    pub tenant: TenantId,
    pub start: Timestamp,
    pub end: Timestamp,
    pub step: i64,

    /// The maximum number of time series which can be scanned by the query.
    /// Zero means 'no limit'
    pub max_series: usize,

    pub deadline: Deadline,

    /// Analog to `-query.lookback-delta` from Prometheus. Zero disables it.
    pub lookback_delta: i64,

    /// How many decimal digits after the point to leave in response.
    pub round_digits: u8,

    /// Additional label filters to use in the query.
    pub enforced_tag_filters: Vec<Vec<LabelFilter>>,

    /// Fail the query instead of returning incomplete data.
    pub deny_partial_response: bool,

    /// Set if the data doesn't contain Prometheus stale markers, so there is no need
    /// to look for them.
    pub no_stale_markers: bool,

    /// The limit on the number of points which can be generated per each returned time series.
    pub max_points_per_series: usize,

    /// Disables response caching. This may be useful during data back-filling.
    pub disable_cache: bool,

    /// Points newer than `now - step - cache_timestamp_offset` are never cached.
    pub cache_timestamp_offset: i64,

    pub trace_enabled: bool,

    may_cache: bool,
    is_partial: Arc<AtomicBool>,
    timestamps: OnceLock<Arc<Vec<i64>>>,
}

impl EvalConfig {
    pub fn new(start: Timestamp, end: Timestamp, step: i64) -> Self {
        EvalConfig {
            start,
            end,
            step,
            ..Default::default()
        }
    }

    /// Returns a copy sharing the partial-response flag but not the timestamps, which are
    /// generated again on first use.
    pub fn copy_no_timestamps(&self) -> EvalConfig {
        EvalConfig {
            tenant: self.tenant,
            start: self.start,
            end: self.end,
            step: self.step,
            max_series: self.max_series,
            deadline: self.deadline,
            lookback_delta: self.lookback_delta,
            round_digits: self.round_digits,
            enforced_tag_filters: self.enforced_tag_filters.clone(),
            deny_partial_response: self.deny_partial_response,
            no_stale_markers: self.no_stale_markers,
            max_points_per_series: self.max_points_per_series,
            disable_cache: self.disable_cache,
            cache_timestamp_offset: self.cache_timestamp_offset,
            trace_enabled: self.trace_enabled,
            may_cache: self.may_cache,
            is_partial: Arc::clone(&self.is_partial),
            timestamps: OnceLock::new(),
        }
    }

    pub fn validate(&self) -> RuntimeResult<()> {
        if self.start > self.end {
            let msg = format!(
                "start cannot exceed end; got {} vs {}",
                self.start, self.end
            );
            return Err(RuntimeError::ArgumentError(msg));
        }
        if self.step <= 0 {
            let msg = format!("step must be greater than 0; got {}", self.step);
            return Err(RuntimeError::ArgumentError(msg));
        }
        validate_max_points_per_timeseries(
            self.start,
            self.end,
            self.step,
            self.max_points_per_series,
        )
    }

    pub fn may_cache(&self) -> bool {
        if self.disable_cache {
            return false;
        }
        if self.may_cache {
            return true;
        }
        self.start % self.step == 0 && self.end % self.step == 0
    }

    pub fn set_caching(&mut self, may_cache: bool) {
        self.may_cache = may_cache;
    }

    pub fn update_from_context(&mut self, ctx: &Context) {
        let config = &ctx.config;
        self.disable_cache = config.disable_cache;
        self.max_points_per_series = config.max_points_per_timeseries;
        self.no_stale_markers = config.no_stale_markers;
        self.max_series = config.max_series;
        self.cache_timestamp_offset = config.cache_timestamp_offset;
        self.trace_enabled = config.trace_enabled;
        if config.lookback_delta > 0 {
            self.lookback_delta = config.lookback_delta;
        }
    }

    /// Returns the shared timestamp grid `start, start+step, ..., end`, computing it on first use.
    pub fn get_timestamps(&self) -> RuntimeResult<Arc<Vec<i64>>> {
        if let Some(ts) = self.timestamps.get() {
            return Ok(Arc::clone(ts));
        }
        let ts = get_timestamps(self.start, self.end, self.step, self.max_points_per_series)?;
        let ts = self.timestamps.get_or_init(|| Arc::new(ts));
        Ok(Arc::clone(ts))
    }

    pub fn data_points(&self) -> usize {
        ((self.end - self.start) / self.step + 1) as usize
    }

    pub fn is_partial_response(&self) -> bool {
        self.is_partial.load(Ordering::Relaxed)
    }

    /// Marks the evaluation as partial. The flag is never cleared.
    pub fn mark_partial_response(&self) {
        self.is_partial.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub fn trace_enabled(&self) -> bool {
        self.trace_enabled && span_enabled!(Level::TRACE)
    }

    pub fn timerange_string(&self) -> String {
        format!("[{}..{}]", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            tenant: TenantId::default(),
            start: 0,
            end: 0,
            step: 0,
            max_series: 0,
            deadline: Deadline::default(),
            lookback_delta: 0,
            round_digits: 100,
            enforced_tag_filters: vec![],
            deny_partial_response: false,
            no_stale_markers: true,
            max_points_per_series: DEFAULT_MAX_POINTS_PER_TIMESERIES,
            disable_cache: false,
            cache_timestamp_offset: 5 * 60 * 1000,
            trace_enabled: false,
            may_cache: false,
            is_partial: Arc::new(AtomicBool::new(false)),
            timestamps: OnceLock::new(),
        }
    }
}

impl From<&Context> for EvalConfig {
    fn from(ctx: &Context) -> Self {
        let mut config = EvalConfig::default();
        config.update_from_context(ctx);
        config
    }
}

pub(crate) fn eval_number(ec: &EvalConfig, n: f64) -> RuntimeResult<Vec<Timeseries>> {
    let timestamps = ec.get_timestamps()?;
    Ok(vec![Timeseries::constant(&timestamps, n)])
}

pub(crate) fn eval_time(ec: &EvalConfig) -> RuntimeResult<Vec<Timeseries>> {
    let mut rv = eval_number(ec, f64::NAN)?;
    let timestamps = Arc::clone(&rv[0].timestamps);
    for (ts, val) in timestamps.iter().zip(rv[0].values.iter_mut()) {
        *val = (*ts as f64) / 1e3_f64;
    }
    Ok(rv)
}
