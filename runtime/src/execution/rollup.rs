use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rayon::prelude::*;
use tracing::{field, trace_span, warn, Span};

use vmquery_ast::expr::{Expr, MetricExpr, RollupExpr};
use vmquery_ast::functions::RollupFunction;
use vmquery_ast::label::LabelFilterOp;

use crate::cache::merge_timeseries;
use crate::common::math::is_stale_nan;
use crate::execution::eval::eval_expr;
use crate::execution::{
    align_start_end, eval_number, get_timestamps, validate_max_points_per_timeseries, Context,
    EvalConfig,
};
use crate::functions::aggregate::{IncrementalAggrFuncContext, IncrementalAggrShard};
use crate::functions::rollup::{
    get_rollup_configs, get_rollup_handler, PreFunctions, RollupConfig, RollupConfigParams,
    RollupHandler, TimeseriesMap, MAX_SILENCE_INTERVAL,
};
use crate::provider::{join_tag_filterss, QueryResult, QueryResults, SearchQuery};
use crate::runtime_error::{RuntimeError, RuntimeResult};
use crate::types::{MetricName, QueryValue, Timeseries, Timestamp};

/// Evaluates a single rollup function call over a selector or a subquery.
pub(super) struct RollupEvaluator<'a> {
    func: RollupFunction,
    /// The expression results are cached under: the rollup call, or the aggregate wrapping it
    /// when `iafc` is set.
    expr: &'a Expr,
    re: &'a RollupExpr,
    /// Evaluated call args. The series arg is a placeholder.
    args: Vec<QueryValue>,
    keep_metric_names: bool,
    iafc: Option<&'a IncrementalAggrFuncContext<'a>>,
}

impl<'a> RollupEvaluator<'a> {
    pub(super) fn new(
        func: RollupFunction,
        expr: &'a Expr,
        re: &'a RollupExpr,
        args: Vec<QueryValue>,
        keep_metric_names: bool,
        iafc: Option<&'a IncrementalAggrFuncContext<'a>>,
    ) -> Self {
        Self {
            func,
            expr,
            re,
            args,
            keep_metric_names,
            iafc,
        }
    }

    pub(super) fn eval(&self, ctx: &Context, ec: &EvalConfig) -> RuntimeResult<Vec<Timeseries>> {
        let span = if ec.trace_enabled() {
            trace_span!(
                "rollup",
                func = self.func.name(),
                expr = %self.expr,
                series = field::Empty,
                samples_scanned = field::Empty
            )
        } else {
            Span::none()
        }
        .entered();

        // Params are resolved against the outer grid; `@` and `offset` keep the number of points.
        let handler = get_rollup_handler(self.func, &self.args, ec.data_points())?;
        let rvs = match &self.re.at {
            Some(at) => self.eval_with_at(ctx, ec, at, &handler)?,
            None => self.eval_without_at(ctx, ec, &handler)?,
        };

        span.record("series", rvs.len());
        Ok(rvs)
    }

    fn window(&self, step: i64) -> i64 {
        self.re.window.map_or(0, |w| w.value(step))
    }

    /// Evaluates the rollup at the single instant returned by the `@` expression and spreads
    /// the result over the whole grid of `ec`.
    fn eval_with_at(
        &self,
        ctx: &Context,
        ec: &EvalConfig,
        at: &Expr,
        handler: &RollupHandler,
    ) -> RuntimeResult<Vec<Timeseries>> {
        let tss_at = eval_expr(ctx, ec, at).map_err(|err| {
            RuntimeError::ArgumentError(format!("cannot evaluate `@` modifier {at}: {err}"))
        })?;
        if tss_at.len() != 1 {
            return Err(RuntimeError::ArgumentError(format!(
                "`@` modifier must return a single series; it returns {} series instead",
                tss_at.len()
            )));
        }
        let at_value = tss_at[0].values.first().copied().unwrap_or(f64::NAN);
        if !at_value.is_finite() {
            return Err(RuntimeError::ArgumentError(format!(
                "`@` modifier must return a finite timestamp; got {at_value}"
            )));
        }
        let at_timestamp = (at_value * 1e3) as Timestamp;

        let mut ec_new = ec.copy_no_timestamps();
        ec_new.start = at_timestamp;
        ec_new.end = at_timestamp;
        let mut tss = self.eval_without_at(ctx, &ec_new, handler)?;

        let timestamps = ec.get_timestamps()?;
        for ts in tss.iter_mut() {
            let v = ts.values.first().copied().unwrap_or(f64::NAN);
            ts.values = vec![v; timestamps.len()];
            ts.timestamps = Arc::clone(&timestamps);
        }
        Ok(tss)
    }

    fn eval_without_at(
        &self,
        ctx: &Context,
        ec: &EvalConfig,
        handler: &RollupHandler,
    ) -> RuntimeResult<Vec<Timeseries>> {
        let mut offset = self.re.offset.map_or(0, |d| d.value(ec.step));
        let mut shifted: Option<EvalConfig> = None;
        if offset != 0 {
            let mut ec_new = ec.copy_no_timestamps();
            ec_new.start -= offset;
            ec_new.end -= offset;
            shifted = Some(ec_new);
        }
        if self.func == RollupFunction::RollupCandlestick {
            // Candlesticks describe the interval ending at the next point, so evaluate with
            // an implicit `offset -step`.
            let step = ec.step;
            let mut ec_new = shifted.as_ref().unwrap_or(ec).copy_no_timestamps();
            ec_new.start += step;
            ec_new.end += step;
            offset -= step;
            shifted = Some(ec_new);
        }
        let ec_new = shifted.as_ref().unwrap_or(ec);

        let mut rvs = match &*self.re.expr {
            Expr::MetricExpression(me) => self.eval_with_metric_expr(ctx, ec_new, me, handler)?,
            _ => {
                if self.iafc.is_some() {
                    panic!(
                        "BUG: incremental aggregation cannot run over subquery {}",
                        self.re
                    );
                }
                self.eval_with_subquery(ctx, ec_new, handler)?
            }
        };

        if self.func == RollupFunction::AbsentOverTime {
            rvs = aggregate_absent_over_time(ec_new, &self.re.expr, &rvs)?;
        }

        if offset != 0 && !rvs.is_empty() {
            // Timestamps are shared with other series, so shift a copy.
            let shifted: Vec<i64> = rvs[0].timestamps.iter().map(|ts| ts + offset).collect();
            let shared = Arc::new(shifted);
            for ts in rvs.iter_mut() {
                ts.timestamps = Arc::clone(&shared);
            }
        }
        Ok(rvs)
    }

    fn config_params(
        &self,
        ec: &EvalConfig,
        start: Timestamp,
        window: i64,
        timestamps: &Arc<Vec<i64>>,
    ) -> RollupConfigParams {
        RollupConfigParams {
            start,
            end: ec.end,
            step: ec.step,
            window,
            max_points_per_series: ec.max_points_per_series,
            lookback_delta: ec.lookback_delta,
            timestamps: Arc::clone(timestamps),
        }
    }

    fn eval_with_subquery(
        &self,
        ctx: &Context,
        ec: &EvalConfig,
        handler: &RollupHandler,
    ) -> RuntimeResult<Vec<Timeseries>> {
        let step = match &self.re.step {
            Some(step) if step.value(ec.step) > 0 => step.value(ec.step),
            _ => ec.step,
        };
        let window = self.window(ec.step);

        let span = if ec.trace_enabled() {
            trace_span!("subquery", expr = %self.re, step, window, series = field::Empty)
        } else {
            Span::none()
        }
        .entered();

        let mut ec_sq = ec.copy_no_timestamps();
        ec_sq.start -= window + MAX_SILENCE_INTERVAL + step;
        ec_sq.end += step;
        ec_sq.step = step;
        ec_sq.max_points_per_series = ctx.config.max_points_subquery_per_timeseries;
        validate_max_points_per_timeseries(
            ec_sq.start,
            ec_sq.end,
            ec_sq.step,
            ec_sq.max_points_per_series,
        )?;
        // Subqueries are always aligned to their step, as Prometheus does.
        (ec_sq.start, ec_sq.end) = align_start_end(ec_sq.start, ec_sq.end, ec_sq.step);

        let tss_sq = eval_expr(ctx, &ec_sq, &self.re.expr)?;
        span.record("series", tss_sq.len());
        if tss_sq.is_empty() {
            return Ok(vec![]);
        }

        let shared_timestamps = ec.get_timestamps()?;
        let params = self.config_params(ec, ec.start, window, &shared_timestamps);
        let (pre_funcs, rcs) = get_rollup_configs(self.func, handler, self.expr, &params)?;

        let samples_scanned = AtomicU64::new(0);
        let rvs = tss_sq
            .par_iter()
            .map(|ts_sq| {
                let (mut values, timestamps) = remove_nan_values(&ts_sq.values, &ts_sq.timestamps);
                pre_funcs.apply(&mut values, &timestamps);
                self.rollup_series(
                    &rcs,
                    &ts_sq.metric_name,
                    &values,
                    &timestamps,
                    &shared_timestamps,
                    &samples_scanned,
                )
            })
            .collect::<RuntimeResult<Vec<_>>>()?;

        Span::current().record("samples_scanned", samples_scanned.load(Ordering::Relaxed));
        Ok(rvs.into_iter().flatten().collect())
    }

    fn eval_with_metric_expr(
        &self,
        ctx: &Context,
        ec: &EvalConfig,
        me: &MetricExpr,
        handler: &RollupHandler,
    ) -> RuntimeResult<Vec<Timeseries>> {
        let window = self.window(ec.step);
        if me.is_empty() {
            return eval_number(ec, f64::NAN);
        }

        let cache = &ctx.rollup_result_cache;
        let (tss_cached, start) = cache.get(ec, self.expr, window)?;
        if start > ec.end {
            // The result is fully cached.
            return Ok(tss_cached.unwrap_or_default());
        }

        let tss = self.fetch_and_rollup(ctx, ec, me, handler, window, start)?;
        let tss = match tss_cached {
            Some(cached) if start > ec.start => match merge_timeseries(cached, tss, start, ec)? {
                Some(tss) => tss,
                // The cached part can't be stitched to the fresh part. Compute everything.
                None => self.fetch_and_rollup(ctx, ec, me, handler, window, ec.start)?,
            },
            _ => tss,
        };

        cache.put(ec, self.expr, window, &tss)?;
        Ok(tss)
    }

    /// Fetches raw samples for `me` and rolls them up over `[start, ec.end]`.
    fn fetch_and_rollup(
        &self,
        ctx: &Context,
        ec: &EvalConfig,
        me: &MetricExpr,
        handler: &RollupHandler,
        window: i64,
        start: Timestamp,
    ) -> RuntimeResult<Vec<Timeseries>> {
        // Build the configs before hitting the storage, so argument errors show up early.
        let shared_timestamps = Arc::new(get_timestamps(
            start,
            ec.end,
            ec.step,
            ec.max_points_per_series,
        )?);
        let params = self.config_params(ec, start, window, &shared_timestamps);
        let (pre_funcs, rcs) = get_rollup_configs(self.func, handler, self.expr, &params)?;

        let tfss = join_tag_filterss(&me.filters, &ec.enforced_tag_filters);
        let mut min_timestamp = start;
        if self.func.need_silence_interval() {
            min_timestamp -= MAX_SILENCE_INTERVAL;
        }
        min_timestamp -= window.max(ec.step);
        let sq = SearchQuery::new(
            ec.tenant,
            min_timestamp,
            ec.end,
            tfss.into_owned(),
            ec.max_series,
        );
        let rss = ctx.storage.search(&sq, &ec.deadline)?;
        if rss.is_partial {
            if ec.deny_partial_response {
                rss.cancel();
                return Err(RuntimeError::PartialResponseDenied(sq.to_string()));
            }
            warn!("partial response for {sq}: some storage nodes did not respond");
            ec.mark_partial_response();
        }
        if rss.is_empty() {
            rss.cancel();
            return Ok(vec![]);
        }

        let _reservation = self.reserve_rollup_memory(ctx, ec, &rss, &rcs, shared_timestamps.len())?;

        let samples_scanned = AtomicU64::new(0);
        let tss = match self.iafc {
            Some(iafc) => self.eval_with_incremental_aggregate(
                iafc,
                &rss,
                &rcs,
                &pre_funcs,
                &shared_timestamps,
                ec.no_stale_markers,
                &samples_scanned,
            )?,
            None => self.eval_no_incremental_aggregate(
                &rss,
                &rcs,
                &pre_funcs,
                &shared_timestamps,
                ec.no_stale_markers,
                &samples_scanned,
            )?,
        };
        Span::current().record("samples_scanned", samples_scanned.load(Ordering::Relaxed));
        Ok(tss)
    }

    /// Reserves memory for the rollup results before computing them. The reservation is
    /// released when the returned guard is dropped.
    fn reserve_rollup_memory(
        &self,
        ctx: &Context,
        ec: &EvalConfig,
        rss: &QueryResults,
        rcs: &[RollupConfig],
        points_per_series: usize,
    ) -> RuntimeResult<crate::utils::MemoryReservation> {
        let rss_len = rss.len();
        let mut timeseries_len = rss_len;
        if let Some(iafc) = self.iafc {
            // Incremental aggregates hold only one series per worker and output group.
            timeseries_len = iafc.worker_count();
            if let Expr::Aggregation(ae) = self.expr {
                if ae.modifier.is_some() {
                    timeseries_len = timeseries_len.saturating_mul(if ae.limit > 0 {
                        ae.limit
                    } else {
                        1000
                    });
                }
            }
            timeseries_len = timeseries_len.min(rss_len);
        }
        let series = timeseries_len.saturating_mul(rcs.len());

        let fail = |msg: String| {
            rss.cancel();
            Err(RuntimeError::ResourcesExhausted(msg))
        };

        let Some(rollup_points) = points_per_series.checked_mul(series) else {
            return fail(format!(
                "{series} series with {points_per_series} points in each: the number of data points overflows"
            ));
        };
        let Some(rollup_memory_size) = rollup_points.checked_mul(16) else {
            return fail(format!(
                "{rollup_points} data points: the requested memory size overflows"
            ));
        };

        let step_secs = ec.step as f64 / 1e3;
        let max_per_query = ctx.config.max_memory_per_query;
        if max_per_query > 0 && rollup_memory_size > max_per_query {
            return fail(format!(
                "{} which returns {rollup_points} data points across {series} series with {points_per_series} points in each; \
                 requested memory: {rollup_memory_size} bytes, the limit per query is {max_per_query} bytes; \
                 reduce the number of matching series or increase `step` (step={step_secs}s)",
                self.expr
            ));
        }

        match ctx.memory_limiter.reserve_guard(rollup_memory_size) {
            Ok(reservation) => Ok(reservation),
            Err(RuntimeError::ResourcesExhausted(msg)) => fail(format!(
                "{rollup_points} data points across {series} series with {points_per_series} points in each; \
                 requested memory: {msg}; reduce the number of matching series or increase `step` (step={step_secs}s)"
            )),
            Err(err) => {
                rss.cancel();
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn eval_with_incremental_aggregate(
        &self,
        iafc: &IncrementalAggrFuncContext,
        rss: &QueryResults,
        rcs: &[RollupConfig],
        pre_funcs: &PreFunctions,
        shared_timestamps: &Arc<Vec<i64>>,
        no_stale_markers: bool,
        samples_scanned: &AtomicU64,
    ) -> RuntimeResult<Vec<Timeseries>> {
        let groups = rss.fold_parallel(
            IncrementalAggrShard::default,
            |shard, rs| {
                let (values, timestamps) = self.prepare_samples(rs, pre_funcs, no_stale_markers);
                let tss = self.rollup_series(
                    rcs,
                    &rs.metric,
                    &values,
                    &timestamps,
                    shared_timestamps,
                    samples_scanned,
                )?;
                for mut ts in tss {
                    iafc.update_timeseries(shard, &mut ts);
                }
                Ok(())
            },
            |a, b| iafc.merge_shards(a, b),
        )?;
        Ok(iafc.finalize_timeseries(groups))
    }

    fn eval_no_incremental_aggregate(
        &self,
        rss: &QueryResults,
        rcs: &[RollupConfig],
        pre_funcs: &PreFunctions,
        shared_timestamps: &Arc<Vec<i64>>,
        no_stale_markers: bool,
        samples_scanned: &AtomicU64,
    ) -> RuntimeResult<Vec<Timeseries>> {
        let tss = Mutex::new(Vec::with_capacity(rss.len() * rcs.len()));
        rss.for_each_parallel(|rs, _worker_id| {
            let (values, timestamps) = self.prepare_samples(rs, pre_funcs, no_stale_markers);
            let rvs = self.rollup_series(
                rcs,
                &rs.metric,
                &values,
                &timestamps,
                shared_timestamps,
                samples_scanned,
            )?;
            tss.lock().unwrap_or_else(PoisonError::into_inner).extend(rvs);
            Ok(())
        })?;
        Ok(tss.into_inner().unwrap_or_else(PoisonError::into_inner))
    }

    /// Copies raw samples so they can be pre-processed in place.
    fn prepare_samples(
        &self,
        rs: &QueryResult,
        pre_funcs: &PreFunctions,
        no_stale_markers: bool,
    ) -> (Vec<f64>, Vec<i64>) {
        let mut values = rs.values.clone();
        let mut timestamps = rs.timestamps.clone();
        if !no_stale_markers {
            drop_stale_nans(self.func, &mut values, &mut timestamps);
        }
        pre_funcs.apply(&mut values, &timestamps);
        (values, timestamps)
    }

    /// Runs every config over the samples of a single series.
    fn rollup_series(
        &self,
        rcs: &[RollupConfig],
        mn: &MetricName,
        values: &[f64],
        timestamps: &[i64],
        shared_timestamps: &Arc<Vec<i64>>,
        samples_scanned: &AtomicU64,
    ) -> RuntimeResult<Vec<Timeseries>> {
        let mut rvs = Vec::with_capacity(rcs.len());
        for rc in rcs {
            if rc.handler.uses_timeseries_map() {
                let mut tsm = TimeseriesMap::new(self.keep_metric_names, shared_timestamps, mn);
                let n = rc.do_timeseries_map(&mut tsm, values, timestamps)?;
                samples_scanned.fetch_add(n, Ordering::Relaxed);
                tsm.append_timeseries_to(&mut rvs);
                continue;
            }

            let mut ts = Timeseries {
                metric_name: mn.clone(),
                values: Vec::with_capacity(shared_timestamps.len()),
                timestamps: Arc::clone(shared_timestamps),
            };
            if !rc.tag_value.is_empty() {
                ts.metric_name.set_tag("rollup", rc.tag_value.as_str());
            }
            if !self.keep_metric_names {
                ts.metric_name.reset_metric_group();
            }
            let n = rc.exec(&mut ts.values, values, timestamps)?;
            samples_scanned.fetch_add(n, Ordering::Relaxed);
            rvs.push(ts);
        }
        Ok(rvs)
    }
}

/// Removes Prometheus staleness markers, so window functions never see them. `default_rollup`
/// and `stale_samples_over_time` need the markers and keep them.
fn drop_stale_nans(func: RollupFunction, values: &mut Vec<f64>, timestamps: &mut Vec<i64>) {
    if matches!(
        func,
        RollupFunction::DefaultRollup | RollupFunction::StaleSamplesOverTime
    ) {
        return;
    }
    if !values.iter().any(|v| is_stale_nan(*v)) {
        return;
    }
    let mut k = 0;
    for i in 0..values.len() {
        let v = values[i];
        if is_stale_nan(v) {
            continue;
        }
        values[k] = v;
        timestamps[k] = timestamps[i];
        k += 1;
    }
    values.truncate(k);
    timestamps.truncate(k);
}

fn remove_nan_values(values: &[f64], timestamps: &[i64]) -> (Vec<f64>, Vec<i64>) {
    if !values.iter().any(|v| v.is_nan()) {
        return (values.to_vec(), timestamps.to_vec());
    }
    values
        .iter()
        .zip(timestamps.iter())
        .filter(|(v, _)| !v.is_nan())
        .map(|(v, ts)| (*v, *ts))
        .unzip()
}

/// Returns a series of ones tagged with the equality filters of the selector in `expr`.
fn get_absent_timeseries(ec: &EvalConfig, expr: &Expr) -> RuntimeResult<Vec<Timeseries>> {
    let mut rvs = eval_number(ec, 1.0)?;
    if let Expr::MetricExpression(me) = expr {
        for tf in me.filters.iter() {
            if tf.is_metric_name_filter() || tf.op != LabelFilterOp::Equal {
                continue;
            }
            rvs[0].metric_name.set_tag(&tf.label, tf.value.as_str());
        }
    }
    Ok(rvs)
}

/// Collapses `tss` into a single series which is 1 where none of them has samples and NaN
/// elsewhere.
fn aggregate_absent_over_time(
    ec: &EvalConfig,
    expr: &Expr,
    tss: &[Timeseries],
) -> RuntimeResult<Vec<Timeseries>> {
    let mut rvs = get_absent_timeseries(ec, expr)?;
    if tss.is_empty() {
        return Ok(rvs);
    }
    for (i, value) in rvs[0].values.iter_mut().enumerate() {
        if tss.iter().any(|ts| ts.values.get(i).is_some_and(|v| v.is_nan())) {
            *value = f64::NAN;
        }
    }
    Ok(rvs)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use vmquery_ast::label::LabelFilter;

    use super::*;
    use crate::common::math::stale_nan;

    #[test]
    fn stale_markers_are_dropped() {
        let mut values = vec![1.0, stale_nan(), 3.0, f64::NAN];
        let mut timestamps = vec![10, 20, 30, 40];
        drop_stale_nans(RollupFunction::SumOverTime, &mut values, &mut timestamps);
        assert_eq!(timestamps, vec![10, 30, 40]);
        assert_eq!(values[..2], [1.0, 3.0]);
        assert!(values[2].is_nan());
    }

    #[test]
    fn default_rollup_keeps_stale_markers() {
        let mut values = vec![1.0, stale_nan()];
        let mut timestamps = vec![10, 20];
        drop_stale_nans(RollupFunction::DefaultRollup, &mut values, &mut timestamps);
        assert_eq!(timestamps, vec![10, 20]);
        assert!(is_stale_nan(values[1]));
    }

    #[test]
    fn nan_values_are_removed() {
        let (values, timestamps) = remove_nan_values(&[f64::NAN, 1.0, f64::NAN, 2.0], &[1, 2, 3, 4]);
        assert_eq!(values, vec![1.0, 2.0]);
        assert_eq!(timestamps, vec![2, 4]);
    }

    #[test]
    fn absent_series_takes_equality_filters() {
        let ec = EvalConfig::new(1000, 3000, 1000);
        let me = MetricExpr::new("foo")
            .append(LabelFilter::equal("job", "api"))
            .append(LabelFilter::not_equal("instance", "a"));
        let expr = Expr::MetricExpression(me);

        let mut present = Timeseries::constant(&ec.get_timestamps().unwrap(), 1.0);
        present.values[1] = f64::NAN;
        let rvs = aggregate_absent_over_time(&ec, &expr, &[present]).unwrap();
        assert_eq!(rvs.len(), 1);
        assert_eq!(rvs[0].metric_name.metric_group, "");
        assert_eq!(rvs[0].metric_name.get_tag_value("job"), Some("api"));
        assert!(!rvs[0].metric_name.has_tag("instance"));
        assert_eq!(rvs[0].values[0], 1.0);
        assert!(rvs[0].values[1].is_nan());
        assert_eq!(rvs[0].values[2], 1.0);
    }
}
