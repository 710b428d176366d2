use std::cmp::Ordering;

use vmquery_ast::expr::AggregateModifier;
use vmquery_ast::functions::AggregateFunction;
use vmquery_common::hash::{FastHashMap, FastHashSet};
use vmquery_common::pool::{get_pooled_buffer, get_pooled_vec_f64};

use crate::common::math::{format_g, mode_no_nans, quantile, quantiles};
use crate::execution::EvalConfig;
use crate::runtime_error::{check_arg_count, RuntimeError, RuntimeResult};
use crate::types::{remove_empty_series, QueryValue, Timeseries};

/// The maximum number of series `count_values` may generate.
const MAX_SERIES_PER_AGGR_FUNC: usize = 1_000_000;

pub struct AggrFuncArg<'a> {
    pub args: Vec<QueryValue>,
    pub ec: &'a EvalConfig,
    pub modifier: &'a Option<AggregateModifier>,
    pub limit: usize,
}

impl<'a> AggrFuncArg<'a> {
    pub fn new(
        ec: &'a EvalConfig,
        args: Vec<QueryValue>,
        modifier: &'a Option<AggregateModifier>,
        limit: usize,
    ) -> Self {
        Self {
            args,
            ec,
            modifier,
            limit,
        }
    }

    /// Takes ownership of the series held by argument `idx`, leaving a NaN in its place.
    fn take_series(&mut self, idx: usize) -> RuntimeResult<Vec<Timeseries>> {
        let timestamps = self.ec.get_timestamps()?;
        let arg = std::mem::replace(&mut self.args[idx], QueryValue::nan());
        Ok(arg.into_instant_vector(&timestamps))
    }

    fn scalar_values(&self, idx: usize) -> RuntimeResult<Vec<f64>> {
        self.args[idx].get_scalar_values(idx, self.ec.data_points())
    }
}

pub type AggrFunctionResult = RuntimeResult<Vec<Timeseries>>;

pub(crate) type AggrFn = fn(&mut AggrFuncArg) -> AggrFunctionResult;

pub(crate) fn get_aggr_func(func: AggregateFunction) -> AggrFn {
    use AggregateFunction::*;
    match func {
        Sum => |afa| new_aggr_func(afa, aggr_func_sum),
        Min => |afa| new_aggr_func(afa, aggr_func_min),
        Max => |afa| new_aggr_func(afa, aggr_func_max),
        Avg => |afa| new_aggr_func(afa, aggr_func_avg),
        StdDev => |afa| new_aggr_func(afa, aggr_func_stddev),
        StdVar => |afa| new_aggr_func(afa, aggr_func_stdvar),
        Count => |afa| new_aggr_func(afa, aggr_func_count),
        CountValues => aggr_func_count_values,
        Bottomk => |afa| aggr_func_topk(afa, true),
        Topk => |afa| aggr_func_topk(afa, false),
        Quantile => aggr_func_quantile,
        Quantiles => aggr_func_quantiles,
        Group => |afa| new_aggr_func(afa, aggr_func_group),

        // MetricsQL extensions
        Median => aggr_func_median,
        MAD => |afa| new_aggr_func(afa, aggr_func_mad),
        Limitk => aggr_func_limitk,
        Distinct => |afa| new_aggr_func(afa, aggr_func_distinct),
        Sum2 => |afa| new_aggr_func(afa, aggr_func_sum2),
        GeoMean => |afa| new_aggr_func(afa, aggr_func_geomean),
        TopkMin => |afa| aggr_func_range_topk(afa, min_value, false),
        TopkMax => |afa| aggr_func_range_topk(afa, max_value, false),
        TopkAvg => |afa| aggr_func_range_topk(afa, avg_value, false),
        TopkLast => |afa| aggr_func_range_topk(afa, last_value, false),
        TopkMedian => |afa| aggr_func_range_topk(afa, median_value, false),
        BottomkMin => |afa| aggr_func_range_topk(afa, min_value, true),
        BottomkMax => |afa| aggr_func_range_topk(afa, max_value, true),
        BottomkAvg => |afa| aggr_func_range_topk(afa, avg_value, true),
        BottomkLast => |afa| aggr_func_range_topk(afa, last_value, true),
        BottomkMedian => |afa| aggr_func_range_topk(afa, median_value, true),
        Any => aggr_func_any,
        OutliersMAD => aggr_func_outliers_mad,
        Mode => |afa| new_aggr_func(afa, aggr_func_mode),
        Share => aggr_func_share,
        ZScore => aggr_func_zscore,
    }
}

/// Runs a reducer which folds every group into its first series.
fn new_aggr_func(afa: &mut AggrFuncArg, afe: fn(&mut [Timeseries])) -> AggrFunctionResult {
    let tss = get_aggr_timeseries(afa)?;
    aggr_func_ext(
        |mut tss, _| {
            afe(&mut tss);
            tss.truncate(1);
            Ok(tss)
        },
        tss,
        afa.modifier,
        afa.limit,
        false,
    )
}

fn get_aggr_timeseries(afa: &mut AggrFuncArg) -> RuntimeResult<Vec<Timeseries>> {
    if afa.args.is_empty() {
        return Err(RuntimeError::ArgumentError(
            "expecting at least one arg".to_string(),
        ));
    }
    let mut tss = afa.take_series(0)?;
    for i in 1..afa.args.len() {
        let mut other = afa.take_series(i)?;
        tss.append(&mut other);
    }
    Ok(tss)
}

/// Buckets series by their name after applying the grouping modifier. Series consisting only
/// of NaNs take no part in aggregation. Once `max_series` groups exist, series falling into
/// new groups are dropped.
fn aggr_prepare_series(
    arg_orig: Vec<Timeseries>,
    modifier: &Option<AggregateModifier>,
    max_series: usize,
    keep_original: bool,
) -> FastHashMap<Vec<u8>, Vec<Timeseries>> {
    let mut m: FastHashMap<Vec<u8>, Vec<Timeseries>> = FastHashMap::default();
    let mut key = get_pooled_buffer(256);
    for mut ts in arg_orig.into_iter().filter(|ts| !ts.is_all_nans()) {
        key.clear();
        if keep_original {
            let mut mn = ts.metric_name.clone();
            mn.remove_group_tags(modifier);
            mn.marshal(&mut key);
        } else {
            ts.metric_name.remove_group_tags(modifier);
            ts.metric_name.marshal(&mut key);
        }
        if let Some(group) = m.get_mut(key.as_slice()) {
            group.push(ts);
            continue;
        }
        if max_series > 0 && m.len() >= max_series {
            // We already reached time series limit after grouping. Skip other time series.
            continue;
        }
        m.insert(key.to_vec(), vec![ts]);
    }
    m
}

fn aggr_func_ext(
    mut afe: impl FnMut(Vec<Timeseries>, &Option<AggregateModifier>) -> AggrFunctionResult,
    arg_orig: Vec<Timeseries>,
    modifier: &Option<AggregateModifier>,
    max_series: usize,
    keep_original: bool,
) -> AggrFunctionResult {
    let src_tss_count = arg_orig.len();
    let m = aggr_prepare_series(arg_orig, modifier, max_series, keep_original);

    let mut rvs: Vec<Timeseries> = Vec::with_capacity(m.len());
    for (_, tss) in m.into_iter() {
        let rv = afe(tss, modifier)?;
        rvs.extend(rv);
        let dst_tss_count = rvs.len();
        if dst_tss_count > 2000 && dst_tss_count > 16 * src_tss_count {
            // This looks like count_values explosion.
            let msg = format!(
                "too many timeseries after aggregation; got {}; want less than {}",
                dst_tss_count,
                16 * src_tss_count
            );
            return Err(RuntimeError::TooManyTimeseries(msg));
        }
    }

    Ok(rvs)
}

fn aggr_func_any(afa: &mut AggrFuncArg) -> AggrFunctionResult {
    let tss = get_aggr_timeseries(afa)?;
    let afe = |mut tss: Vec<Timeseries>, _: &Option<AggregateModifier>| {
        tss.truncate(1);
        Ok(tss)
    };
    aggr_func_ext(afe, tss, afa.modifier, afa.limit, true)
}

fn aggr_func_group(tss: &mut [Timeseries]) {
    for i in 0..tss[0].values.len() {
        let v = if tss.iter().any(|ts| !ts.values[i].is_nan()) {
            1.0
        } else {
            f64::NAN
        };
        tss[0].values[i] = v;
    }
}

fn aggr_func_sum(tss: &mut [Timeseries]) {
    if tss.len() == 1 {
        // Fast path - nothing to sum.
        return;
    }

    for i in 0..tss[0].values.len() {
        let mut sum: f64 = 0.0;
        let mut count: usize = 0;
        for ts in tss.iter() {
            let v = ts.values[i];
            if v.is_nan() {
                continue;
            }
            sum += v;
            count += 1;
        }
        tss[0].values[i] = if count == 0 { f64::NAN } else { sum };
    }
}

fn aggr_func_sum2(tss: &mut [Timeseries]) {
    for i in 0..tss[0].values.len() {
        let mut sum2: f64 = 0.0;
        let mut count: usize = 0;
        for ts in tss.iter() {
            let x = ts.values[i];
            if x.is_nan() {
                continue;
            }
            sum2 += x * x;
            count += 1;
        }
        tss[0].values[i] = if count == 0 { f64::NAN } else { sum2 };
    }
}

fn aggr_func_geomean(tss: &mut [Timeseries]) {
    if tss.len() == 1 {
        // Fast path - nothing to geomean.
        return;
    }
    for i in 0..tss[0].values.len() {
        let mut p = 1.0;
        let mut count = 0;
        for ts in tss.iter() {
            let v = ts.values[i];
            if v.is_nan() {
                continue;
            }
            p *= v;
            count += 1;
        }
        tss[0].values[i] = if count == 0 {
            f64::NAN
        } else {
            p.powf(1.0 / count as f64)
        };
    }
}

fn aggr_func_min(tss: &mut [Timeseries]) {
    if tss.len() == 1 {
        // Fast path - nothing to min.
        return;
    }

    for i in 0..tss[0].values.len() {
        let mut min = tss[0].values[i];
        for ts in tss.iter() {
            let v = ts.values[i];
            if min.is_nan() || v < min {
                min = v;
            }
        }
        tss[0].values[i] = min;
    }
}

fn aggr_func_max(tss: &mut [Timeseries]) {
    if tss.len() == 1 {
        // Fast path - nothing to max.
        return;
    }

    for i in 0..tss[0].values.len() {
        let mut max = tss[0].values[i];
        for ts in tss.iter() {
            let v = ts.values[i];
            if max.is_nan() || v > max {
                max = v;
            }
        }
        tss[0].values[i] = max;
    }
}

fn aggr_func_avg(tss: &mut [Timeseries]) {
    if tss.len() == 1 {
        // Fast path - nothing to avg.
        return;
    }

    for i in 0..tss[0].values.len() {
        // do not use `Rapid calculation methods` at https://en.wikipedia.org/wiki/Standard_deviation,
        // since it is slower and has no obvious benefits in increased precision.
        let mut sum: f64 = 0.0;
        let mut count: usize = 0;
        for ts in tss.iter() {
            let v = ts.values[i];
            if v.is_nan() {
                continue;
            }
            count += 1;
            sum += v;
        }
        tss[0].values[i] = if count == 0 {
            f64::NAN
        } else {
            sum / count as f64
        };
    }
}

fn aggr_func_stddev(tss: &mut [Timeseries]) {
    aggr_func_stdvar(tss);
    for v in tss[0].values.iter_mut() {
        *v = v.sqrt();
    }
}

fn aggr_func_stdvar(tss: &mut [Timeseries]) {
    if tss.len() == 1 {
        // Fast path - stdvar over a single time series is zero
        for v in tss[0].values.iter_mut() {
            if !v.is_nan() {
                *v = 0.0;
            }
        }
        return;
    }

    for i in 0..tss[0].values.len() {
        // See `Rapid calculation methods` at https://en.wikipedia.org/wiki/Standard_deviation
        let mut avg: f64 = 0.0;
        let mut count: f64 = 0.0;
        let mut q = 0.0;

        for ts in tss.iter() {
            let v = ts.values[i];
            if v.is_nan() {
                continue;
            }
            count += 1.0;
            let avg_new = avg + (v - avg) / count;
            q += (v - avg) * (v - avg_new);
            avg = avg_new
        }

        tss[0].values[i] = if count == 0.0 { f64::NAN } else { q / count };
    }
}

fn aggr_func_count(tss: &mut [Timeseries]) {
    for i in 0..tss[0].values.len() {
        let count = tss.iter().filter(|ts| !ts.values[i].is_nan()).count();
        tss[0].values[i] = if count == 0 { f64::NAN } else { count as f64 };
    }
}

fn aggr_func_distinct(tss: &mut [Timeseries]) {
    let mut set: FastHashSet<u64> = FastHashSet::with_capacity(tss.len());
    for i in 0..tss[0].values.len() {
        for ts in tss.iter() {
            let v = ts.values[i];
            if v.is_nan() {
                continue;
            }
            set.insert(v.to_bits());
        }
        tss[0].values[i] = if set.is_empty() {
            f64::NAN
        } else {
            set.len() as f64
        };
        set.clear();
    }
}

fn aggr_func_mode(tss: &mut [Timeseries]) {
    let mut a = get_pooled_vec_f64(tss.len());
    for i in 0..tss[0].values.len() {
        a.clear();
        a.extend(tss.iter().map(|ts| ts.values[i]).filter(|v| !v.is_nan()));
        tss[0].values[i] = mode_no_nans(f64::NAN, &mut a);
    }
}

fn aggr_func_mad(tss: &mut [Timeseries]) {
    // Calculate medians for each point across tss.
    let medians = get_per_point_medians(tss);
    // See https://en.wikipedia.org/wiki/Median_absolute_deviation
    let mads = get_per_point_mads(tss, &medians);
    tss[0].values = mads;
}

fn aggr_func_share(afa: &mut AggrFuncArg) -> AggrFunctionResult {
    let tss = get_aggr_timeseries(afa)?;
    let afe = |mut tss: Vec<Timeseries>, _: &Option<AggregateModifier>| {
        for i in 0..tss[0].values.len() {
            // Calculate sum for non-negative points at position i.
            let sum: f64 = tss
                .iter()
                .map(|ts| ts.values[i])
                .filter(|v| !v.is_nan() && *v >= 0.0)
                .sum();
            // Divide every non-negative value at position i by sum in order to get its share.
            for ts in tss.iter_mut() {
                let v = ts.values[i];
                ts.values[i] = if v.is_nan() || v < 0.0 {
                    f64::NAN
                } else {
                    v / sum
                };
            }
        }
        Ok(tss)
    };
    aggr_func_ext(afe, tss, afa.modifier, afa.limit, true)
}

fn aggr_func_zscore(afa: &mut AggrFuncArg) -> AggrFunctionResult {
    let tss = get_aggr_timeseries(afa)?;
    let afe = |mut tss: Vec<Timeseries>, _: &Option<AggregateModifier>| {
        for i in 0..tss[0].values.len() {
            // Calculate avg and stddev for tss points at position i.
            // See `Rapid calculation methods` at https://en.wikipedia.org/wiki/Standard_deviation
            let mut avg: f64 = 0.0;
            let mut count: f64 = 0.0;
            let mut q: f64 = 0.0;

            for ts in tss.iter() {
                let v = ts.values[i];
                if v.is_nan() {
                    continue;
                }
                count += 1.0;
                let avg_new = avg + (v - avg) / count;
                q += (v - avg) * (v - avg_new);
                avg = avg_new
            }
            if count == 0.0 {
                // Cannot calculate z-score for NaN points.
                continue;
            }

            // See https://en.wikipedia.org/wiki/Standard_score
            let stddev = (q / count).sqrt();
            for ts in tss.iter_mut() {
                let v = ts.values[i];
                if v.is_nan() {
                    continue;
                }
                ts.values[i] = (v - avg) / stddev;
            }
        }
        Ok(tss)
    };
    aggr_func_ext(afe, tss, afa.modifier, afa.limit, true)
}

fn aggr_func_count_values(afa: &mut AggrFuncArg) -> AggrFunctionResult {
    check_arg_count("count_values", afa.args.len(), 2, 2)?;
    let dst_label = afa.args[0].get_string(0)?;

    // Remove dst_label from grouping like Prometheus does.
    let modifier = match afa.modifier {
        Some(AggregateModifier::Without(labels)) => {
            let mut labels = labels.clone();
            labels.push(dst_label.clone());
            Some(AggregateModifier::Without(labels))
        }
        Some(AggregateModifier::By(labels)) => {
            let labels = labels
                .iter()
                .filter(|label| **label != dst_label)
                .cloned()
                .collect();
            Some(AggregateModifier::By(labels))
        }
        None => None,
    };

    let afe = |tss: Vec<Timeseries>, _: &Option<AggregateModifier>| -> AggrFunctionResult {
        let mut m: FastHashMap<u64, Timeseries> = FastHashMap::default();
        for ts in tss.iter() {
            for (i, v) in ts.values.iter().enumerate() {
                if v.is_nan() {
                    continue;
                }
                if !m.contains_key(&v.to_bits()) {
                    if m.len() >= MAX_SERIES_PER_AGGR_FUNC {
                        let msg = format!(
                            "more than {MAX_SERIES_PER_AGGR_FUNC} series are generated by count_values()"
                        );
                        return Err(RuntimeError::TooManyTimeseries(msg));
                    }
                    let mut dst = Timeseries::copy_from_shallow_timestamps(&tss[0]);
                    dst.metric_name.set_tag(&dst_label, format_g(*v));
                    dst.values.fill(f64::NAN);
                    m.insert(v.to_bits(), dst);
                }
                if let Some(dst) = m.get_mut(&v.to_bits()) {
                    let count = &mut dst.values[i];
                    *count = if count.is_nan() { 1.0 } else { *count + 1.0 };
                }
            }
        }
        Ok(m.into_iter().map(|(_, v)| v).collect())
    };

    let series = afa.take_series(1)?;
    aggr_func_ext(afe, series, &modifier, afa.limit, false)
}

fn aggr_func_topk(afa: &mut AggrFuncArg, is_reverse: bool) -> AggrFunctionResult {
    let name = if is_reverse { "bottomk" } else { "topk" };
    check_arg_count(name, afa.args.len(), 2, 2)?;
    let ks = afa.scalar_values(0)?;

    let afe = |mut tss: Vec<Timeseries>, _: &Option<AggregateModifier>| {
        for n in 0..tss[0].values.len() {
            tss.sort_by(|a, b| compare_series(a.values[n], a, b.values[n], b, is_reverse));
            fill_nans_at_idx(n, ks.get(n).copied().unwrap_or(f64::NAN), &mut tss)
        }
        remove_empty_series(&mut tss);
        tss.reverse();
        Ok(tss)
    };

    let series = afa.take_series(1)?;
    aggr_func_ext(afe, series, afa.modifier, afa.limit, true)
}

fn aggr_func_range_topk(
    afa: &mut AggrFuncArg,
    f: fn(&[f64]) -> f64,
    is_reverse: bool,
) -> AggrFunctionResult {
    check_arg_count("range_topk", afa.args.len(), 2, 3)?;
    let ks = afa.scalar_values(0)?;
    let remaining_sum_tag_name = if afa.args.len() == 3 {
        afa.args[2].get_string(2)?
    } else {
        String::new()
    };

    let afe = |tss: Vec<Timeseries>, modifier: &Option<AggregateModifier>| {
        Ok(get_range_topk_timeseries(
            tss,
            modifier,
            &ks,
            &remaining_sum_tag_name,
            f,
            is_reverse,
        ))
    };

    let series = afa.take_series(1)?;
    aggr_func_ext(afe, series, afa.modifier, afa.limit, true)
}

fn get_range_topk_timeseries<F>(
    tss: Vec<Timeseries>,
    modifier: &Option<AggregateModifier>,
    ks: &[f64],
    remaining_sum_tag_name: &str,
    f: F,
    is_reverse: bool,
) -> Vec<Timeseries>
where
    F: Fn(&[f64]) -> f64,
{
    let mut maxs: Vec<(f64, Timeseries)> = tss
        .into_iter()
        .map(|ts| (f(&ts.values), ts))
        .collect();

    maxs.sort_by(|a, b| compare_series(a.0, &a.1, b.0, &b.1, is_reverse));

    let mut series: Vec<Timeseries> = maxs.into_iter().map(|(_, ts)| ts).collect();

    let remaining_sum_ts =
        get_remaining_sum_timeseries(&series, modifier, ks, remaining_sum_tag_name);
    for (i, k) in ks.iter().enumerate() {
        fill_nans_at_idx(i, *k, &mut series)
    }
    if let Some(remaining) = remaining_sum_ts {
        series.push(remaining);
    }
    remove_empty_series(&mut series);
    series.reverse();
    series
}

/// Builds a series holding the sum of the values which did not make it into the top `k`.
/// The tag name may carry a value in the form `name=value`.
fn get_remaining_sum_timeseries(
    tss: &[Timeseries],
    modifier: &Option<AggregateModifier>,
    ks: &[f64],
    remaining_sum_tag_name: &str,
) -> Option<Timeseries> {
    if remaining_sum_tag_name.is_empty() || tss.is_empty() {
        return None;
    }
    let mut dst = Timeseries::copy_from_shallow_timestamps(&tss[0]);
    dst.metric_name.remove_group_tags(modifier);

    let (tag_name, tag_value) = match remaining_sum_tag_name.split_once('=') {
        Some((name, value)) => (name, value),
        None => (remaining_sum_tag_name, remaining_sum_tag_name),
    };
    dst.metric_name.set_tag(tag_name, tag_value);

    for (i, k) in ks.iter().enumerate() {
        let kn = get_int_k(*k, tss.len());
        let mut sum: f64 = 0.0;
        let mut count = 0;

        for ts in &tss[0..tss.len() - kn] {
            let v = ts.values[i];
            if v.is_nan() {
                continue;
            }
            sum += v;
            count += 1;
        }

        dst.values[i] = if count == 0 { f64::NAN } else { sum };
    }
    Some(dst)
}

fn fill_nans_at_idx(idx: usize, k: f64, tss: &mut [Timeseries]) {
    let kn = get_int_k(k, tss.len());
    let len = tss.len() - kn;
    for ts in tss[0..len].iter_mut() {
        ts.values[idx] = f64::NAN;
    }
}

fn get_int_k(k: f64, k_max: usize) -> usize {
    if k.is_nan() || k < 0.0 {
        return 0;
    }
    if k >= k_max as f64 {
        return k_max;
    }
    k as usize
}

/// Orders values ascending, or descending when `reverse` is set. NaN always goes first.
fn compare_with_nans(a: f64, b: f64, reverse: bool) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ if reverse => b.total_cmp(&a),
        _ => a.total_cmp(&b),
    }
}

/// Like [`compare_with_nans`], with ties broken by series identity in the same direction, so
/// that `topk` and `bottomk` keep different series when values are equal.
fn compare_series(
    a: f64,
    a_ts: &Timeseries,
    b: f64,
    b_ts: &Timeseries,
    reverse: bool,
) -> Ordering {
    compare_with_nans(a, b, reverse).then_with(|| {
        if reverse {
            b_ts.metric_name.cmp(&a_ts.metric_name)
        } else {
            a_ts.metric_name.cmp(&b_ts.metric_name)
        }
    })
}

fn min_value(values: &[f64]) -> f64 {
    values
        .iter()
        .copied()
        .filter(|v| !v.is_nan())
        .reduce(f64::min)
        .unwrap_or(f64::NAN)
}

fn max_value(values: &[f64]) -> f64 {
    values
        .iter()
        .copied()
        .filter(|v| !v.is_nan())
        .reduce(f64::max)
        .unwrap_or(f64::NAN)
}

fn avg_value(values: &[f64]) -> f64 {
    let mut sum: f64 = 0.0;
    let mut count = 0;
    for v in values.iter().filter(|v| !v.is_nan()) {
        count += 1;
        sum += v
    }
    if count == 0 {
        return f64::NAN;
    }
    sum / count as f64
}

fn median_value(values: &[f64]) -> f64 {
    quantile(0.5, values)
}

fn last_value(values: &[f64]) -> f64 {
    values
        .iter()
        .rev()
        .find(|v| !v.is_nan())
        .copied()
        .unwrap_or(f64::NAN)
}

fn aggr_func_outliers_mad(afa: &mut AggrFuncArg) -> AggrFunctionResult {
    check_arg_count("outliers_mad", afa.args.len(), 2, 2)?;
    let tolerances = afa.scalar_values(0)?;

    let afe = |tss: Vec<Timeseries>, _: &Option<AggregateModifier>| {
        // Calculate medians for each point across tss.
        let medians = get_per_point_medians(&tss);
        // Calculate MAD values multiplied by tolerance for each point across tss.
        // See https://en.wikipedia.org/wiki/Median_absolute_deviation
        let mut mads = get_per_point_mads(&tss, &medians);
        for (mad, tolerance) in mads.iter_mut().zip(tolerances.iter()) {
            *mad *= tolerance;
        }
        // Leave only time series with at least a single peak above the MAD multiplied by tolerance.
        let result = tss
            .into_iter()
            .filter(|ts| {
                ts.values
                    .iter()
                    .zip(medians.iter().zip(mads.iter()))
                    .any(|(v, (median, mad))| (v - median).abs() > *mad)
            })
            .collect();
        Ok(result)
    };

    let series = afa.take_series(1)?;
    aggr_func_ext(afe, series, afa.modifier, afa.limit, true)
}

fn get_per_point_medians(tss: &[Timeseries]) -> Vec<f64> {
    if tss.is_empty() {
        panic!("BUG: expecting non-empty tss")
    }
    let points = tss[0].values.len();
    let mut values = get_pooled_vec_f64(tss.len());
    let mut medians = Vec::with_capacity(points);
    for n in 0..points {
        values.clear();
        values.extend(tss.iter().map(|ts| ts.values[n]).filter(|v| !v.is_nan()));
        medians.push(quantile(0.5, &values));
    }
    medians
}

fn get_per_point_mads(tss: &[Timeseries], medians: &[f64]) -> Vec<f64> {
    let mut values = get_pooled_vec_f64(tss.len());
    let mut mads = Vec::with_capacity(medians.len());
    for (n, median) in medians.iter().enumerate() {
        values.clear();
        values.extend(
            tss.iter()
                .map(|ts| ts.values[n])
                .filter(|v| !v.is_nan())
                .map(|v| (v - median).abs()),
        );
        mads.push(quantile(0.5, &values));
    }
    mads
}

fn aggr_func_limitk(afa: &mut AggrFuncArg) -> AggrFunctionResult {
    check_arg_count("limitk", afa.args.len(), 2, 2)?;
    let limit = afa.args[0].get_int(0)?.max(0) as usize;

    let afe = |mut tss: Vec<Timeseries>, _: &Option<AggregateModifier>| {
        // Sort series by metric name hash in order to get consistent set of output series
        // across multiple calls to limitk() function.
        tss.sort_by_cached_key(|ts| ts.metric_name.signature());
        tss.truncate(limit);
        Ok(tss)
    };

    let series = afa.take_series(1)?;
    aggr_func_ext(afe, series, afa.modifier, afa.limit, true)
}

fn aggr_func_quantiles(afa: &mut AggrFuncArg) -> AggrFunctionResult {
    check_arg_count("quantiles", afa.args.len(), 3, usize::MAX)?;
    let dst_label = afa.args[0].get_string(0)?;

    let last = afa.args.len() - 1;
    let phis = afa.args[1..last]
        .iter()
        .enumerate()
        .map(|(i, arg)| arg.get_scalar(i + 1))
        .collect::<RuntimeResult<Vec<f64>>>()?;

    let afe = |tss: Vec<Timeseries>, _: &Option<AggregateModifier>| {
        let mut tss_dst: Vec<Timeseries> = phis
            .iter()
            .map(|phi| {
                let mut ts = Timeseries::copy_from_shallow_timestamps(&tss[0]);
                ts.metric_name.set_tag(&dst_label, format!("{phi}"));
                ts
            })
            .collect();

        let mut qs = vec![0.0; phis.len()];
        let mut values = get_pooled_vec_f64(tss.len());
        for n in 0..tss[0].values.len() {
            values.clear();
            values.extend(tss.iter().map(|ts| ts.values[n]));
            quantiles(&mut qs, &phis, &values);
            for (dst, q) in tss_dst.iter_mut().zip(qs.iter()) {
                dst.values[n] = *q;
            }
        }
        Ok(tss_dst)
    };

    let series = afa.take_series(last)?;
    aggr_func_ext(afe, series, afa.modifier, afa.limit, false)
}

fn aggr_func_quantile(afa: &mut AggrFuncArg) -> AggrFunctionResult {
    check_arg_count("quantile", afa.args.len(), 2, 2)?;
    let phis = afa.scalar_values(0)?;
    let series = afa.take_series(1)?;
    aggr_func_ext(
        new_aggr_quantile_func(&phis),
        series,
        afa.modifier,
        afa.limit,
        false,
    )
}

fn aggr_func_median(afa: &mut AggrFuncArg) -> AggrFunctionResult {
    let tss = get_aggr_timeseries(afa)?;
    let phis = vec![0.5; afa.ec.data_points()];
    aggr_func_ext(
        new_aggr_quantile_func(&phis),
        tss,
        afa.modifier,
        afa.limit,
        false,
    )
}

fn new_aggr_quantile_func(
    phis: &[f64],
) -> impl FnMut(Vec<Timeseries>, &Option<AggregateModifier>) -> AggrFunctionResult + '_ {
    move |mut tss: Vec<Timeseries>, _: &Option<AggregateModifier>| {
        let mut values = get_pooled_vec_f64(tss.len());
        for n in 0..tss[0].values.len() {
            values.clear();
            values.extend(tss.iter().map(|ts| ts.values[n]));
            let phi = phis.get(n).copied().unwrap_or(f64::NAN);
            tss[0].values[n] = quantile(phi, &values);
        }
        tss.truncate(1);
        Ok(tss)
    }
}
