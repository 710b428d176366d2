use std::collections::hash_map::Entry;

use vmquery_ast::expr::{BinaryExpr, VectorMatchCardinality, VectorMatchModifier};
use vmquery_ast::operator::Operator;
use vmquery_common::hash::{FastHashMap, Signature};

use crate::runtime_error::{RuntimeError, RuntimeResult};
use crate::types::{remove_empty_series, MetricName, Timeseries};

use super::binop_fns::{get_scalar_binop_handler, BinopFunc};

pub(crate) struct BinaryOpFuncArg<'a> {
    be: &'a BinaryExpr,
    left: Vec<Timeseries>,
    right: Vec<Timeseries>,
}

impl<'a> BinaryOpFuncArg<'a> {
    pub fn new(left: Vec<Timeseries>, be: &'a BinaryExpr, right: Vec<Timeseries>) -> Self {
        Self { left, be, right }
    }

    fn matching(&self) -> &'a Option<VectorMatchModifier> {
        match &self.be.modifier {
            Some(modifier) => &modifier.matching,
            None => &None,
        }
    }

    fn cardinality(&self) -> Option<&'a VectorMatchCardinality> {
        self.be.modifier.as_ref().map(|modifier| &modifier.card)
    }
}

pub type BinaryOpFuncResult = RuntimeResult<Vec<Timeseries>>;

type TimeseriesHashMap = FastHashMap<Signature, Vec<Timeseries>>;

/// Applies the binary operator of `bfa.be` to the already evaluated operands.
pub(crate) fn exec_binop(bfa: &mut BinaryOpFuncArg) -> BinaryOpFuncResult {
    use Operator::*;
    match bfa.be.op {
        Add | Atan2 | Sub | Mul | Div | Mod | Pow | Eql | NotEq | Gt | Gte | Lt | Lte => {
            let bf = get_scalar_binop_handler(bfa.be.op, bfa.be.returns_bool());
            binary_op_func_impl(bf, bfa)
        }
        And => binary_op_and(bfa),
        Or => binary_op_or(bfa),
        Unless => binary_op_unless(bfa),
        If => binary_op_if(bfa),
        IfNot => binary_op_if_not(bfa),
        Default => binary_op_default(bfa),
    }
}

/// The result name is dropped unless the operator keeps the meaning of the left side.
pub(crate) fn should_reset_metric_group(be: &BinaryExpr) -> bool {
    if be.keep_metric_names() {
        return false;
    }
    if be.op.is_comparison() {
        // Filtering comparisons keep the name like Prometheus does.
        return be.returns_bool();
    }
    !be.op.keeps_metric_name()
}

fn binary_op_func_impl(bf: BinopFunc, bfa: &mut BinaryOpFuncArg) -> BinaryOpFuncResult {
    if bfa.left.is_empty() || bfa.right.is_empty() {
        return Ok(vec![]);
    }

    if !bfa.be.op.is_comparison() {
        // Empty series are kept for comparisons, since `foo > bool bar` must return 0 for them.
        remove_empty_series(&mut bfa.left);
        remove_empty_series(&mut bfa.right);
        if bfa.left.is_empty() || bfa.right.is_empty() {
            return Ok(vec![]);
        }
    }

    let reset_name = should_reset_metric_group(bfa.be);
    let has_modifier = bfa.matching().is_some()
        || bfa.cardinality().map_or(false, |card| card.is_grouping());

    if !has_modifier {
        if is_scalar(&bfa.left) {
            // Fast path: `scalar op vector`.
            let left = &bfa.left[0];
            let mut dst = std::mem::take(&mut bfa.right);
            for ts in dst.iter_mut() {
                check_value_lengths(left, ts);
                if reset_name {
                    ts.metric_name.reset_metric_group();
                }
                for (value, left_value) in ts.values.iter_mut().zip(left.values.iter()) {
                    *value = bf(*left_value, *value);
                }
            }
            return Ok(dst);
        }
        if is_scalar(&bfa.right) {
            // Fast path: `vector op scalar`.
            let right = &bfa.right[0];
            let mut dst = std::mem::take(&mut bfa.left);
            for ts in dst.iter_mut() {
                check_value_lengths(ts, right);
                if reset_name {
                    ts.metric_name.reset_metric_group();
                }
                for (value, right_value) in ts.values.iter_mut().zip(right.values.iter()) {
                    *value = bf(*value, *right_value);
                }
            }
            return Ok(dst);
        }
    }

    let (mut left, mut right) = adjust_binary_op_tags(bfa, reset_name)?;
    if left.len() != right.len() {
        panic!(
            "BUG: left.len() must match right.len(); got {} vs {}",
            left.len(),
            right.len()
        );
    }

    let is_right = matches!(bfa.cardinality(), Some(VectorMatchCardinality::OneToMany(_)));

    for (left_ts, right_ts) in left.iter_mut().zip(right.iter_mut()) {
        check_value_lengths(left_ts, right_ts);
        if is_right {
            for (left_val, right_val) in left_ts.values.iter().zip(right_ts.values.iter_mut()) {
                *right_val = bf(*left_val, *right_val);
            }
        } else {
            for (left_val, right_val) in left_ts.values.iter_mut().zip(right_ts.values.iter()) {
                *left_val = bf(*left_val, *right_val);
            }
        }
    }

    // do not remove time series containing only NaNs, since then the `(foo op bar) default N`
    // won't work as expected if `(foo op bar)` results to NaN series.
    if is_right {
        Ok(right)
    } else {
        Ok(left)
    }
}

fn check_value_lengths(left: &Timeseries, right: &Timeseries) {
    if left.values.len() != right.values.len() {
        panic!(
            "BUG: left_values.len() must match right_values.len(); got {} vs {}",
            left.values.len(),
            right.values.len()
        );
    }
}

/// Pairs up the operand series by their matching key. Returns index-aligned left and right
/// series; the side that receives the result already carries the output name.
fn adjust_binary_op_tags(
    bfa: &mut BinaryOpFuncArg,
    reset_name: bool,
) -> RuntimeResult<(Vec<Timeseries>, Vec<Timeseries>)> {
    let be = bfa.be;
    let matching = bfa.matching();
    let card = bfa.cardinality();
    let (mut m_left, mut m_right) = create_timeseries_map_by_tag_set(bfa);

    let mut rvs_left: Vec<Timeseries> = Vec::with_capacity(m_left.len());
    let mut rvs_right: Vec<Timeseries> = Vec::with_capacity(m_left.len());

    for (k, tss_left) in m_left.drain() {
        let tss_right = match m_right.remove(&k) {
            Some(tss) if !tss.is_empty() => tss,
            _ => continue,
        };

        match card {
            Some(VectorMatchCardinality::ManyToOne(join_tags)) => {
                let one = ensure_single_timeseries("right", be, tss_right)?;
                group_join(join_tags, reset_name, tss_left, &one, &mut rvs_left, &mut rvs_right);
            }
            Some(VectorMatchCardinality::OneToMany(join_tags)) => {
                let one = ensure_single_timeseries("left", be, tss_left)?;
                group_join(join_tags, reset_name, tss_right, &one, &mut rvs_right, &mut rvs_left);
            }
            _ => {
                let mut ts_left = ensure_single_timeseries("left", be, tss_left)?;
                let ts_right = ensure_single_timeseries("right", be, tss_right)?;
                if reset_name {
                    ts_left.metric_name.reset_metric_group();
                }
                ts_left.metric_name.update_tags_by_group_modifier(matching);
                rvs_left.push(ts_left);
                rvs_right.push(ts_right);
            }
        }
    }

    Ok((rvs_left, rvs_right))
}

/// Every series on the "many" side is paired with the single series of the "one" side and
/// receives the listed tags from it when it doesn't carry them already.
fn group_join(
    join_tags: &[String],
    reset_name: bool,
    many: Vec<Timeseries>,
    one: &Timeseries,
    rvs_many: &mut Vec<Timeseries>,
    rvs_one: &mut Vec<Timeseries>,
) {
    for mut ts in many.into_iter() {
        if reset_name {
            ts.metric_name.reset_metric_group();
        }
        ts.metric_name.add_missing_tags(join_tags, &one.metric_name);
        rvs_many.push(ts);
        rvs_one.push(Timeseries::copy_from_shallow_timestamps(one));
    }
}

/// Collapses the series sharing a matching key into one. This succeeds only when they don't
/// overlap in time, otherwise the operand has a duplicate on the given side.
fn ensure_single_timeseries(
    side: &'static str,
    be: &BinaryExpr,
    mut tss: Vec<Timeseries>,
) -> RuntimeResult<Timeseries> {
    let mut acc = match tss.pop() {
        Some(ts) => ts,
        None => panic!("BUG: tss must contain at least one value"),
    };

    for ts in tss.iter() {
        if !merge_non_overlapping_timeseries(&mut acc, ts) {
            return Err(RuntimeError::DuplicateTimeseries {
                side,
                expr: be.to_string(),
                series: format!("{} and {}", acc.metric_name, ts.metric_name),
            });
        }
    }

    Ok(acc)
}

/// Copies the non-NaN points of `src` into `dst`. Returns false without touching `dst` when
/// both series have a value at the same position.
pub(crate) fn merge_non_overlapping_timeseries(dst: &mut Timeseries, src: &Timeseries) -> bool {
    let overlaps = src
        .values
        .iter()
        .zip(dst.values.iter())
        .any(|(src_val, dst_val)| !src_val.is_nan() && !dst_val.is_nan());
    if overlaps {
        return false;
    }

    for (src_val, dst_val) in src.values.iter().zip(dst.values.iter_mut()) {
        if !src_val.is_nan() {
            *dst_val = *src_val
        }
    }
    true
}

/// vector1 and vector2 results in a vector consisting of the elements of vector1 for which there
/// are elements in vector2 with exactly matching label sets.
/// Other elements are dropped. The metric name and values are carried over from the left-hand side vector.
fn binary_op_and(bfa: &mut BinaryOpFuncArg) -> BinaryOpFuncResult {
    if bfa.left.is_empty() || bfa.right.is_empty() {
        return Ok(vec![]);
    }

    let (mut m_left, m_right) = create_timeseries_map_by_tag_set(bfa);
    let mut rvs: Vec<Timeseries> = Vec::with_capacity(m_left.len().min(m_right.len()));

    for (k, tss_right) in m_right.into_iter() {
        if let Some(mut tss_left) = m_left.remove(&k) {
            // Add gaps to tss_left if there are gaps at tss_right.
            add_right_nans_to_left(&mut tss_left, &tss_right);
            rvs.extend(tss_left);
        }
    }

    Ok(rvs)
}

/// Every left series is kept, with its gaps filled from the matching right series. Right series
/// without a left counterpart are appended.
fn binary_op_or(bfa: &mut BinaryOpFuncArg) -> BinaryOpFuncResult {
    if bfa.left.is_empty() {
        return Ok(std::mem::take(&mut bfa.right));
    }
    if bfa.right.is_empty() {
        return Ok(std::mem::take(&mut bfa.left));
    }

    let (mut m_left, m_right) = create_timeseries_map_by_tag_set(bfa);
    let mut extra: Vec<Timeseries> = vec![];

    for (k, tss_right) in m_right.into_iter() {
        match m_left.get_mut(&k) {
            Some(tss_left) => fill_left_nans_with_right_values(tss_left, &tss_right),
            None => extra.extend(tss_right),
        }
    }

    let mut rvs: Vec<Timeseries> = m_left.into_iter().flat_map(|(_, v)| v).collect();
    // Sort both parts by metric name as Prometheus does.
    sort_series_by_metric_name(&mut rvs);
    sort_series_by_metric_name(&mut extra);
    rvs.append(&mut extra);

    Ok(rvs)
}

/// vector1 unless vector2 results in a vector consisting of the elements of vector1
/// for which there are no elements in vector2 with exactly matching label sets.
fn binary_op_unless(bfa: &mut BinaryOpFuncArg) -> BinaryOpFuncResult {
    if bfa.right.is_empty() || bfa.left.is_empty() {
        return Ok(std::mem::take(&mut bfa.left));
    }

    let (m_left, m_right) = create_timeseries_map_by_tag_set(bfa);
    let mut rvs: Vec<Timeseries> = Vec::with_capacity(m_left.len());

    for (k, mut tss_left) in m_left.into_iter() {
        if let Some(tss_right) = m_right.get(&k) {
            // Add gaps to tss_left if there are no gaps at tss_right.
            add_left_nans_if_no_right_nans(&mut tss_left, tss_right);
        }
        rvs.append(&mut tss_left);
    }

    Ok(rvs)
}

/// q1 if q2 removes values from q1 for missing values from q2.
fn binary_op_if(bfa: &mut BinaryOpFuncArg) -> BinaryOpFuncResult {
    let (m_left, m_right) = create_timeseries_map_by_tag_set(bfa);
    let mut rvs: Vec<Timeseries> = Vec::with_capacity(m_left.len());

    for (k, mut tss_left) in m_left.into_iter() {
        if let Some(tss_right) = series_by_key(&m_right, &k) {
            add_right_nans_to_left(&mut tss_left, tss_right);
            rvs.append(&mut tss_left);
        }
    }

    Ok(rvs)
}

/// q1 ifnot q2 removes values from q1 for existing values from q2.
fn binary_op_if_not(bfa: &mut BinaryOpFuncArg) -> BinaryOpFuncResult {
    let (m_left, m_right) = create_timeseries_map_by_tag_set(bfa);
    let mut rvs: Vec<Timeseries> = Vec::with_capacity(m_left.len());

    for (k, mut tss_left) in m_left.into_iter() {
        if let Some(tss_right) = series_by_key(&m_right, &k) {
            add_left_nans_if_no_right_nans(&mut tss_left, tss_right);
        }
        rvs.append(&mut tss_left);
    }

    Ok(rvs)
}

/// q1 default q2 fills gaps in q1 with the corresponding values from q2.
fn binary_op_default(bfa: &mut BinaryOpFuncArg) -> BinaryOpFuncResult {
    if bfa.left.is_empty() {
        return Ok(std::mem::take(&mut bfa.right));
    }

    let (m_left, m_right) = create_timeseries_map_by_tag_set(bfa);
    let mut rvs: Vec<Timeseries> = Vec::with_capacity(m_left.len());

    for (k, mut tss_left) in m_left.into_iter() {
        if let Some(tss_right) = series_by_key(&m_right, &k) {
            fill_left_nans_with_right_values(&mut tss_left, tss_right);
        }
        rvs.append(&mut tss_left);
    }

    Ok(rvs)
}

/// Fill gaps in tss_left with values from tss_right as Prometheus does.
fn fill_left_nans_with_right_values(tss_left: &mut [Timeseries], tss_right: &[Timeseries]) {
    for ts_left in tss_left.iter_mut() {
        for (i, left_value) in ts_left.values.iter_mut().enumerate() {
            if !left_value.is_nan() {
                continue;
            }
            if let Some(v) = tss_right
                .iter()
                .map(|ts| ts.values[i])
                .find(|v| !v.is_nan())
            {
                *left_value = v;
            }
        }
    }
}

fn add_right_nans_to_left(tss_left: &mut Vec<Timeseries>, tss_right: &[Timeseries]) {
    for ts_left in tss_left.iter_mut() {
        for (i, left_value) in ts_left.values.iter_mut().enumerate() {
            let has_value = tss_right.iter().any(|ts| !ts.values[i].is_nan());
            if !has_value {
                *left_value = f64::NAN
            }
        }
    }

    remove_empty_series(tss_left)
}

fn add_left_nans_if_no_right_nans(tss_left: &mut Vec<Timeseries>, tss_right: &[Timeseries]) {
    for ts_left in tss_left.iter_mut() {
        for (i, left_value) in ts_left.values.iter_mut().enumerate() {
            if tss_right.iter().any(|ts| !ts.values[i].is_nan()) {
                *left_value = f64::NAN;
            }
        }
    }

    remove_empty_series(tss_left);
}

/// The key two series are matched by: the tags left after applying `on`/`ignoring`,
/// without the metric name.
fn matching_signature(mn: &MetricName, modifier: &Option<VectorMatchModifier>) -> Signature {
    let mut key = mn.clone();
    key.reset_metric_group();
    key.update_tags_by_group_modifier(modifier);
    key.tags_signature()
}

fn get_tags_map(arg: Vec<Timeseries>, modifier: &Option<VectorMatchModifier>) -> TimeseriesHashMap {
    let mut m: TimeseriesHashMap = FastHashMap::with_capacity(arg.len());

    for ts in arg.into_iter() {
        let key = matching_signature(&ts.metric_name, modifier);
        match m.entry(key) {
            Entry::Occupied(mut entry) => entry.get_mut().push(ts),
            Entry::Vacant(entry) => {
                entry.insert(vec![ts]);
            }
        }
    }

    m
}

fn create_timeseries_map_by_tag_set(
    bfa: &mut BinaryOpFuncArg,
) -> (TimeseriesHashMap, TimeseriesHashMap) {
    let modifier = bfa.matching();
    let m_left = get_tags_map(std::mem::take(&mut bfa.left), modifier);
    let m_right = get_tags_map(std::mem::take(&mut bfa.right), modifier);
    (m_left, m_right)
}

/// A scalar operand is a single series without a name and tags.
pub(crate) fn is_scalar(arg: &[Timeseries]) -> bool {
    arg.len() == 1 && arg[0].metric_name.is_empty()
}

/// Looks up `key`, falling back to a scalar right side which matches everything.
fn series_by_key<'a>(m: &'a TimeseriesHashMap, key: &Signature) -> Option<&'a Vec<Timeseries>> {
    if let Some(v) = m.get(key) {
        return Some(v);
    }
    if m.len() != 1 {
        return None;
    }
    m.values().next().filter(|tss| is_scalar(tss))
}

fn sort_series_by_metric_name(tss: &mut [Timeseries]) {
    tss.sort_by(|a, b| a.metric_name.cmp(&b.metric_name));
}
