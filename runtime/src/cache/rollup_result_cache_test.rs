use std::sync::Arc;

use pretty_assertions::assert_eq;

use vmquery_ast::expr::{Expr, FunctionExpr, MetricExpr};
use vmquery_ast::label::LabelFilter;

use super::*;
use crate::types::MetricName;

struct TestContext {
    expr: Expr,
    ec: EvalConfig,
    cache: RollupResultCache,
    window: i64,
}

fn setup() -> TestContext {
    let mut ec = EvalConfig::new(1000, 2000, 200);
    ec.set_caching(true);
    let me = MetricExpr::with_filters(vec![LabelFilter::equal("aaa", "xxx")]);
    let expr = Expr::Function(FunctionExpr::new("rate", vec![Expr::MetricExpression(me)]).unwrap());
    TestContext {
        expr,
        ec,
        cache: RollupResultCache::with_size(1024 * 1024),
        window: 456,
    }
}

fn create_ts(timestamps: &[i64], values: &[f64]) -> Timeseries {
    Timeseries::new(timestamps.to_vec(), values.to_vec())
}

fn named_ts(name: &str, timestamps: &[i64], values: &[f64]) -> Timeseries {
    let mut ts = create_ts(timestamps, values);
    ts.metric_name = MetricName::new(name);
    ts
}

fn assert_series_equal(tss: &[Timeseries], expected: &[Timeseries]) {
    assert_eq!(tss.len(), expected.len(), "unexpected series count");
    let mut tss = tss.to_vec();
    let mut expected = expected.to_vec();
    tss.sort_by(|a, b| a.metric_name.cmp(&b.metric_name));
    expected.sort_by(|a, b| a.metric_name.cmp(&b.metric_name));
    for (ts, ts_expected) in tss.iter().zip(expected.iter()) {
        assert_eq!(ts.metric_name, ts_expected.metric_name);
        assert_eq!(ts.timestamps, ts_expected.timestamps);
        assert_eq!(ts.values.len(), ts_expected.values.len());
        for (v, v_expected) in ts.values.iter().zip(ts_expected.values.iter()) {
            if v_expected.is_nan() {
                assert!(v.is_nan(), "expected NaN; got {v}");
            } else {
                assert_eq!(v, v_expected);
            }
        }
    }
}

#[test]
fn empty_cache_is_a_miss() {
    let TestContext { cache, ec, expr, window } = setup();
    let (tss, new_start) = cache.get(&ec, &expr, window).unwrap();
    assert!(tss.is_none());
    assert_eq!(new_start, ec.start);
    assert_eq!(cache.stats().misses, 1);
}

#[test]
fn uncacheable_config_is_bypassed() {
    let TestContext { cache, mut ec, expr, window } = setup();
    ec.disable_cache = true;
    cache
        .put(&ec, &expr, window, &[create_ts(&[1000, 1200], &[1.0, 2.0])])
        .unwrap();
    assert!(cache.is_empty());
    let (tss, new_start) = cache.get(&ec, &expr, window).unwrap();
    assert!(tss.is_none());
    assert_eq!(new_start, ec.start);
}

#[test]
fn start_overlap() {
    let TestContext { cache, ec, expr, window } = setup();
    let tss = vec![create_ts(&[800, 1000, 1200], &[0.0, 1.0, 2.0])];
    cache.put(&ec, &expr, window, &tss).unwrap();

    let (tss, new_start) = cache.get(&ec, &expr, window).unwrap();
    assert_eq!(new_start, 1400);
    assert_series_equal(&tss.unwrap(), &[create_ts(&[1000, 1200], &[1.0, 2.0])]);
    assert_eq!(cache.stats().partial_hits, 1);
}

#[test]
fn end_overlap_is_a_miss() {
    let TestContext { cache, ec, expr, window } = setup();
    let tss = vec![create_ts(&[1800, 2000, 2200, 2400], &[333.0, 0.0, 1.0, 2.0])];
    cache.put(&ec, &expr, window, &tss).unwrap();

    let (tss, new_start) = cache.get(&ec, &expr, window).unwrap();
    assert!(tss.is_none());
    assert_eq!(new_start, 1000);
}

#[test]
fn middle_overlap_is_a_miss() {
    let TestContext { cache, ec, expr, window } = setup();
    let tss = vec![create_ts(&[1200, 1400, 1600], &[0.0, 1.0, 2.0])];
    cache.put(&ec, &expr, window, &tss).unwrap();

    let (tss, new_start) = cache.get(&ec, &expr, window).unwrap();
    assert!(tss.is_none());
    assert_eq!(new_start, 1000);
}

#[test]
fn superset_is_a_full_hit() {
    let TestContext { cache, ec, expr, window } = setup();
    let tss = vec![create_ts(
        &[800, 1000, 1200, 1400, 1600, 1800, 2000, 2200],
        &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0],
    )];
    cache.put(&ec, &expr, window, &tss).unwrap();

    let (tss, new_start) = cache.get(&ec, &expr, window).unwrap();
    assert_eq!(new_start, 2200);
    let expected = create_ts(
        &[1000, 1200, 1400, 1600, 1800, 2000],
        &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
    );
    assert_series_equal(&tss.unwrap(), &[expected]);
    assert_eq!(cache.stats().full_hits, 1);
}

#[test]
fn best_entry_is_picked_among_several() {
    let TestContext { cache, ec, expr, window } = setup();
    let stored = [
        create_ts(&[800, 1000, 1200], &[0.0, 1.0, 2.0]),
        create_ts(&[1800, 2000, 2200, 2400], &[333.0, 0.0, 1.0, 2.0]),
        create_ts(&[1200, 1400, 1600], &[0.0, 1.0, 2.0]),
        create_ts(&[600, 800, 1000, 1200, 1400], &[333.0, 0.0, 1.0, 2.0, 3.0]),
    ];
    for ts in stored {
        cache.put(&ec, &expr, window, &[ts]).unwrap();
    }

    let (tss, new_start) = cache.get(&ec, &expr, window).unwrap();
    assert_eq!(new_start, 1600);
    assert_series_equal(&tss.unwrap(), &[create_ts(&[1000, 1200, 1400], &[1.0, 2.0, 3.0])]);
}

#[test]
fn multiple_series_share_timestamps() {
    let TestContext { cache, ec, expr, window } = setup();
    let tss = vec![
        named_ts("a", &[800, 1000, 1200], &[0.0, 1.0, 2.0]),
        named_ts("b", &[800, 1000, 1200], &[f64::NAN, 3.0, f64::NAN]),
    ];
    cache.put(&ec, &expr, window, &tss).unwrap();

    let (tss, new_start) = cache.get(&ec, &expr, window).unwrap();
    assert_eq!(new_start, 1400);
    let tss = tss.unwrap();
    assert!(Arc::ptr_eq(&tss[0].timestamps, &tss[1].timestamps));
    assert_series_equal(
        &tss,
        &[
            named_ts("a", &[1000, 1200], &[1.0, 2.0]),
            named_ts("b", &[1000, 1200], &[f64::NAN, 3.0]),
        ],
    );
}

#[test]
fn different_windows_do_not_collide() {
    let TestContext { cache, ec, expr, window } = setup();
    cache
        .put(&ec, &expr, window, &[create_ts(&[1000, 1200], &[1.0, 2.0])])
        .unwrap();
    let (tss, _) = cache.get(&ec, &expr, window + 1).unwrap();
    assert!(tss.is_none());
}

#[test]
fn already_covered_range_is_not_stored_twice() {
    let TestContext { cache, ec, expr, window } = setup();
    let tss = vec![create_ts(&[800, 1000, 1200, 1400], &[0.0, 1.0, 2.0, 3.0])];
    cache.put(&ec, &expr, window, &tss).unwrap();
    let len = cache.len();
    cache
        .put(&ec, &expr, window, &[create_ts(&[1000, 1200], &[1.0, 2.0])])
        .unwrap();
    assert_eq!(cache.len(), len);
}

#[test]
fn partial_responses_are_not_stored() {
    let TestContext { cache, ec, expr, window } = setup();
    ec.mark_partial_response();
    cache
        .put(&ec, &expr, window, &[create_ts(&[1000, 1200], &[1.0, 2.0])])
        .unwrap();
    assert!(cache.is_empty());
}

#[test]
fn recent_points_are_not_stored() {
    let TestContext { cache, expr, window, .. } = setup();
    let now = Timestamp::now();
    let step = 60_000;
    let start = now - now % step - 20 * step;
    let end = start + 20 * step;
    let mut ec = EvalConfig::new(start, end, step);
    ec.cache_timestamp_offset = 5 * step;
    let timestamps = (0..=20).map(|i| start + i * step).collect::<Vec<_>>();
    let values = vec![1.0; timestamps.len()];
    cache
        .put(&ec, &expr, window, &[create_ts(&timestamps, &values)])
        .unwrap();

    let (tss, new_start) = cache.get(&ec, &expr, window).unwrap();
    let tss = tss.unwrap();
    assert!(tss[0].len() < timestamps.len());
    assert!(new_start <= now - 5 * step);
}

#[test]
fn too_big_results_are_skipped() {
    let TestContext { ec, expr, window, .. } = setup();
    let cache = RollupResultCache::with_size(64);
    cache
        .put(&ec, &expr, window, &[create_ts(&[1000, 1200], &[1.0, 2.0])])
        .unwrap();
    assert_eq!(cache.stats().too_big, 1);
    assert!(cache.is_empty());
}

#[test]
fn reset_makes_entries_unreachable() {
    let TestContext { cache, ec, expr, window } = setup();
    cache
        .put(&ec, &expr, window, &[create_ts(&[1000, 1200], &[1.0, 2.0])])
        .unwrap();
    cache.reset();
    let (tss, new_start) = cache.get(&ec, &expr, window).unwrap();
    assert!(tss.is_none());
    assert_eq!(new_start, ec.start);
    assert_eq!(cache.stats().resets, 1);
}

/// Forgets everything stored with `set_big`.
#[derive(Default)]
struct LossyStorage {
    small: FastHashMap<Vec<u8>, Vec<u8>>,
}

impl RollupResultCacheStorage for LossyStorage {
    fn get(&mut self, k: &[u8], dst: &mut Vec<u8>) -> bool {
        match self.small.get(k) {
            Some(v) => {
                dst.extend_from_slice(v);
                true
            }
            None => false,
        }
    }

    fn get_big(&mut self, _k: &[u8], _dst: &mut Vec<u8>) -> bool {
        false
    }

    fn set(&mut self, k: &[u8], v: &[u8]) {
        self.small.insert(k.to_vec(), v.to_vec());
    }

    fn set_big(&mut self, _k: &[u8], _v: &[u8]) {}

    fn clear(&mut self) {
        self.small.clear()
    }

    fn len(&self) -> usize {
        self.small.len()
    }
}

#[test]
fn evicted_payload_drops_index_entry() {
    let TestContext { ec, expr, window, .. } = setup();
    let cache = RollupResultCache::with_storage(Box::new(LossyStorage::default()), 1 << 20);
    cache
        .put(&ec, &expr, window, &[create_ts(&[1000, 1200], &[1.0, 2.0])])
        .unwrap();
    let (tss, _) = cache.get(&ec, &expr, window).unwrap();
    assert!(tss.is_none());

    // The index no longer references the lost payload.
    let mut meta_key = vec![];
    cache.marshal_rollup_result_cache_key(&mut meta_key, &expr, window, &ec);
    let mut buf = vec![];
    assert!(cache.storage().get(&meta_key, &mut buf));
    let mi = RollupResultCacheMetaInfo::from_buf(&buf).unwrap();
    assert!(mi.entries.is_empty());
}

#[test]
fn meta_info_keeps_bounded_history() {
    let mut mi = RollupResultCacheMetaInfo::default();
    for i in 0..31 {
        let key = RollupResultCacheKey { prefix: 1, suffix: i };
        mi.add_key(key, i as i64 * 10, i as i64 * 10 + 5);
    }
    assert_eq!(mi.entries.len(), 21);
    assert_eq!(mi.entries[0].key.suffix, 10);

    let mut buf = vec![];
    mi.marshal(&mut buf);
    assert_eq!(RollupResultCacheMetaInfo::from_buf(&buf).unwrap(), mi);
}

#[test]
fn meta_info_best_key() {
    let mut mi = RollupResultCacheMetaInfo::default();
    let k1 = RollupResultCacheKey { prefix: 1, suffix: 1 };
    let k2 = RollupResultCacheKey { prefix: 1, suffix: 2 };
    let k3 = RollupResultCacheKey { prefix: 1, suffix: 3 };
    mi.add_key(k1, 100, 200);
    mi.add_key(k2, 50, 400);
    mi.add_key(k3, 150, 500);

    assert_eq!(mi.get_best_key(100, 300), Some(k2));
    assert_eq!(mi.get_best_key(10, 300), None);
    assert!(mi.covers_time_range(60, 390));
    assert!(!mi.covers_time_range(10, 20));

    mi.remove_key(k2);
    assert_eq!(mi.get_best_key(100, 300), Some(k1));
}

fn merge_config() -> EvalConfig {
    EvalConfig::new(1000, 2000, 200)
}

#[test]
fn merge_b_start_equals_ec_start() {
    let ec = merge_config();
    let b = vec![create_ts(
        &[1000, 1200, 1400, 1600, 1800, 2000],
        &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
    )];
    let tss = merge_timeseries(vec![], b.clone(), 1000, &ec).unwrap().unwrap();
    assert_series_equal(&tss, &b);
    assert!(Arc::ptr_eq(&tss[0].timestamps, &ec.get_timestamps().unwrap()));
}

#[test]
fn merge_a_empty() {
    let ec = merge_config();
    let b = vec![create_ts(&[1400, 1600, 1800, 2000], &[3.0, 4.0, 5.0, 6.0])];
    let tss = merge_timeseries(vec![], b, 1400, &ec).unwrap().unwrap();
    let nan = f64::NAN;
    let expected = create_ts(
        &[1000, 1200, 1400, 1600, 1800, 2000],
        &[nan, nan, 3.0, 4.0, 5.0, 6.0],
    );
    assert_series_equal(&tss, &[expected]);
}

#[test]
fn merge_b_empty() {
    let ec = merge_config();
    let a = vec![create_ts(&[1000, 1200], &[2.0, 1.0])];
    let tss = merge_timeseries(a, vec![], 1400, &ec).unwrap().unwrap();
    let nan = f64::NAN;
    let expected = create_ts(
        &[1000, 1200, 1400, 1600, 1800, 2000],
        &[2.0, 1.0, nan, nan, nan, nan],
    );
    assert_series_equal(&tss, &[expected]);
}

#[test]
fn merge_non_empty() {
    let ec = merge_config();
    let a = vec![create_ts(&[1000, 1200], &[2.0, 1.0])];
    let b = vec![create_ts(&[1400, 1600, 1800, 2000], &[3.0, 4.0, 5.0, 6.0])];
    let tss = merge_timeseries(a, b, 1400, &ec).unwrap().unwrap();
    let expected = create_ts(
        &[1000, 1200, 1400, 1600, 1800, 2000],
        &[2.0, 1.0, 3.0, 4.0, 5.0, 6.0],
    );
    assert_series_equal(&tss, &[expected]);
}

#[test]
fn merge_distinct_metric_names() {
    let ec = merge_config();
    let a = vec![named_ts("bar", &[1000, 1200], &[2.0, 1.0])];
    let b = vec![named_ts("foo", &[1400, 1600, 1800, 2000], &[3.0, 4.0, 5.0, 6.0])];
    let tss = merge_timeseries(a, b, 1400, &ec).unwrap().unwrap();
    let nan = f64::NAN;
    let grid = [1000, 1200, 1400, 1600, 1800, 2000];
    assert_series_equal(
        &tss,
        &[
            named_ts("foo", &grid, &[nan, nan, 3.0, 4.0, 5.0, 6.0]),
            named_ts("bar", &grid, &[2.0, 1.0, nan, nan, nan, nan]),
        ],
    );
}

#[test]
fn merge_refuses_duplicates() {
    let ec = merge_config();
    let a = vec![
        named_ts("bar", &[1000, 1200], &[2.0, 1.0]),
        named_ts("bar", &[1000, 1200], &[3.0, 4.0]),
    ];
    let b = vec![named_ts("bar", &[1400, 1600, 1800, 2000], &[3.0, 4.0, 5.0, 6.0])];
    assert!(merge_timeseries(a, b, 1400, &ec).unwrap().is_none());
}

#[test]
#[should_panic(expected = "BUG: invalid timestamps")]
fn merge_panics_on_misaligned_input() {
    let ec = merge_config();
    let a = vec![create_ts(&[1000, 1300], &[2.0, 1.0])];
    let b = vec![create_ts(&[1400, 1600, 1800, 2000], &[3.0, 4.0, 5.0, 6.0])];
    let _ = merge_timeseries(a, b, 1400, &ec);
}
