use pretty_assertions::assert_eq;

use vmquery_ast::expr::AggregateModifier;
use vmquery_ast::functions::AggregateFunction;

use crate::execution::EvalConfig;
use crate::functions::aggregate::{get_aggr_func, AggrFuncArg};
use crate::runtime_error::{RuntimeError, RuntimeResult};
use crate::tests::utils::compare_values;
use crate::types::{MetricName, QueryValue, Timeseries};

const NAN: f64 = f64::NAN;

fn eval_config() -> EvalConfig {
    EvalConfig::new(100_000, 400_000, 100_000)
}

fn series(ec: &EvalConfig, name: &str, tags: &[(&str, &str)], values: &[f64]) -> Timeseries {
    let timestamps = ec.get_timestamps().unwrap();
    let mut ts = Timeseries::with_shared_timestamps(&timestamps, values);
    ts.metric_name.set_metric_group(name);
    for (k, v) in tags {
        ts.metric_name.set_tag(k, *v);
    }
    ts
}

fn name(metric: &str, tags: &[(&str, &str)]) -> MetricName {
    let mut mn = MetricName::new(metric);
    for (k, v) in tags {
        mn.set_tag(k, *v);
    }
    mn
}

fn aggregate(
    ec: &EvalConfig,
    func: AggregateFunction,
    args: Vec<QueryValue>,
    modifier: Option<AggregateModifier>,
    limit: usize,
) -> RuntimeResult<Vec<Timeseries>> {
    let mut afa = AggrFuncArg::new(ec, args, &modifier, limit);
    let mut result = get_aggr_func(func)(&mut afa)?;
    result.sort_by(|a, b| a.metric_name.cmp(&b.metric_name));
    Ok(result)
}

fn by(labels: &[&str]) -> Option<AggregateModifier> {
    Some(AggregateModifier::By(
        labels.iter().map(|s| s.to_string()).collect(),
    ))
}

fn jobs(ec: &EvalConfig) -> QueryValue {
    QueryValue::InstantVector(vec![
        series(ec, "a", &[("job", "x"), ("i", "1")], &[1.0, 2.0, NAN, 4.0]),
        series(ec, "a", &[("job", "x"), ("i", "2")], &[3.0, NAN, NAN, 1.0]),
        series(ec, "a", &[("job", "y"), ("i", "3")], &[5.0, 5.0, 5.0, 5.0]),
    ])
}

/// Three series whose per-point ranking changes at every point.
fn ranked(ec: &EvalConfig) -> QueryValue {
    QueryValue::InstantVector(vec![
        series(ec, "m", &[("s", "1")], &[1.0, 5.0, NAN, 2.0]),
        series(ec, "m", &[("s", "2")], &[3.0, 4.0, 1.0, NAN]),
        series(ec, "m", &[("s", "3")], &[2.0, 6.0, 0.0, 1.0]),
    ])
}

fn constant_series(ec: &EvalConfig, values: &[f64]) -> QueryValue {
    let tss = values
        .iter()
        .enumerate()
        .map(|(i, v)| series(ec, "c", &[("i", i.to_string().as_str())], &[*v; 4]))
        .collect();
    QueryValue::InstantVector(tss)
}

#[test]
fn sum_by_label() {
    let ec = eval_config();
    let result = aggregate(&ec, AggregateFunction::Sum, vec![jobs(&ec)], by(&["job"]), 0).unwrap();
    assert_eq!(result.len(), 2);
    assert_eq!(result[0].metric_name, name("", &[("job", "x")]));
    compare_values(&result[0].values, &[4.0, 2.0, NAN, 5.0]);
    assert_eq!(result[1].metric_name, name("", &[("job", "y")]));
    compare_values(&result[1].values, &[5.0, 5.0, 5.0, 5.0]);
}

#[test]
fn without_resets_metric_group() {
    let ec = eval_config();
    let modifier = Some(AggregateModifier::Without(vec!["i".to_string()]));
    let result = aggregate(&ec, AggregateFunction::Max, vec![jobs(&ec)], modifier, 0).unwrap();
    assert_eq!(result.len(), 2);
    assert_eq!(result[0].metric_name, name("", &[("job", "x")]));
    compare_values(&result[0].values, &[3.0, 2.0, NAN, 4.0]);
}

#[test]
fn limit_drops_extra_groups() {
    let ec = eval_config();
    let result = aggregate(&ec, AggregateFunction::Sum, vec![jobs(&ec)], by(&["i"]), 2).unwrap();
    assert_eq!(result.len(), 2);
}

#[test]
fn all_nan_series_are_ignored() {
    let ec = eval_config();
    let arg = QueryValue::InstantVector(vec![
        series(&ec, "a", &[], &[NAN; 4]),
        series(&ec, "a", &[("i", "1")], &[1.0, NAN, 2.0, 3.0]),
    ]);
    let result = aggregate(&ec, AggregateFunction::Count, vec![arg], None, 0).unwrap();
    assert_eq!(result.len(), 1);
    compare_values(&result[0].values, &[1.0, NAN, 1.0, 1.0]);
}

#[test]
fn count_and_group() {
    let ec = eval_config();
    let result = aggregate(&ec, AggregateFunction::Count, vec![jobs(&ec)], by(&["job"]), 0).unwrap();
    compare_values(&result[0].values, &[2.0, 1.0, NAN, 2.0]);
    compare_values(&result[1].values, &[1.0, 1.0, 1.0, 1.0]);

    let result = aggregate(&ec, AggregateFunction::Group, vec![jobs(&ec)], by(&["job"]), 0).unwrap();
    compare_values(&result[0].values, &[1.0, 1.0, NAN, 1.0]);
}

#[test]
fn avg_and_geomean() {
    let ec = eval_config();
    let arg = constant_series(&ec, &[1.0, 2.0, 4.0]);
    let result = aggregate(&ec, AggregateFunction::Avg, vec![arg.clone()], None, 0).unwrap();
    compare_values(&result[0].values, &[7.0 / 3.0; 4]);

    let result = aggregate(&ec, AggregateFunction::GeoMean, vec![arg], None, 0).unwrap();
    compare_values(&result[0].values, &[2.0; 4]);
}

#[test]
fn stddev_of_single_series_is_zero() {
    let ec = eval_config();
    let arg = QueryValue::InstantVector(vec![series(&ec, "a", &[], &[1.0, NAN, 3.0, 4.0])]);
    let result = aggregate(&ec, AggregateFunction::StdDev, vec![arg], None, 0).unwrap();
    compare_values(&result[0].values, &[0.0, NAN, 0.0, 0.0]);
}

#[test]
fn stddev_and_stdvar() {
    let ec = eval_config();
    let arg = constant_series(&ec, &[1.0, 3.0]);
    let result = aggregate(&ec, AggregateFunction::StdVar, vec![arg.clone()], None, 0).unwrap();
    compare_values(&result[0].values, &[1.0; 4]);
    let arg = constant_series(&ec, &[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
    let result = aggregate(&ec, AggregateFunction::StdDev, vec![arg], None, 0).unwrap();
    compare_values(&result[0].values, &[2.0; 4]);
}

#[test]
fn distinct_and_mode() {
    let ec = eval_config();
    let arg = constant_series(&ec, &[1.0, 2.0, 2.0]);
    let result = aggregate(&ec, AggregateFunction::Distinct, vec![arg.clone()], None, 0).unwrap();
    compare_values(&result[0].values, &[2.0; 4]);
    let result = aggregate(&ec, AggregateFunction::Mode, vec![arg], None, 0).unwrap();
    compare_values(&result[0].values, &[2.0; 4]);
}

#[test]
fn topk_keeps_largest_per_point() {
    let ec = eval_config();
    let args = vec![QueryValue::Scalar(1.0), ranked(&ec)];
    let result = aggregate(&ec, AggregateFunction::Topk, args, None, 0).unwrap();
    assert_eq!(result.len(), 3);
    assert_eq!(result[0].metric_name, name("m", &[("s", "1")]));
    compare_values(&result[0].values, &[NAN, NAN, NAN, 2.0]);
    compare_values(&result[1].values, &[3.0, NAN, 1.0, NAN]);
    compare_values(&result[2].values, &[NAN, 6.0, NAN, NAN]);
}

#[test]
fn bottomk_keeps_smallest_per_point() {
    let ec = eval_config();
    let args = vec![QueryValue::Scalar(1.0), ranked(&ec)];
    let result = aggregate(&ec, AggregateFunction::Bottomk, args, None, 0).unwrap();
    assert_eq!(result.len(), 3);
    compare_values(&result[0].values, &[1.0, NAN, NAN, NAN]);
    compare_values(&result[1].values, &[NAN, 4.0, NAN, NAN]);
    compare_values(&result[2].values, &[NAN, NAN, 0.0, 1.0]);
}

#[test]
fn topk_with_large_k_returns_everything() {
    let ec = eval_config();
    let args = vec![QueryValue::Scalar(10.0), ranked(&ec)];
    let result = aggregate(&ec, AggregateFunction::Topk, args, None, 0).unwrap();
    assert_eq!(result.len(), 3);
    compare_values(&result[2].values, &[2.0, 6.0, 0.0, 1.0]);

    let args = vec![QueryValue::Scalar(NAN), ranked(&ec)];
    let result = aggregate(&ec, AggregateFunction::Topk, args, None, 0).unwrap();
    assert!(result.is_empty());
}

#[test]
fn topk_max_with_remaining_sum() {
    let ec = eval_config();
    let args = vec![
        QueryValue::Scalar(1.0),
        ranked(&ec),
        QueryValue::String("rest=other".to_string()),
    ];
    let result = aggregate(&ec, AggregateFunction::TopkMax, args, None, 0).unwrap();
    assert_eq!(result.len(), 2);
    assert_eq!(result[0].metric_name, name("", &[("rest", "other")]));
    compare_values(&result[0].values, &[4.0, 9.0, 1.0, 2.0]);
    assert_eq!(result[1].metric_name, name("m", &[("s", "3")]));
    compare_values(&result[1].values, &[2.0, 6.0, 0.0, 1.0]);
}

#[test]
fn bottomk_last() {
    let ec = eval_config();
    let args = vec![QueryValue::Scalar(1.0), ranked(&ec)];
    let result = aggregate(&ec, AggregateFunction::BottomkLast, args, None, 0).unwrap();
    // last non-NaN values are 2, 1 and 1; the tie goes to the smaller identity
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].metric_name.get_tag_value("s"), Some("2"));

    let args = vec![QueryValue::Scalar(1.0), ranked(&ec)];
    let result = aggregate(&ec, AggregateFunction::TopkLast, args, None, 0).unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].metric_name.get_tag_value("s"), Some("1"));
}

#[test]
fn topk_and_bottomk_split_ties() {
    let ec = eval_config();
    let tied = || {
        QueryValue::InstantVector(vec![
            series(&ec, "m", &[("s", "1")], &[5.0; 4]),
            series(&ec, "m", &[("s", "2")], &[5.0; 4]),
        ])
    };

    let args = vec![QueryValue::Scalar(1.0), tied()];
    let top = aggregate(&ec, AggregateFunction::Topk, args, None, 0).unwrap();
    let args = vec![QueryValue::Scalar(1.0), tied()];
    let bottom = aggregate(&ec, AggregateFunction::Bottomk, args, None, 0).unwrap();

    assert_eq!(top.len(), 1);
    assert_eq!(bottom.len(), 1);
    assert_eq!(top[0].metric_name, name("m", &[("s", "2")]));
    assert_eq!(bottom[0].metric_name, name("m", &[("s", "1")]));
    compare_values(&top[0].values, &[5.0; 4]);
    compare_values(&bottom[0].values, &[5.0; 4]);

    let args = vec![QueryValue::Scalar(1.0), tied()];
    let top = aggregate(&ec, AggregateFunction::TopkAvg, args, None, 0).unwrap();
    let args = vec![QueryValue::Scalar(1.0), tied()];
    let bottom = aggregate(&ec, AggregateFunction::BottomkAvg, args, None, 0).unwrap();
    assert_ne!(top[0].metric_name, bottom[0].metric_name);
}

#[test]
fn quantile_and_median() {
    let ec = eval_config();
    let args = vec![QueryValue::Scalar(0.5), ranked(&ec)];
    let result = aggregate(&ec, AggregateFunction::Quantile, args, None, 0).unwrap();
    assert_eq!(result.len(), 1);
    compare_values(&result[0].values, &[2.0, 5.0, 0.5, 1.5]);

    let result = aggregate(&ec, AggregateFunction::Median, vec![ranked(&ec)], None, 0).unwrap();
    compare_values(&result[0].values, &[2.0, 5.0, 0.5, 1.5]);
}

#[test]
fn quantiles_adds_label_per_phi() {
    let ec = eval_config();
    let args = vec![
        QueryValue::String("phi".to_string()),
        QueryValue::Scalar(0.1),
        QueryValue::Scalar(0.9),
        ranked(&ec),
    ];
    let result = aggregate(&ec, AggregateFunction::Quantiles, args, None, 0).unwrap();
    assert_eq!(result.len(), 2);
    assert_eq!(result[0].metric_name, name("", &[("phi", "0.1")]));
    compare_values(&result[0].values, &[1.2, 4.2, 0.1, 1.1]);
    assert_eq!(result[1].metric_name, name("", &[("phi", "0.9")]));
    compare_values(&result[1].values, &[2.8, 5.8, 0.9, 1.9]);
}

#[test]
fn count_values_groups_by_value() {
    let ec = eval_config();
    let arg = QueryValue::InstantVector(vec![
        series(&ec, "a", &[("i", "1")], &[1.0, 1.0, 2.0, NAN]),
        series(&ec, "a", &[("i", "2")], &[2.0, 1.0, NAN, NAN]),
    ]);
    let args = vec![QueryValue::String("val".to_string()), arg];
    // the destination label is removed from `by`
    let result = aggregate(&ec, AggregateFunction::CountValues, args, by(&["val"]), 0).unwrap();
    assert_eq!(result.len(), 2);
    assert_eq!(result[0].metric_name, name("", &[("val", "1")]));
    compare_values(&result[0].values, &[1.0, 2.0, NAN, NAN]);
    assert_eq!(result[1].metric_name, name("", &[("val", "2")]));
    compare_values(&result[1].values, &[1.0, NAN, 1.0, NAN]);
}

#[test]
fn count_values_uses_exponent_notation_for_extreme_values() {
    let ec = eval_config();
    let arg = QueryValue::InstantVector(vec![
        series(&ec, "a", &[("i", "1")], &[1e21, 1e21, NAN, NAN]),
        series(&ec, "a", &[("i", "2")], &[NAN, 1.5e-7, 1.5e-7, 42.0]),
    ]);
    let args = vec![QueryValue::String("val".to_string()), arg];
    let result = aggregate(&ec, AggregateFunction::CountValues, args, None, 0).unwrap();
    let mut tags: Vec<&str> = result
        .iter()
        .filter_map(|ts| ts.metric_name.get_tag_value("val"))
        .collect();
    tags.sort();
    assert_eq!(tags, vec!["1.5e-07", "1e+21", "42"]);
}

#[test]
fn count_values_explosion_is_rejected() {
    let ec = EvalConfig::new(0, 2_999_000, 1000);
    let timestamps = ec.get_timestamps().unwrap();
    let values: Vec<f64> = (0..timestamps.len()).map(|i| i as f64).collect();
    let ts = Timeseries::with_shared_timestamps(&timestamps, &values);
    let args = vec![
        QueryValue::String("val".to_string()),
        QueryValue::InstantVector(vec![ts]),
    ];
    let err = aggregate(&ec, AggregateFunction::CountValues, args, None, 0).unwrap_err();
    assert!(matches!(err, RuntimeError::TooManyTimeseries(_)), "{err:?}");
}

#[test]
fn limitk_is_stable() {
    let ec = eval_config();
    let run = || {
        let args = vec![QueryValue::Scalar(2.0), ranked(&ec)];
        aggregate(&ec, AggregateFunction::Limitk, args, None, 0).unwrap()
    };
    let first = run();
    assert_eq!(first.len(), 2);
    let second = run();
    let names = |tss: &[Timeseries]| tss.iter().map(|ts| ts.metric_name.to_string()).collect::<Vec<_>>();
    assert_eq!(names(&first), names(&second));
}

#[test]
fn share_of_non_negative_values() {
    let ec = eval_config();
    let arg = QueryValue::InstantVector(vec![
        series(&ec, "a", &[("i", "1")], &[1.0, 3.0, NAN, -1.0]),
        series(&ec, "a", &[("i", "2")], &[3.0, 1.0, 2.0, 4.0]),
    ]);
    let result = aggregate(&ec, AggregateFunction::Share, vec![arg], None, 0).unwrap();
    assert_eq!(result.len(), 2);
    assert_eq!(result[0].metric_name, name("a", &[("i", "1")]));
    compare_values(&result[0].values, &[0.25, 0.75, NAN, NAN]);
    compare_values(&result[1].values, &[0.75, 0.25, 1.0, 1.0]);
}

#[test]
fn zscore_per_point() {
    let ec = eval_config();
    let arg = constant_series(&ec, &[1.0, 3.0]);
    let result = aggregate(&ec, AggregateFunction::ZScore, vec![arg], None, 0).unwrap();
    compare_values(&result[0].values, &[-1.0; 4]);
    compare_values(&result[1].values, &[1.0; 4]);
}

#[test]
fn mad_and_outliers() {
    let ec = eval_config();
    let arg = constant_series(&ec, &[1.0, 2.0, 4.0]);
    let result = aggregate(&ec, AggregateFunction::MAD, vec![arg], None, 0).unwrap();
    compare_values(&result[0].values, &[1.0; 4]);

    let arg = QueryValue::InstantVector(vec![
        series(&ec, "a", &[("i", "1")], &[1.0, 1.0, 1.0, 1.0]),
        series(&ec, "a", &[("i", "2")], &[1.0, 1.0, 1.0, 1.0]),
        series(&ec, "a", &[("i", "3")], &[10.0, 1.0, 1.0, 1.0]),
    ]);
    let args = vec![QueryValue::Scalar(0.5), arg];
    let result = aggregate(&ec, AggregateFunction::OutliersMAD, args, None, 0).unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].metric_name, name("a", &[("i", "3")]));
}

#[test]
fn any_returns_one_series_per_group() {
    let ec = eval_config();
    let result = aggregate(&ec, AggregateFunction::Any, vec![jobs(&ec)], by(&["job"]), 0).unwrap();
    assert_eq!(result.len(), 2);
    assert_eq!(result[0].metric_name.get_tag_value("job"), Some("x"));
    assert_eq!(result[1].metric_name.get_tag_value("job"), Some("y"));
}

#[test]
fn wrong_arg_count() {
    let ec = eval_config();
    let err = aggregate(&ec, AggregateFunction::Topk, vec![ranked(&ec)], None, 0).unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidArgCount(_)));
    let err = aggregate(&ec, AggregateFunction::Sum, vec![], None, 0).unwrap_err();
    assert!(matches!(err, RuntimeError::ArgumentError(_)));
}
