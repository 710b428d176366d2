use pretty_assertions::assert_eq;
use test_case::test_case;

use vmquery_ast::functions::TransformFunction;

use crate::execution::EvalConfig;
use crate::functions::transform::{get_transform_func, TransformFuncArg};
use crate::runtime_error::{RuntimeError, RuntimeResult};
use crate::tests::utils::compare_values;
use crate::types::{QueryValue, Timeseries};

const NAN: f64 = f64::NAN;

fn eval_config() -> EvalConfig {
    EvalConfig::new(1000, 4000, 1000)
}

fn named_series(ec: &EvalConfig, name: &str, job: &str, values: &[f64]) -> Timeseries {
    let timestamps = ec.get_timestamps().unwrap();
    let mut ts = Timeseries::with_shared_timestamps(&timestamps, values);
    ts.metric_name.set_metric_group(name);
    ts.metric_name.set_tag("job", job);
    ts
}

fn run(
    ec: &EvalConfig,
    func: TransformFunction,
    args: Vec<QueryValue>,
    keep_metric_names: bool,
) -> RuntimeResult<Vec<Timeseries>> {
    let mut tfa = TransformFuncArg::new(ec, args, keep_metric_names);
    get_transform_func(func)(&mut tfa)
}

#[test_case(TransformFunction::Abs, &[-1.5, 0.0, -2.0, NAN], &[1.5, 0.0, 2.0, NAN])]
#[test_case(TransformFunction::Ceil, &[-1.5, 0.0, 2.0, NAN], &[-1.0, 0.0, 2.0, NAN])]
#[test_case(TransformFunction::Floor, &[-1.5, 0.0, 2.0, NAN], &[-2.0, 0.0, 2.0, NAN])]
#[test_case(TransformFunction::Sqrt, &[4.0, 0.0, 2.25, -1.0], &[2.0, 0.0, 1.5, NAN])]
#[test_case(TransformFunction::Exp, &[0.0, 1.0, NAN, 0.0], &[1.0, std::f64::consts::E, NAN, 1.0])]
#[test_case(TransformFunction::Ln, &[1.0, std::f64::consts::E, 0.0, NAN], &[0.0, 1.0, f64::NEG_INFINITY, NAN])]
fn math_functions(func: TransformFunction, values: &[f64], expected: &[f64]) {
    let ec = eval_config();
    let arg = QueryValue::InstantVector(vec![named_series(&ec, "foo", "a", values)]);
    let result = run(&ec, func, vec![arg], false).unwrap();
    assert_eq!(result.len(), 1);
    compare_values(&result[0].values, expected);
}

#[test]
fn math_functions_drop_the_metric_name() {
    let ec = eval_config();
    let arg = QueryValue::InstantVector(vec![named_series(&ec, "foo", "a", &[1.0; 4])]);
    let result = run(&ec, TransformFunction::Abs, vec![arg], false).unwrap();
    assert_eq!(result[0].metric_name.metric_group, "");
    assert_eq!(result[0].metric_name.get_tag_value("job"), Some("a"));

    let arg = QueryValue::InstantVector(vec![named_series(&ec, "foo", "a", &[1.0; 4])]);
    let result = run(&ec, TransformFunction::Abs, vec![arg], true).unwrap();
    assert_eq!(result[0].metric_name.metric_group, "foo");
}

#[test]
fn math_on_scalar_arg_broadcasts() {
    let ec = eval_config();
    let result = run(&ec, TransformFunction::Abs, vec![QueryValue::Scalar(-3.0)], false).unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].values, vec![3.0; 4]);
    assert_eq!(*result[0].timestamps, vec![1000, 2000, 3000, 4000]);
}

#[test]
fn round_to_nearest() {
    let ec = eval_config();
    let arg = QueryValue::InstantVector(vec![named_series(&ec, "foo", "a", &[2.4, 2.5, -2.5, NAN])]);
    let result = run(&ec, TransformFunction::Round, vec![arg], false).unwrap();
    compare_values(&result[0].values, &[2.0, 3.0, -2.0, NAN]);

    let arg = QueryValue::InstantVector(vec![named_series(&ec, "foo", "a", &[1.26, 1.24, 0.1, 7.0])]);
    let result = run(
        &ec,
        TransformFunction::Round,
        vec![arg, QueryValue::Scalar(0.5)],
        false,
    )
    .unwrap();
    compare_values(&result[0].values, &[1.5, 1.0, 0.0, 7.0]);
}

#[test]
fn clamp_keeps_nans() {
    let ec = eval_config();
    let values = [-5.0, 0.5, 10.0, NAN];

    let arg = QueryValue::InstantVector(vec![named_series(&ec, "foo", "a", &values)]);
    let result = run(
        &ec,
        TransformFunction::ClampMin,
        vec![arg, QueryValue::Scalar(0.0)],
        false,
    )
    .unwrap();
    compare_values(&result[0].values, &[0.0, 0.5, 10.0, NAN]);

    let arg = QueryValue::InstantVector(vec![named_series(&ec, "foo", "a", &values)]);
    let result = run(
        &ec,
        TransformFunction::ClampMax,
        vec![arg, QueryValue::Scalar(1.0)],
        false,
    )
    .unwrap();
    compare_values(&result[0].values, &[-5.0, 0.5, 1.0, NAN]);
}

#[test]
fn time_functions() {
    let ec = eval_config();
    let result = run(&ec, TransformFunction::Time, vec![], false).unwrap();
    assert_eq!(result[0].values, vec![1.0, 2.0, 3.0, 4.0]);

    let result = run(&ec, TransformFunction::Start, vec![], false).unwrap();
    assert_eq!(result[0].values, vec![1.0; 4]);
    let result = run(&ec, TransformFunction::End, vec![], false).unwrap();
    assert_eq!(result[0].values, vec![4.0; 4]);
    let result = run(&ec, TransformFunction::Step, vec![], false).unwrap();
    assert_eq!(result[0].values, vec![1.0; 4]);
}

#[test]
fn scalar_conversions() {
    let ec = eval_config();

    let one = QueryValue::InstantVector(vec![named_series(&ec, "foo", "a", &[1.0, 2.0, 3.0, 4.0])]);
    let result = run(&ec, TransformFunction::Scalar, vec![one], false).unwrap();
    assert!(result[0].metric_name.is_empty());
    assert_eq!(result[0].values, vec![1.0, 2.0, 3.0, 4.0]);

    let two = QueryValue::InstantVector(vec![
        named_series(&ec, "foo", "a", &[1.0; 4]),
        named_series(&ec, "foo", "b", &[2.0; 4]),
    ]);
    let result = run(&ec, TransformFunction::Scalar, vec![two], false).unwrap();
    assert_eq!(result.len(), 1);
    assert!(result[0].is_all_nans());

    let s = QueryValue::String("12.5".to_string());
    let result = run(&ec, TransformFunction::Scalar, vec![s], false).unwrap();
    assert_eq!(result[0].values, vec![12.5; 4]);

    let s = QueryValue::String("foo".to_string());
    let result = run(&ec, TransformFunction::Scalar, vec![s], false).unwrap();
    assert!(result[0].is_all_nans());
}

#[test]
fn union_keeps_first_series_per_name() {
    let ec = eval_config();
    let left = QueryValue::InstantVector(vec![
        named_series(&ec, "foo", "a", &[1.0; 4]),
        named_series(&ec, "foo", "b", &[2.0; 4]),
    ]);
    let right = QueryValue::InstantVector(vec![
        named_series(&ec, "foo", "b", &[20.0; 4]),
        named_series(&ec, "foo", "c", &[30.0; 4]),
    ]);
    let result = run(&ec, TransformFunction::Union, vec![left, right], false).unwrap();
    let values: Vec<f64> = result.iter().map(|ts| ts.values[0]).collect();
    assert_eq!(values, vec![1.0, 2.0, 30.0]);
}

#[test]
fn union_of_scalars_returns_all() {
    let ec = eval_config();
    let args = vec![QueryValue::Scalar(1.0), QueryValue::Scalar(2.0)];
    let result = run(&ec, TransformFunction::Union, args, false).unwrap();
    assert_eq!(result.len(), 2);
    assert_eq!(result[1].values, vec![2.0; 4]);
}

#[test]
fn vector_keeps_names() {
    let ec = eval_config();
    let arg = QueryValue::InstantVector(vec![named_series(&ec, "foo", "a", &[1.0; 4])]);
    let result = run(&ec, TransformFunction::Vector, vec![arg], false).unwrap();
    assert_eq!(result[0].metric_name.metric_group, "foo");
}

#[test]
fn wrong_arg_count() {
    let ec = eval_config();
    let err = run(&ec, TransformFunction::ClampMin, vec![QueryValue::Scalar(1.0)], false)
        .unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidArgCount(_)));

    let err = run(&ec, TransformFunction::Time, vec![QueryValue::Scalar(1.0)], false).unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidArgCount(_)));
}
