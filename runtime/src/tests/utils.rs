use crate::types::{MetricName, Timeseries};

/// Relative tolerance for float comparisons. Results may differ in the last bits depending on
/// summation order and platform.
pub const EPSILON: f64 = 1e-13;

pub fn test_rows_equal(
    values: &[f64],
    timestamps: &[i64],
    values_expected: &[f64],
    timestamps_expected: &[i64],
) {
    assert_eq!(
        timestamps, timestamps_expected,
        "unexpected timestamps\ntimestamps=\n{timestamps:?}\ntimestamps_expected=\n{timestamps_expected:?}"
    );
    assert_eq!(
        values.len(),
        timestamps.len(),
        "values.len() doesn't match timestamps.len(); got {} vs {}",
        values.len(),
        timestamps.len()
    );
    compare_values(values, values_expected);
}

pub fn compare_values(actual: &[f64], expected: &[f64]) {
    assert_eq!(
        actual.len(),
        expected.len(),
        "unexpected number of values; got {}; want {}\nvalues=\n{actual:?}\nvalues_expected=\n{expected:?}",
        actual.len(),
        expected.len()
    );
    for (i, (got, wanted)) in actual.iter().zip(expected.iter()).enumerate() {
        assert!(
            compare_floats(*wanted, *got),
            "unexpected value at values[{i}]; got {got}; want {wanted}\nvalues=\n{actual:?}\nvalues_expected=\n{expected:?}"
        );
    }
}

/// NaN-aware float equality with a relative tolerance.
pub fn compare_floats(expected: f64, actual: f64) -> bool {
    if expected.is_nan() || actual.is_nan() {
        return expected.is_nan() && actual.is_nan();
    }
    if expected.is_infinite() || actual.is_infinite() {
        return expected == actual;
    }
    if expected == actual {
        return true;
    }
    let diff = (actual - expected).abs();
    if expected == 0.0 {
        return diff <= EPSILON;
    }
    diff / expected.abs() <= EPSILON
}

pub fn test_metric_names_equal(mn: &MetricName, expected: &MetricName, pos: usize) {
    assert_eq!(
        mn, expected,
        "unexpected metric name at #{pos}; got {mn}; want {expected}"
    );
}

pub fn test_timeseries_equal(tss: &[Timeseries], tss_expected: &[Timeseries]) {
    assert_eq!(
        tss.len(),
        tss_expected.len(),
        "unexpected timeseries count; got {}; want {}",
        tss.len(),
        tss_expected.len()
    );

    for (i, (ts, ts_expected)) in tss.iter().zip(tss_expected.iter()).enumerate() {
        test_metric_names_equal(&ts.metric_name, &ts_expected.metric_name, i);
        test_rows_equal(
            &ts.values,
            &ts.timestamps,
            &ts_expected.values,
            &ts_expected.timestamps,
        )
    }
}
