use super::RollupFuncArg;

/// Replaces every value with the difference to the next one. The last value repeats the
/// preceding difference.
pub(crate) fn delta_values(values: &mut [f64]) {
    let n = values.len();
    if n == 0 {
        return;
    }
    let mut delta = 0.0;
    for i in 0..n - 1 {
        delta = values[i + 1] - values[i];
        values[i] = delta;
    }
    values[n - 1] = delta;
}

/// Serves `delta` and `increase`.
///
/// Without a sample before the window the base is guessed: the value seen before a gap when
/// there is one, otherwise zero for series that look freshly started and the first sample for
/// series whose first value dwarfs their rate of change.
pub(super) fn rollup_delta(rfa: &RollupFuncArg) -> f64 {
    let mut values = rfa.values;
    let base = if !rfa.prev_value.is_nan() {
        rfa.prev_value
    } else {
        let Some((&first, rest)) = values.split_first() else {
            return f64::NAN;
        };
        if !rfa.real_prev_value.is_nan() {
            return values[values.len() - 1] - rfa.real_prev_value;
        }
        let d = match rest.first() {
            Some(next) => next - first,
            None if !rfa.real_next_value.is_nan() => rfa.real_next_value - first,
            None => 0.0,
        };
        if first.abs() < 10.0 * (d.abs() + 1.0) {
            0.0
        } else {
            values = rest;
            first
        }
    };
    values.last().map_or(0.0, |last| last - base)
}

/// Like `increase`, but a counter without history always starts from zero.
pub(super) fn rollup_increase_pure(rfa: &RollupFuncArg) -> f64 {
    let values = rfa.values;
    let base = match (rfa.prev_value.is_nan(), rfa.real_prev_value.is_nan()) {
        (false, _) => rfa.prev_value,
        (true, _) if values.is_empty() => return f64::NAN,
        (true, true) => 0.0,
        (true, false) => rfa.real_prev_value,
    };
    values.last().map_or(0.0, |last| last - base)
}

/// Serves `delta_prometheus` and `increase_prometheus`: last minus first sample in the window.
pub(super) fn rollup_delta_prometheus(rfa: &RollupFuncArg) -> f64 {
    match rfa.values {
        [first, .., last] => last - first,
        _ => f64::NAN,
    }
}

pub(super) fn rollup_idelta(rfa: &RollupFuncArg) -> f64 {
    match (rfa.values, rfa.prev_value.is_nan()) {
        ([], true) => f64::NAN,
        ([], false) => 0.0,
        ([.., prev, last], _) => last - prev,
        ([last], true) => *last,
        ([last], false) => last - rfa.prev_value,
    }
}
