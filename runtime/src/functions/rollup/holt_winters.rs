use crate::functions::rollup::RollupFuncArg;

/// Double exponential smoothing with smoothing factor `sf` and trend factor `tf`.
///
/// See https://en.wikipedia.org/wiki/Exponential_smoothing#Double_exponential_smoothing
pub(super) fn rollup_holt_winters(rfa: &RollupFuncArg, sf: f64, tf: f64) -> f64 {
    let mut values = rfa.values;
    if values.is_empty() {
        return f64::NAN;
    }
    if !(0.0..=1.0).contains(&sf) || !(0.0..=1.0).contains(&tf) {
        return f64::NAN;
    }

    let mut s0 = rfa.prev_value;
    if s0.is_nan() {
        s0 = values[0];
        values = &values[1..];
        if values.is_empty() {
            return s0;
        }
    }

    let mut b0 = values[0] - s0;
    for v in values {
        let s1 = sf * v + (1.0 - sf) * (s0 + b0);
        let b1 = tf * (s1 - s0) + (1.0 - tf) * b0;
        s0 = s1;
        b0 = b1
    }

    s0
}
