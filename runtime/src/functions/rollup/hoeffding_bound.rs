use crate::functions::rollup::RollupFuncArg;

pub(super) fn rollup_hoeffding_bound_lower(rfa: &RollupFuncArg, phi: f64) -> f64 {
    let (bound, avg) = hoeffding_bound_internal(rfa.values, phi);
    avg - bound
}

pub(super) fn rollup_hoeffding_bound_upper(rfa: &RollupFuncArg, phi: f64) -> f64 {
    let (bound, avg) = hoeffding_bound_internal(rfa.values, phi);
    avg + bound
}

/// Returns the bound and the average of values.
fn hoeffding_bound_internal(values: &[f64], phi: f64) -> (f64, f64) {
    if values.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    if values.len() == 1 {
        return (0.0, values[0]);
    }

    let mut v_min = values[0];
    let mut v_max = v_min;
    let mut v_sum = 0.0;
    for v in values {
        v_min = v_min.min(*v);
        v_max = v_max.max(*v);
        v_sum += *v;
    }
    let v_avg = v_sum / values.len() as f64;
    let v_range = v_max - v_min;

    if v_range <= 0.0 || phi <= 0.0 {
        return (0.0, v_avg);
    }
    if phi >= 1.0 {
        return (f64::INFINITY, v_avg);
    }
    // See https://en.wikipedia.org/wiki/Hoeffding%27s_inequality
    let bound = v_range * ((1.0 / (1.0 - phi)).ln() / (2 * values.len()) as f64).sqrt();
    (bound, v_avg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_surround_the_average() {
        let values = [1.0, 3.0, 5.0, 7.0];
        let rfa = RollupFuncArg {
            values: &values,
            ..Default::default()
        };
        let lower = rollup_hoeffding_bound_lower(&rfa, 0.9);
        let upper = rollup_hoeffding_bound_upper(&rfa, 0.9);
        let expected = 6.0 * (10.0_f64.ln() / 8.0).sqrt();
        assert!((upper - 4.0 - expected).abs() < 1e-9);
        assert!((4.0 - lower - expected).abs() < 1e-9);
    }

    #[test]
    fn degenerate_inputs() {
        assert_eq!(hoeffding_bound_internal(&[2.0], 0.5), (0.0, 2.0));
        assert_eq!(hoeffding_bound_internal(&[2.0, 2.0], 0.5), (0.0, 2.0));
        assert_eq!(hoeffding_bound_internal(&[1.0, 3.0], 1.0), (f64::INFINITY, 2.0));
        assert_eq!(hoeffding_bound_internal(&[1.0, 3.0], 0.0), (0.0, 2.0));
    }
}
