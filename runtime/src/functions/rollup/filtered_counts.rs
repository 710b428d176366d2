//! `count/share/sum_*_over_time` window functions. Each takes the comparison limit as a
//! per-point parameter and returns NaN on an empty window.
use crate::functions::rollup::RollupFuncArg;

macro_rules! count_filter {
    ($name: ident, $pred: expr) => {
        pub(super) fn $name(rfa: &RollupFuncArg, limit: f64) -> f64 {
            if rfa.values.is_empty() {
                return f64::NAN;
            }
            let pred: fn(f64, f64) -> bool = $pred;
            rfa.values.iter().filter(|v| pred(**v, limit)).count() as f64
        }
    };
}

macro_rules! sum_filter {
    ($name: ident, $pred: expr) => {
        pub(super) fn $name(rfa: &RollupFuncArg, limit: f64) -> f64 {
            if rfa.values.is_empty() {
                return f64::NAN;
            }
            let pred: fn(f64, f64) -> bool = $pred;
            rfa.values.iter().filter(|v| pred(**v, limit)).sum()
        }
    };
}

macro_rules! share_filter {
    ($name: ident, $count_fn: ident) => {
        pub(super) fn $name(rfa: &RollupFuncArg, limit: f64) -> f64 {
            $count_fn(rfa, limit) / rfa.values.len() as f64
        }
    };
}

count_filter!(count_eq, |v, limit| v == limit);
count_filter!(count_gt, |v, limit| v > limit);
count_filter!(count_le, |v, limit| v <= limit);
count_filter!(count_ne, |v, limit| v != limit);

sum_filter!(sum_eq, |v, limit| v == limit);
sum_filter!(sum_gt, |v, limit| v > limit);
sum_filter!(sum_le, |v, limit| v <= limit);

share_filter!(share_eq, count_eq);
share_filter!(share_gt, count_gt);
share_filter!(share_le, count_le);

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    const VALUES: [f64; 6] = [1.0, 2.0, 2.0, 3.0, 5.0, 8.0];

    fn rfa() -> RollupFuncArg<'static> {
        RollupFuncArg {
            values: &VALUES,
            ..Default::default()
        }
    }

    #[test_case(count_eq, 2.0, 2.0)]
    #[test_case(count_gt, 2.0, 3.0)]
    #[test_case(count_le, 2.0, 3.0)]
    #[test_case(count_ne, 2.0, 4.0)]
    #[test_case(sum_eq, 2.0, 4.0)]
    #[test_case(sum_gt, 2.0, 16.0)]
    #[test_case(sum_le, 2.0, 5.0)]
    #[test_case(share_eq, 2.0, 2.0 / 6.0)]
    #[test_case(share_gt, 3.0, 2.0 / 6.0)]
    #[test_case(share_le, 8.0, 1.0)]
    fn filters(f: fn(&RollupFuncArg, f64) -> f64, limit: f64, expected: f64) {
        assert_eq!(f(&rfa(), limit), expected);
    }

    #[test]
    fn empty_window_is_nan() {
        let rfa = RollupFuncArg::default();
        assert!(count_gt(&rfa, 0.0).is_nan());
        assert!(sum_le(&rfa, 0.0).is_nan());
        assert!(share_eq(&rfa, 0.0).is_nan());
    }
}
