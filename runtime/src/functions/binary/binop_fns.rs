use vmquery_ast::operator::Operator;

pub type BinopFunc = fn(left: f64, right: f64) -> f64;

/// eq returns true if left == right.
#[inline]
fn op_eq(left: f64, right: f64) -> bool {
    // Special handling for nan == nan.
    if left.is_nan() {
        return right.is_nan();
    }
    left == right
}

/// neq returns true if left != right.
#[inline]
fn op_neq(left: f64, right: f64) -> bool {
    // Special handling for comparison with nan.
    if left.is_nan() {
        return !right.is_nan();
    }
    if right.is_nan() {
        return true;
    }
    left != right
}

#[inline]
fn op_gt(left: f64, right: f64) -> bool {
    left > right
}

#[inline]
fn op_lt(left: f64, right: f64) -> bool {
    left < right
}

#[inline]
fn op_gte(left: f64, right: f64) -> bool {
    left >= right
}

#[inline]
fn op_lte(left: f64, right: f64) -> bool {
    left <= right
}

#[inline]
fn op_plus(left: f64, right: f64) -> f64 {
    left + right
}

#[inline]
fn op_minus(left: f64, right: f64) -> f64 {
    left - right
}

#[inline]
fn op_mul(left: f64, right: f64) -> f64 {
    left * right
}

#[inline]
fn op_div(left: f64, right: f64) -> f64 {
    left / right
}

#[inline]
fn op_mod(left: f64, right: f64) -> f64 {
    left % right
}

#[inline]
fn op_pow(left: f64, right: f64) -> f64 {
    left.powf(right)
}

#[inline]
fn op_atan2(left: f64, right: f64) -> f64 {
    left.atan2(right)
}

/// returns left or right if left is NaN.
#[inline]
fn op_default(left: f64, right: f64) -> f64 {
    if left.is_nan() {
        return right;
    }
    left
}

/// returns left if right is not NaN. Otherwise, NaN is returned.
#[inline]
fn op_if(left: f64, right: f64) -> f64 {
    if right.is_nan() {
        return f64::NAN;
    }
    left
}

/// returns left if right is NaN. Otherwise, NaN is returned.
#[inline]
fn op_if_not(left: f64, right: f64) -> f64 {
    if right.is_nan() {
        return left;
    }
    f64::NAN
}

fn op_and(left: f64, right: f64) -> f64 {
    if left.is_nan() || right.is_nan() {
        f64::NAN
    } else {
        left
    }
}

/// returns the first non-NaN operand.
fn op_or(left: f64, right: f64) -> f64 {
    if !left.is_nan() {
        return left;
    }
    right
}

fn op_unless(left: f64, right: f64) -> f64 {
    if right.is_nan() {
        return left;
    }
    f64::NAN
}

/// convert true to x, false to NaN.
#[inline]
const fn to_comparison_value(b: bool, x: f64) -> f64 {
    if b {
        x
    } else {
        f64::NAN
    }
}

macro_rules! make_comparison_func {
    ($name: ident, $func: expr) => {
        fn $name(left: f64, right: f64) -> f64 {
            to_comparison_value($func(left, right), left)
        }
    };
}

macro_rules! make_comparison_func_bool {
    ($name: ident, $func: expr) => {
        fn $name(left: f64, right: f64) -> f64 {
            if left.is_nan() {
                return f64::NAN;
            }
            if $func(left, right) {
                1_f64
            } else {
                0_f64
            }
        }
    };
}

make_comparison_func!(compare_eq, op_eq);
make_comparison_func!(compare_neq, op_neq);
make_comparison_func!(compare_gt, op_gt);
make_comparison_func!(compare_lt, op_lt);
make_comparison_func!(compare_gte, op_gte);
make_comparison_func!(compare_lte, op_lte);

make_comparison_func_bool!(compare_eq_bool, op_eq);
make_comparison_func_bool!(compare_neq_bool, op_neq);
make_comparison_func_bool!(compare_gt_bool, op_gt);
make_comparison_func_bool!(compare_lt_bool, op_lt);
make_comparison_func_bool!(compare_gte_bool, op_gte);
make_comparison_func_bool!(compare_lte_bool, op_lte);

const fn get_scalar_comparison_handler(op: Operator, is_bool: bool) -> BinopFunc {
    if is_bool {
        match op {
            Operator::Eql => compare_eq_bool,
            Operator::NotEq => compare_neq_bool,
            Operator::Gt => compare_gt_bool,
            Operator::Lt => compare_lt_bool,
            Operator::Gte => compare_gte_bool,
            _ => compare_lte_bool,
        }
    } else {
        match op {
            Operator::Eql => compare_eq,
            Operator::NotEq => compare_neq,
            Operator::Gt => compare_gt,
            Operator::Lt => compare_lt,
            Operator::Gte => compare_gte,
            _ => compare_lte,
        }
    }
}

/// Returns the pointwise function for `op`. `is_bool` selects the 0/1 form of comparisons.
pub const fn get_scalar_binop_handler(op: Operator, is_bool: bool) -> BinopFunc {
    match op {
        Operator::Add => op_plus,
        Operator::Atan2 => op_atan2,
        Operator::Default => op_default,
        Operator::Div => op_div,
        Operator::Mod => op_mod,
        Operator::Mul => op_mul,
        Operator::Pow => op_pow,
        Operator::Sub => op_minus,
        Operator::If => op_if,
        Operator::IfNot => op_if_not,
        Operator::Unless => op_unless,
        Operator::And => op_and,
        Operator::Or => op_or,
        Operator::Eql
        | Operator::NotEq
        | Operator::Gt
        | Operator::Lt
        | Operator::Gte
        | Operator::Lte => get_scalar_comparison_handler(op, is_bool),
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(Operator::Add, 2.0, 3.0, 5.0)]
    #[test_case(Operator::Sub, 2.0, 3.0, -1.0)]
    #[test_case(Operator::Mul, 2.0, 3.0, 6.0)]
    #[test_case(Operator::Div, 3.0, 2.0, 1.5)]
    #[test_case(Operator::Mod, 7.0, 4.0, 3.0)]
    #[test_case(Operator::Pow, 2.0, 10.0, 1024.0)]
    #[test_case(Operator::Default, f64::NAN, 4.0, 4.0)]
    #[test_case(Operator::If, 5.0, 1.0, 5.0)]
    fn arithmetic(op: Operator, left: f64, right: f64, expected: f64) {
        assert_eq!(get_scalar_binop_handler(op, false)(left, right), expected);
    }

    #[test_case(Operator::Gt, 3.0, 2.0, 1.0)]
    #[test_case(Operator::Gt, 1.0, 2.0, 0.0)]
    #[test_case(Operator::Eql, 2.0, 2.0, 1.0)]
    #[test_case(Operator::NotEq, 2.0, 2.0, 0.0)]
    #[test_case(Operator::Lte, 2.0, 2.0, 1.0)]
    fn bool_comparisons(op: Operator, left: f64, right: f64, expected: f64) {
        assert_eq!(get_scalar_binop_handler(op, true)(left, right), expected);
    }

    #[test]
    fn filtering_comparison_keeps_left_value() {
        let gt = get_scalar_binop_handler(Operator::Gt, false);
        assert_eq!(gt(3.0, 2.0), 3.0);
        assert!(gt(1.0, 2.0).is_nan());
    }

    #[test]
    fn nan_comparisons() {
        let eq = get_scalar_binop_handler(Operator::Eql, true);
        assert!(eq(f64::NAN, f64::NAN).is_nan());
        let ne = get_scalar_binop_handler(Operator::NotEq, false);
        assert_eq!(ne(1.0, f64::NAN), 1.0);
        assert!(get_scalar_binop_handler(Operator::IfNot, false)(1.0, 2.0).is_nan());
    }
}
