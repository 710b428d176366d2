use crate::functions::rollup::RollupFuncArg;

/// Returns the window values strictly before the current timestamp. The sample at the
/// evaluation timestamp opens the next candle.
///
/// See https://github.com/VictoriaMetrics/VictoriaMetrics/issues/309 for details.
fn get_candlestick_values<'a>(rfa: &RollupFuncArg<'a>) -> &'a [f64] {
    let n = rfa
        .timestamps
        .iter()
        .rposition(|ts| *ts < rfa.curr_timestamp)
        .map_or(0, |i| i + 1);
    &rfa.values[..n]
}

fn get_first_value_for_candlestick(rfa: &RollupFuncArg) -> f64 {
    if rfa.prev_timestamp + rfa.window >= rfa.curr_timestamp {
        return rfa.prev_value;
    }
    f64::NAN
}

pub(super) fn rollup_open(rfa: &RollupFuncArg) -> f64 {
    let v = get_first_value_for_candlestick(rfa);
    if !v.is_nan() {
        return v;
    }
    get_candlestick_values(rfa).first().copied().unwrap_or(f64::NAN)
}

pub(super) fn rollup_close(rfa: &RollupFuncArg) -> f64 {
    match get_candlestick_values(rfa).last() {
        Some(v) => *v,
        None => get_first_value_for_candlestick(rfa),
    }
}

pub(super) fn rollup_high(rfa: &RollupFuncArg) -> f64 {
    fold_candle(rfa, |acc, v| if v > acc { v } else { acc })
}

pub(super) fn rollup_low(rfa: &RollupFuncArg) -> f64 {
    fold_candle(rfa, |acc, v| if v < acc { v } else { acc })
}

fn fold_candle(rfa: &RollupFuncArg, f: fn(f64, f64) -> f64) -> f64 {
    let mut values = get_candlestick_values(rfa);
    let mut acc = get_first_value_for_candlestick(rfa);
    if acc.is_nan() {
        match values.split_first() {
            Some((first, rest)) => {
                acc = *first;
                values = rest;
            }
            None => return f64::NAN,
        }
    }
    values.iter().fold(acc, |acc, v| f(acc, *v))
}
