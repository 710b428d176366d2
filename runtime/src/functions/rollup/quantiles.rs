use crate::common::math::{quantile, quantiles, IQR_PHIS};
use crate::functions::rollup::{QuantilesParams, RollupFuncArg};

pub(super) fn rollup_quantile(rfa: &RollupFuncArg, phi: f64) -> f64 {
    quantile(phi, rfa.values)
}

/// Writes one value per phi into the series map of rfa. The point itself is always NaN.
pub(crate) fn rollup_quantiles(rfa: &mut RollupFuncArg, params: &QuantilesParams) -> f64 {
    if rfa.values.is_empty() {
        return f64::NAN;
    }
    let mut qs = vec![0.0; params.phis.len()];
    quantiles(&mut qs, &params.phis, rfa.values);
    let idx = rfa.idx;
    if let Some(tsm) = rfa.tsm.as_deref_mut() {
        for (phi_label, q) in params.phi_labels.iter().zip(qs) {
            let ts = tsm.get_or_create_timeseries(&params.label, phi_label);
            ts.values[idx] = q;
        }
    }
    f64::NAN
}

/// Returns the last value if it lies outside 1.5 interquartile ranges, NaN otherwise.
///
/// See Outliers section at https://en.wikipedia.org/wiki/Interquartile_range
pub(super) fn rollup_outlier_iqr(rfa: &RollupFuncArg) -> f64 {
    let values = rfa.values;
    if values.len() < 2 {
        return f64::NAN;
    }
    let mut qs = [0.0; 2];
    quantiles(&mut qs, &IQR_PHIS, values);
    let [q25, q75] = qs;
    let iqr = 1.5 * (q75 - q25);

    let v = values[values.len() - 1];
    if v > q75 + iqr || v < q25 - iqr {
        return v;
    }
    f64::NAN
}
