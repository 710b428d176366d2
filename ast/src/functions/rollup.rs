use std::fmt::{Display, Formatter};
use std::str::FromStr;

use phf::phf_map;
use serde::{Deserialize, Serialize};
use strum_macros::EnumIter;

use crate::ast_error::AstError;

/// Window functions evaluated over raw samples.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Hash, Default, EnumIter, Serialize, Deserialize,
)]
pub enum RollupFunction {
    AbsentOverTime,
    AggrOverTime,
    AscentOverTime,
    AvgOverTime,
    Changes,
    ChangesPrometheus,
    CountEqOverTime,
    CountGtOverTime,
    CountLeOverTime,
    CountNeOverTime,
    CountOverTime,
    DecreasesOverTime,
    #[default]
    DefaultRollup,
    Delta,
    DeltaPrometheus,
    Deriv,
    DerivFast,
    DescentOverTime,
    DistinctOverTime,
    DurationOverTime,
    FirstOverTime,
    GeomeanOverTime,
    HoeffdingBoundLower,
    HoeffdingBoundUpper,
    HoltWinters,
    IDelta,
    IDeriv,
    Increase,
    IncreasePrometheus,
    IncreasePure,
    IncreasesOverTime,
    Integrate,
    IQROverTime,
    IRate,
    Lag,
    LastOverTime,
    Lifetime,
    MadOverTime,
    MaxOverTime,
    MedianOverTime,
    MinOverTime,
    ModeOverTime,
    OutlierIQROverTime,
    PredictLinear,
    PresentOverTime,
    QuantileOverTime,
    QuantilesOverTime,
    RangeOverTime,
    Rate,
    RateOverSum,
    Resets,
    Rollup,
    RollupCandlestick,
    RollupDelta,
    RollupDeriv,
    RollupIncrease,
    RollupRate,
    RollupScrapeInterval,
    ScrapeInterval,
    ShareEqOverTime,
    ShareGtOverTime,
    ShareLeOverTime,
    StaleSamplesOverTime,
    StddevOverTime,
    StdvarOverTime,
    SumEqOverTime,
    SumGtOverTime,
    SumLeOverTime,
    SumOverTime,
    Sum2OverTime,
    TFirstOverTime,
    Timestamp,
    TimestampWithName,
    TLastChangeOverTime,
    TLastOverTime,
    TMaxOverTime,
    TMinOverTime,
    ZScoreOverTime,
}

impl Display for RollupFunction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

static FUNCTION_MAP: phf::Map<&'static str, RollupFunction> = phf_map! {
    "absent_over_time" => RollupFunction::AbsentOverTime,
    "aggr_over_time" => RollupFunction::AggrOverTime,
    "ascent_over_time" => RollupFunction::AscentOverTime,
    "avg_over_time" => RollupFunction::AvgOverTime,
    "changes" => RollupFunction::Changes,
    "changes_prometheus" => RollupFunction::ChangesPrometheus,
    "count_eq_over_time" => RollupFunction::CountEqOverTime,
    "count_gt_over_time" => RollupFunction::CountGtOverTime,
    "count_le_over_time" => RollupFunction::CountLeOverTime,
    "count_ne_over_time" => RollupFunction::CountNeOverTime,
    "count_over_time" => RollupFunction::CountOverTime,
    "decreases_over_time" => RollupFunction::DecreasesOverTime,
    "default_rollup" => RollupFunction::DefaultRollup,
    "delta" => RollupFunction::Delta,
    "delta_prometheus" => RollupFunction::DeltaPrometheus,
    "deriv" => RollupFunction::Deriv,
    "deriv_fast" => RollupFunction::DerivFast,
    "descent_over_time" => RollupFunction::DescentOverTime,
    "distinct_over_time" => RollupFunction::DistinctOverTime,
    "duration_over_time" => RollupFunction::DurationOverTime,
    "first_over_time" => RollupFunction::FirstOverTime,
    "geomean_over_time" => RollupFunction::GeomeanOverTime,
    "hoeffding_bound_lower" => RollupFunction::HoeffdingBoundLower,
    "hoeffding_bound_upper" => RollupFunction::HoeffdingBoundUpper,
    "holt_winters" => RollupFunction::HoltWinters,
    "idelta" => RollupFunction::IDelta,
    "ideriv" => RollupFunction::IDeriv,
    "increase" => RollupFunction::Increase,
    "increase_prometheus" => RollupFunction::IncreasePrometheus,
    "increase_pure" => RollupFunction::IncreasePure,
    "increases_over_time" => RollupFunction::IncreasesOverTime,
    "integrate" => RollupFunction::Integrate,
    "iqr_over_time" => RollupFunction::IQROverTime,
    "irate" => RollupFunction::IRate,
    "lag" => RollupFunction::Lag,
    "last_over_time" => RollupFunction::LastOverTime,
    "lifetime" => RollupFunction::Lifetime,
    "mad_over_time" => RollupFunction::MadOverTime,
    "max_over_time" => RollupFunction::MaxOverTime,
    "median_over_time" => RollupFunction::MedianOverTime,
    "min_over_time" => RollupFunction::MinOverTime,
    "mode_over_time" => RollupFunction::ModeOverTime,
    "outlier_iqr_over_time" => RollupFunction::OutlierIQROverTime,
    "predict_linear" => RollupFunction::PredictLinear,
    "present_over_time" => RollupFunction::PresentOverTime,
    "quantile_over_time" => RollupFunction::QuantileOverTime,
    "quantiles_over_time" => RollupFunction::QuantilesOverTime,
    "range_over_time" => RollupFunction::RangeOverTime,
    "rate" => RollupFunction::Rate,
    "rate_over_sum" => RollupFunction::RateOverSum,
    "resets" => RollupFunction::Resets,
    "rollup" => RollupFunction::Rollup,
    "rollup_candlestick" => RollupFunction::RollupCandlestick,
    "rollup_delta" => RollupFunction::RollupDelta,
    "rollup_deriv" => RollupFunction::RollupDeriv,
    "rollup_increase" => RollupFunction::RollupIncrease,
    "rollup_rate" => RollupFunction::RollupRate,
    "rollup_scrape_interval" => RollupFunction::RollupScrapeInterval,
    "scrape_interval" => RollupFunction::ScrapeInterval,
    "share_eq_over_time" => RollupFunction::ShareEqOverTime,
    "share_gt_over_time" => RollupFunction::ShareGtOverTime,
    "share_le_over_time" => RollupFunction::ShareLeOverTime,
    "stale_samples_over_time" => RollupFunction::StaleSamplesOverTime,
    "stddev_over_time" => RollupFunction::StddevOverTime,
    "stdvar_over_time" => RollupFunction::StdvarOverTime,
    "sum_eq_over_time" => RollupFunction::SumEqOverTime,
    "sum_gt_over_time" => RollupFunction::SumGtOverTime,
    "sum_le_over_time" => RollupFunction::SumLeOverTime,
    "sum_over_time" => RollupFunction::SumOverTime,
    "sum2_over_time" => RollupFunction::Sum2OverTime,
    "tfirst_over_time" => RollupFunction::TFirstOverTime,
    "timestamp" => RollupFunction::Timestamp,
    "timestamp_with_name" => RollupFunction::TimestampWithName,
    "tlast_change_over_time" => RollupFunction::TLastChangeOverTime,
    "tlast_over_time" => RollupFunction::TLastOverTime,
    "tmax_over_time" => RollupFunction::TMaxOverTime,
    "tmin_over_time" => RollupFunction::TMinOverTime,
    "zscore_over_time" => RollupFunction::ZScoreOverTime,
};

impl RollupFunction {
    pub fn name(&self) -> &'static str {
        FUNCTION_MAP
            .entries()
            .find(|(_, f)| *f == self)
            .map(|(name, _)| *name)
            .unwrap_or("default_rollup")
    }

    /// These functions don't change physical meaning of input time series,
    /// so they don't drop metric name
    pub const fn keep_metric_name(&self) -> bool {
        use RollupFunction::*;
        matches!(
            self,
            AvgOverTime
                | DefaultRollup
                | FirstOverTime
                | GeomeanOverTime
                | HoeffdingBoundLower
                | HoeffdingBoundUpper
                | HoltWinters
                | IQROverTime
                | LastOverTime
                | MaxOverTime
                | MedianOverTime
                | MinOverTime
                | ModeOverTime
                | PredictLinear
                | QuantileOverTime
                | QuantilesOverTime
                | Rollup
                | RollupCandlestick
                | TimestampWithName
        )
    }

    pub const fn should_remove_counter_resets(&self) -> bool {
        use RollupFunction::*;
        matches!(
            self,
            Increase
                | IncreasePrometheus
                | IncreasePure
                | IRate
                | Rate
                | RollupIncrease
                | RollupRate
        )
    }

    /// Functions which rely on the sample preceding the lookbehind window.
    pub const fn need_silence_interval(&self) -> bool {
        use RollupFunction::*;
        matches!(
            self,
            AscentOverTime
                | Changes
                | DecreasesOverTime
                | DefaultRollup
                | Delta
                | DerivFast
                | DescentOverTime
                | IDelta
                | IDeriv
                | Increase
                | IncreasePure
                | IncreasesOverTime
                | Integrate
                | IRate
                | Lag
                | Lifetime
                | Rate
                | Resets
                | Rollup
                | RollupCandlestick
                | RollupDelta
                | RollupDeriv
                | RollupIncrease
                | RollupRate
                | RollupScrapeInterval
                | ScrapeInterval
                | TLastChangeOverTime
        )
    }

    /// The lookbehind window may be extended for these functions, so that it contains
    /// enough points for a non-empty result.
    pub const fn can_adjust_window(&self) -> bool {
        use RollupFunction::*;
        matches!(
            self,
            DefaultRollup
                | Deriv
                | DerivFast
                | IDeriv
                | IRate
                | Rate
                | RateOverSum
                | Rollup
                | RollupCandlestick
                | RollupDeriv
                | RollupRate
                | RollupScrapeInterval
                | ScrapeInterval
                | Timestamp
        )
    }

    /// Functions accepted by `aggr_over_time`.
    pub const fn is_aggregate_function(&self) -> bool {
        use RollupFunction::*;
        !matches!(
            self,
            AggrOverTime
                | ChangesPrometheus
                | CountEqOverTime
                | CountGtOverTime
                | CountLeOverTime
                | CountNeOverTime
                | DeltaPrometheus
                | DurationOverTime
                | HoeffdingBoundLower
                | HoeffdingBoundUpper
                | HoltWinters
                | IncreasePrometheus
                | OutlierIQROverTime
                | PredictLinear
                | QuantileOverTime
                | QuantilesOverTime
                | Rollup
                | RollupCandlestick
                | RollupDelta
                | RollupDeriv
                | RollupIncrease
                | RollupRate
                | RollupScrapeInterval
                | ShareEqOverTime
                | ShareGtOverTime
                | ShareLeOverTime
                | SumEqOverTime
                | SumGtOverTime
                | SumLeOverTime
        )
    }

    /// The number of samples scanned by a single call, if it doesn't depend on the window size.
    pub const fn samples_scanned_per_call(&self) -> Option<usize> {
        use RollupFunction::*;
        match self {
            AbsentOverTime | CountOverTime | DefaultRollup | FirstOverTime | Lag
            | LastOverTime | PresentOverTime | TFirstOverTime | Timestamp | TimestampWithName
            | TLastOverTime => Some(1),
            Delta | DeltaPrometheus | DerivFast | IDelta | IDeriv | Increase
            | IncreasePrometheus | IncreasePure | IRate | Lifetime | Rate
            | ScrapeInterval => Some(2),
            _ => None,
        }
    }

    /// Index of the argument which holds the series selector (or subquery).
    pub const fn rollup_arg_idx(&self, arg_count: usize) -> usize {
        use RollupFunction::*;
        match self {
            QuantileOverTime | HoeffdingBoundLower | HoeffdingBoundUpper => 1,
            QuantilesOverTime | AggrOverTime => {
                if arg_count > 0 {
                    arg_count - 1
                } else {
                    0
                }
            }
            _ => 0,
        }
    }
}

impl FromStr for RollupFunction {
    type Err = AstError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FUNCTION_MAP
            .get(s)
            .or_else(|| {
                let lower = s.to_ascii_lowercase();
                FUNCTION_MAP.get(lower.as_str())
            })
            .copied()
            .ok_or_else(|| AstError::UnknownFunction(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn every_function_has_a_name_that_round_trips() {
        for func in RollupFunction::iter() {
            let name = func.name();
            assert_eq!(RollupFunction::from_str(name).unwrap(), func, "{name}");
        }
    }

    #[test]
    fn lookup_is_case_insensitive() {
        assert_eq!(RollupFunction::from_str("RATE").unwrap(), RollupFunction::Rate);
        assert!(RollupFunction::from_str("not_a_rollup").is_err());
    }

    #[test]
    fn counter_functions_remove_resets() {
        assert!(RollupFunction::Rate.should_remove_counter_resets());
        assert!(RollupFunction::Increase.should_remove_counter_resets());
        assert!(!RollupFunction::Delta.should_remove_counter_resets());
    }

    #[test]
    fn arg_index() {
        assert_eq!(RollupFunction::QuantileOverTime.rollup_arg_idx(2), 1);
        assert_eq!(RollupFunction::QuantilesOverTime.rollup_arg_idx(4), 3);
        assert_eq!(RollupFunction::Rate.rollup_arg_idx(1), 0);
    }
}
