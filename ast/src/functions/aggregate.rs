//! AggregateFunction module contains enum for available aggregation functions.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use phf::phf_map;
use serde::{Deserialize, Serialize};
use strum_macros::EnumIter;

use crate::ast_error::AstError;

/// Aggregation functions
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Hash, EnumIter, Serialize, Deserialize)]
pub enum AggregateFunction {
    /// calculate sum over dimensions
    Sum,
    /// calculate minimum over dimensions
    Min,
    /// calculate maximum over dimensions
    Max,
    /// calculate the average over dimensions
    Avg,
    /// calculate population standard deviation over dimensions
    StdDev,
    /// calculate population standard variance over dimensions
    StdVar,
    /// count the number of elements in the vector
    Count,
    /// count the number of elements with the same value
    CountValues,
    /// smallest k elements by sample value
    Bottomk,
    /// largest k elements by sample value
    Topk,
    /// calculate φ-quantile (0 ≤ φ ≤ 1) over dimensions
    Quantile,
    Quantiles,
    Group,

    Median,
    MAD,
    Limitk,
    Distinct,
    Sum2,
    GeoMean,
    TopkMin,
    TopkMax,
    TopkAvg,
    TopkLast,
    TopkMedian,
    BottomkMin,
    BottomkMax,
    BottomkAvg,
    BottomkLast,
    BottomkMedian,
    /// any(q) by (group_labels) returns a single series per group_labels out of time series returned by q.
    Any,
    OutliersMAD,
    Mode,
    Share,
    ZScore,
}

static FUNCTION_MAP: phf::Map<&'static str, AggregateFunction> = phf_map! {
    "sum" => AggregateFunction::Sum,
    "min" => AggregateFunction::Min,
    "max" => AggregateFunction::Max,
    "avg" => AggregateFunction::Avg,
    "stddev" => AggregateFunction::StdDev,
    "stdvar" => AggregateFunction::StdVar,
    "count" => AggregateFunction::Count,
    "count_values" => AggregateFunction::CountValues,
    "bottomk" => AggregateFunction::Bottomk,
    "topk" => AggregateFunction::Topk,
    "quantile" => AggregateFunction::Quantile,
    "quantiles" => AggregateFunction::Quantiles,
    "group" => AggregateFunction::Group,
    "median" => AggregateFunction::Median,
    "mad" => AggregateFunction::MAD,
    "limitk" => AggregateFunction::Limitk,
    "distinct" => AggregateFunction::Distinct,
    "sum2" => AggregateFunction::Sum2,
    "geomean" => AggregateFunction::GeoMean,
    "topk_min" => AggregateFunction::TopkMin,
    "topk_max" => AggregateFunction::TopkMax,
    "topk_avg" => AggregateFunction::TopkAvg,
    "topk_last" => AggregateFunction::TopkLast,
    "topk_median" => AggregateFunction::TopkMedian,
    "bottomk_min" => AggregateFunction::BottomkMin,
    "bottomk_max" => AggregateFunction::BottomkMax,
    "bottomk_avg" => AggregateFunction::BottomkAvg,
    "bottomk_last" => AggregateFunction::BottomkLast,
    "bottomk_median" => AggregateFunction::BottomkMedian,
    "any" => AggregateFunction::Any,
    "outliers_mad" => AggregateFunction::OutliersMAD,
    "mode" => AggregateFunction::Mode,
    "share" => AggregateFunction::Share,
    "zscore" => AggregateFunction::ZScore,
};

impl AggregateFunction {
    pub const fn name(&self) -> &'static str {
        use AggregateFunction::*;

        match self {
            Sum => "sum",
            Min => "min",
            Max => "max",
            Avg => "avg",
            StdDev => "stddev",
            StdVar => "stdvar",
            Count => "count",
            CountValues => "count_values",
            Bottomk => "bottomk",
            Topk => "topk",
            Quantile => "quantile",
            Quantiles => "quantiles",
            Group => "group",
            Median => "median",
            MAD => "mad",
            Limitk => "limitk",
            Distinct => "distinct",
            Sum2 => "sum2",
            GeoMean => "geomean",
            TopkMin => "topk_min",
            TopkMax => "topk_max",
            TopkAvg => "topk_avg",
            TopkLast => "topk_last",
            TopkMedian => "topk_median",
            BottomkMin => "bottomk_min",
            BottomkMax => "bottomk_max",
            BottomkAvg => "bottomk_avg",
            BottomkLast => "bottomk_last",
            BottomkMedian => "bottomk_median",
            Any => "any",
            OutliersMAD => "outliers_mad",
            Mode => "mode",
            Share => "share",
            ZScore => "zscore",
        }
    }

    /// Index of the argument holding the series to aggregate. Functions such as `topk`
    /// take their parameters first.
    pub const fn series_arg_idx(&self, arg_count: usize) -> usize {
        use AggregateFunction::*;
        match self {
            Bottomk | BottomkAvg | BottomkLast | BottomkMax | BottomkMedian | BottomkMin
            | CountValues | Limitk | OutliersMAD | Quantile | Topk | TopkAvg | TopkLast
            | TopkMax | TopkMedian | TopkMin => 1,
            Quantiles => {
                if arg_count > 0 {
                    arg_count - 1
                } else {
                    0
                }
            }
            _ => 0,
        }
    }

    /// Reports whether the function orders its output itself, in which case the caller
    /// must not re-sort the result.
    pub const fn keeps_own_order(&self) -> bool {
        use AggregateFunction::*;
        matches!(
            self,
            Topk | Bottomk
                | TopkMax
                | TopkMin
                | TopkAvg
                | TopkMedian
                | TopkLast
                | BottomkMax
                | BottomkMin
                | BottomkAvg
                | BottomkMedian
                | BottomkLast
        )
    }
}

impl Display for AggregateFunction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for AggregateFunction {
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

pub fn is_aggr_func(name: &str) -> bool {
    AggregateFunction::from_str(name).is_ok()
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn names_round_trip() {
        for func in AggregateFunction::iter() {
            assert_eq!(AggregateFunction::from_str(func.name()).unwrap(), func);
        }
    }

    #[test]
    fn series_arg_index() {
        assert_eq!(AggregateFunction::Sum.series_arg_idx(1), 0);
        assert_eq!(AggregateFunction::Topk.series_arg_idx(2), 1);
        assert_eq!(AggregateFunction::Quantiles.series_arg_idx(4), 3);
    }
}
