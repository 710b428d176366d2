//! Window functions over raw samples and the machinery which slides them along the output grid.
mod candlestick;
mod delta;
mod deriv;
mod filtered_counts;
mod hoeffding_bound;
mod holt_winters;
mod quantiles;
mod rollup_config;
mod rollup_fns;
mod timeseries_map;
mod types;


pub(crate) use rollup_config::*;
pub(crate) use rollup_fns::{get_rollup_handler, MAX_SILENCE_INTERVAL};
pub(crate) use timeseries_map::*;
pub(crate) use types::*;
