//! Query execution core for a Prometheus compatible time series database.
//!
//! Expressions are built with the `vmquery_ast` constructors and evaluated with [`exec`] or
//! [`query_range`] against a [`Context`], which holds the storage, the rollup result cache and
//! the memory limiter shared by all queries.

mod cache;
mod common;
mod execution;
mod functions;
mod provider;
mod runtime_error;
mod types;
mod utils;

#[cfg(test)]
mod tests;

pub use cache::{CacheStats, DefaultResultCacheStorage, RollupResultCache, RollupResultCacheStorage};
pub use common::math::{is_stale_nan, stale_nan};
pub use execution::*;
pub use provider::*;
pub use runtime_error::*;
pub use types::*;
pub use utils::{memory_limit, MemoryLimiter, MemoryReservation};

pub mod prelude {
    pub use crate::cache::*;
    pub use crate::execution::*;
    pub use crate::provider::*;
    pub use crate::runtime_error::*;
    pub use crate::types::*;
    pub use vmquery_ast::prelude::*;
}
