use std::sync::Arc;

use crate::cache::{get_default_cache_size, RollupResultCache};
use crate::provider::{MetricStorage, NullMetricStorage};
use crate::utils::{memory_limit, MemoryLimiter};

const DEFAULT_MAX_POINTS_PER_TIMESERIES: usize = 30_000;
const DEFAULT_MAX_POINTS_SUBQUERY_PER_TIMESERIES: usize = 100_000;
const DEFAULT_CACHE_TIMESTAMP_OFFSET: i64 = 5 * 60 * 1000;

/// Used when the process memory limit cannot be determined.
const FALLBACK_ROLLUP_MEMORY_LIMIT: usize = 1024 * 1024 * 1024;

/// Process level settings shared by every query evaluated through a [`Context`].
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Whether to disable response caching. This may be useful during data backfilling.
    pub disable_cache: bool,

    /// Enables tracing spans for evaluation steps.
    pub trace_enabled: bool,

    /// Set if the database doesn't contain Prometheus stale markers, so there is no need in
    /// spending additional CPU time on their handling.
    pub no_stale_markers: bool,

    /// The maximum points per a single timeseries returned from a range query.
    pub max_points_per_timeseries: usize,

    /// The maximum number of points per series a subquery may generate.
    pub max_points_subquery_per_timeseries: usize,

    /// The maximum number of time series a single query may select. Zero means no limit.
    pub max_series: usize,

    /// The maximum amount of memory a single query may consume. Zero means no per-query limit
    /// besides the shared rollup budget.
    pub max_memory_per_query: usize,

    /// The offset from the current time for the newest cached point, in milliseconds.
    pub cache_timestamp_offset: i64,

    /// Prometheus' `query.lookback-delta`, in milliseconds. Zero keeps the per-series default.
    pub lookback_delta: i64,

    /// Capacity of the rollup result cache, in bytes.
    pub rollup_result_cache_size: usize,

    /// Budget shared by all concurrent rollup evaluations, in bytes.
    pub rollup_memory_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let rollup_memory_limit = memory_limit()
            .map(|n| (n / 2) as usize)
            .unwrap_or(FALLBACK_ROLLUP_MEMORY_LIMIT);
        Self {
            disable_cache: false,
            trace_enabled: false,
            no_stale_markers: false,
            max_points_per_timeseries: DEFAULT_MAX_POINTS_PER_TIMESERIES,
            max_points_subquery_per_timeseries: DEFAULT_MAX_POINTS_SUBQUERY_PER_TIMESERIES,
            max_series: 0,
            max_memory_per_query: 0,
            cache_timestamp_offset: DEFAULT_CACHE_TIMESTAMP_OFFSET,
            lookback_delta: 0,
            rollup_result_cache_size: get_default_cache_size(),
            rollup_memory_limit,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.disable_cache = !enabled;
        self
    }

    pub fn with_stale_markers(mut self, enabled: bool) -> Self {
        self.no_stale_markers = !enabled;
        self
    }

    pub fn with_trace_enabled(mut self, enabled: bool) -> Self {
        self.trace_enabled = enabled;
        self
    }

    pub fn with_max_memory_per_query(mut self, max: usize) -> Self {
        self.max_memory_per_query = max;
        self
    }

    pub fn with_rollup_memory_limit(mut self, max: usize) -> Self {
        self.rollup_memory_limit = max;
        self
    }

    pub fn with_max_series(mut self, max: usize) -> Self {
        self.max_series = max;
        self
    }
}

/// Services used while evaluating queries. One instance is shared by all concurrent queries;
/// nothing here is process-global.
pub struct Context {
    pub config: SessionConfig,
    pub rollup_result_cache: Arc<RollupResultCache>,
    pub memory_limiter: Arc<MemoryLimiter>,
    pub storage: Arc<dyn MetricStorage>,
}

impl Context {
    pub fn new(storage: Arc<dyn MetricStorage>) -> Self {
        Self::with_config(SessionConfig::default(), storage)
    }

    pub fn with_config(config: SessionConfig, storage: Arc<dyn MetricStorage>) -> Self {
        let rollup_result_cache = RollupResultCache::with_size(config.rollup_result_cache_size);
        let memory_limiter = MemoryLimiter::new(config.rollup_memory_limit);
        Self {
            config,
            rollup_result_cache: Arc::new(rollup_result_cache),
            memory_limiter: Arc::new(memory_limiter),
            storage,
        }
    }

    pub fn trace_enabled(&self) -> bool {
        self.config.trace_enabled
    }

    /// Drops every cached rollup result. Useful after backfilling data.
    pub fn reset_rollup_result_cache(&self) {
        self.rollup_result_cache.reset()
    }

    /// Releases the resources held by the context. Queries must not run afterwards.
    pub fn shutdown(&self) {
        self.rollup_result_cache.shutdown()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new(Arc::new(NullMetricStorage {}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_override_defaults() {
        let config = SessionConfig::default()
            .with_cache(false)
            .with_stale_markers(false)
            .with_trace_enabled(true)
            .with_max_memory_per_query(4096);
        assert!(config.disable_cache);
        assert!(config.no_stale_markers);
        assert!(config.trace_enabled);
        assert_eq!(config.max_memory_per_query, 4096);
        assert_eq!(config.max_points_per_timeseries, 30_000);
    }

    #[test]
    fn context_uses_configured_limits() {
        let config = SessionConfig::default().with_rollup_memory_limit(1000);
        let ctx = Context::with_config(config, Arc::new(NullMetricStorage {}));
        assert_eq!(ctx.memory_limiter.max_size(), 1000);
        assert_eq!(ctx.memory_limiter.usage(), 0);
        assert!(ctx.rollup_result_cache.is_empty());
    }
}
