use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::prelude::*;
use tracing::{debug, field, info, trace_span, Span};

use vmquery_ast::expr::Expr;
use vmquery_ast::label::LabelFilter;
use vmquery_common::hash::{FastHashMap, FastHashSet, Signature};
use vmquery_common::pool::get_pooled_buffer;

use crate::cache::default_result_cache_storage::DefaultResultCacheStorage;
use crate::cache::serialization::{marshal_timeseries_fast, unmarshal_timeseries_fast};
use crate::cache::traits::RollupResultCacheStorage;
use crate::execution::EvalConfig;
use crate::runtime_error::{RuntimeError, RuntimeResult};
use crate::types::{read_u64, Timeseries, Timestamp, TimestampTrait};
use crate::utils::memory_limit;

/// Increment this value every time the format of the cache changes.
const ROLLUP_RESULT_CACHE_VERSION: u8 = 9;

/// The maximum number of time ranges kept per cached expression.
const MAX_META_INFO_ENTRIES: usize = 30;
const META_INFO_PRUNE_COUNT: usize = 10;

const MIN_CACHE_SIZE: usize = 1024 * 1024;

pub(crate) fn get_default_cache_size() -> usize {
    let n = memory_limit().unwrap_or(0) / 16;
    (n as usize).max(MIN_CACHE_SIZE)
}

/// Counters exposed by [`RollupResultCache::stats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub full_hits: u64,
    pub partial_hits: u64,
    pub misses: u64,
    pub too_big: u64,
    pub resets: u64,
}

#[derive(Default)]
struct CacheCounters {
    full_hits: AtomicU64,
    partial_hits: AtomicU64,
    misses: AtomicU64,
    too_big: AtomicU64,
    resets: AtomicU64,
}

/// Caches rollup results for time ranges which are unlikely to change, so repeated queries over
/// a sliding range only compute the points after the cached prefix.
pub struct RollupResultCache {
    storage: Mutex<Box<dyn RollupResultCacheStorage + Send>>,
    max_marshaled_size: usize,
    /// Random per-process prefix of payload keys.
    key_prefix: u64,
    cache_key_suffix: AtomicU64,
    /// Part of every index key. Bumping it makes all prior entries unreachable.
    generation: AtomicU64,
    counters: CacheCounters,
}

impl Default for RollupResultCache {
    fn default() -> Self {
        Self::with_size(get_default_cache_size())
    }
}

impl RollupResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_size(max_size: usize) -> Self {
        let storage = Box::new(DefaultResultCacheStorage::new(max_size));
        Self::with_storage(storage, max_size)
    }

    /// Creates a cache on top of a custom storage. `max_size` is the storage capacity in bytes;
    /// results larger than a quarter of it are never stored.
    pub fn with_storage(
        storage: Box<dyn RollupResultCacheStorage + Send>,
        max_size: usize,
    ) -> Self {
        let mut rng = thread_rng();
        let suffix: u64 = rng.gen_range((1 << 16)..(1 << 31));
        Self {
            storage: Mutex::new(storage),
            max_marshaled_size: max_size / 4,
            key_prefix: rng.gen(),
            cache_key_suffix: AtomicU64::new(suffix),
            generation: AtomicU64::new(0),
            counters: CacheCounters::default(),
        }
    }

    fn storage(&self) -> MutexGuard<'_, Box<dyn RollupResultCacheStorage + Send>> {
        // the storage only holds bytes, so a panic in another thread can't leave it inconsistent
        self.storage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the cached series for `expr` together with the timestamp from which the caller
    /// must compute fresh data. On a miss the series are `None` and the timestamp is `ec.start`.
    pub fn get(
        &self,
        ec: &EvalConfig,
        expr: &Expr,
        window: i64,
    ) -> RuntimeResult<(Option<Vec<Timeseries>>, Timestamp)> {
        let span = if ec.trace_enabled() {
            trace_span!(
                "cache_get",
                expr = %expr,
                window,
                cached_series = field::Empty,
                new_start = field::Empty
            )
        } else {
            Span::none()
        }
        .entered();

        if !ec.may_cache() {
            return Ok((None, ec.start));
        }

        let (tss, new_start) = match self.get_internal(ec, expr, window)? {
            Some(tss) if !tss.is_empty() => {
                let timestamps = &tss[0].timestamps;
                let new_start = timestamps[timestamps.len() - 1] + ec.step;
                if new_start > ec.end {
                    self.counters.full_hits.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.counters.partial_hits.fetch_add(1, Ordering::Relaxed);
                }
                (Some(tss), new_start)
            }
            _ => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                (None, ec.start)
            }
        };

        span.record("cached_series", tss.as_ref().map_or(0, |tss| tss.len()));
        span.record("new_start", new_start);
        Ok((tss, new_start))
    }

    fn get_internal(
        &self,
        ec: &EvalConfig,
        expr: &Expr,
        window: i64,
    ) -> RuntimeResult<Option<Vec<Timeseries>>> {
        let mut meta_key = get_pooled_buffer(256);
        self.marshal_rollup_result_cache_key(&mut meta_key, expr, window, ec);

        let mut meta_info_buf = get_pooled_buffer(512);
        let mut compressed = get_pooled_buffer(2048);
        {
            let mut storage = self.storage();
            if !storage.get(&meta_key, &mut meta_info_buf) || meta_info_buf.is_empty() {
                return Ok(None);
            }
            let mut mi = RollupResultCacheMetaInfo::from_buf(&meta_info_buf).unwrap_or_else(|e| {
                panic!("BUG: cannot unmarshal RollupResultCacheMetaInfo: {e}; it looks like it was improperly saved")
            });

            let Some(key) = mi.get_best_key(ec.start, ec.end) else {
                return Ok(None);
            };

            let mut payload_key = get_pooled_buffer(32);
            key.marshal(&mut payload_key);
            if !storage.get_big(&payload_key, &mut compressed) || compressed.is_empty() {
                // The payload has been evicted. Drop the dangling index entry.
                mi.remove_key(key);
                meta_info_buf.clear();
                mi.marshal(&mut meta_info_buf);
                storage.set(&meta_key, &meta_info_buf);
                return Ok(None);
            }
        }

        let Some((&version, payload)) = compressed.split_first() else {
            return Ok(None);
        };
        if version != ROLLUP_RESULT_CACHE_VERSION {
            return Ok(None);
        }
        let uncompressed = snap::raw::Decoder::new()
            .decompress_vec(payload)
            .unwrap_or_else(|e| {
                panic!("BUG: cannot decompress cached rollup result: {e}; it looks like it was improperly saved")
            });
        let mut tss = unmarshal_timeseries_fast(&uncompressed).unwrap_or_else(|e| {
            panic!("BUG: cannot unmarshal cached rollup result: {e}; it looks like it was improperly saved")
        });
        if tss.is_empty() {
            return Ok(None);
        }

        // Extract values for the matching timestamps
        let timestamps = Arc::clone(&tss[0].timestamps);
        let i = timestamps.partition_point(|&ts| ts < ec.start);
        if i == timestamps.len() {
            // no matches.
            return Ok(None);
        }
        if timestamps[i] != ec.start {
            // The cached range doesn't cover the requested range.
            return Ok(None);
        }
        let j = timestamps.partition_point(|&ts| ts <= ec.end);
        if j <= i {
            // no matches.
            return Ok(None);
        }

        let shared = Arc::new(timestamps[i..j].to_vec());
        for ts in tss.iter_mut() {
            ts.values.truncate(j);
            ts.values.drain(..i);
            ts.timestamps = Arc::clone(&shared);
        }
        Ok(Some(tss))
    }

    /// Stores `tss` computed for the full range of `ec`. Points too close to the current time
    /// are left out, since samples for them may still arrive.
    pub fn put(
        &self,
        ec: &EvalConfig,
        expr: &Expr,
        window: i64,
        tss: &[Timeseries],
    ) -> RuntimeResult<()> {
        if tss.is_empty() || !ec.may_cache() || ec.is_partial_response() {
            return Ok(());
        }

        let _span = if ec.trace_enabled() {
            trace_span!("cache_put", expr = %expr, window, series = tss.len())
        } else {
            Span::none()
        }
        .entered();

        // Remove values up to currentTime - step - cache_timestamp_offset,
        // since these values may be added later.
        let timestamps = &tss[0].timestamps;
        let deadline = Timestamp::now() - ec.step - ec.cache_timestamp_offset;
        let i = timestamps.partition_point(|&ts| ts <= deadline);
        if i == 0 {
            // Nothing to store in the cache.
            return Ok(());
        }

        let trimmed: Vec<Timeseries>;
        let tss = if i < timestamps.len() {
            let shared = Arc::new(timestamps[..i].to_vec());
            trimmed = tss
                .iter()
                .map(|ts| Timeseries {
                    metric_name: ts.metric_name.clone(),
                    values: ts.values[..i].to_vec(),
                    timestamps: Arc::clone(&shared),
                })
                .collect();
            &trimmed[..]
        } else {
            tss
        };
        let timestamps = &tss[0].timestamps;
        let start = timestamps[0];
        let end = timestamps[timestamps.len() - 1];

        let mut meta_key = get_pooled_buffer(256);
        self.marshal_rollup_result_cache_key(&mut meta_key, expr, window, ec);

        let mut meta_info_buf = get_pooled_buffer(512);
        let mut mi = {
            let mut storage = self.storage();
            if storage.get(&meta_key, &mut meta_info_buf) && !meta_info_buf.is_empty() {
                RollupResultCacheMetaInfo::from_buf(&meta_info_buf).unwrap_or_else(|e| {
                    panic!("BUG: cannot unmarshal RollupResultCacheMetaInfo: {e}; it looks like it was improperly saved")
                })
            } else {
                RollupResultCacheMetaInfo::default()
            }
        };

        if mi.covers_time_range(start, end) {
            // series on the given time range already exist in the cache
            return Ok(());
        }

        let mut result_buf = get_pooled_buffer(4096);
        if !marshal_timeseries_fast(&mut result_buf, tss, self.max_marshaled_size, ec.step) {
            self.counters.too_big.fetch_add(1, Ordering::Relaxed);
            debug!(
                "cannot store {} series on a time range={} in the rollup result cache, since they exceed {} bytes",
                tss.len(),
                ec.timerange_string(),
                self.max_marshaled_size
            );
            return Ok(());
        }

        let mut compressed = Vec::with_capacity(1 + snap::raw::max_compress_len(result_buf.len()));
        compressed.push(ROLLUP_RESULT_CACHE_VERSION);
        let compressed_body = snap::raw::Encoder::new()
            .compress_vec(&result_buf)
            .map_err(|e| {
                RuntimeError::SerializationError(format!("cannot compress rollup result: {e}"))
            })?;
        compressed.extend_from_slice(&compressed_body);

        let suffix = self.cache_key_suffix.fetch_add(1, Ordering::Relaxed);
        let key = RollupResultCacheKey {
            prefix: self.key_prefix,
            suffix,
        };
        let mut payload_key = get_pooled_buffer(32);
        key.marshal(&mut payload_key);

        mi.add_key(key, start, end);
        meta_info_buf.clear();
        mi.marshal(&mut meta_info_buf);

        let mut storage = self.storage();
        storage.set_big(&payload_key, &compressed);
        storage.set(&meta_key, &meta_info_buf);
        Ok(())
    }

    /// Makes every cached entry unreachable.
    pub fn reset(&self) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        self.counters.resets.fetch_add(1, Ordering::Relaxed);
        info!("rollup result cache has been reset; generation={generation}");
    }

    /// Drops all stored data. The cache stays usable.
    pub fn shutdown(&self) {
        self.storage().clear();
    }

    pub fn clear(&self) {
        self.storage().clear();
    }

    pub fn len(&self) -> usize {
        self.storage().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_marshaled_size(&self) -> usize {
        self.max_marshaled_size
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            full_hits: c.full_hits.load(Ordering::Relaxed),
            partial_hits: c.partial_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            too_big: c.too_big.load(Ordering::Relaxed),
            resets: c.resets.load(Ordering::Relaxed),
        }
    }

    /// Builds the index key:
    ///
    /// ```text
    /// [version u8][generation u64][expr len u64][expr][window i64][step i64][enforced filters]
    /// ```
    fn marshal_rollup_result_cache_key(
        &self,
        dst: &mut Vec<u8>,
        expr: &Expr,
        window: i64,
        ec: &EvalConfig,
    ) {
        dst.push(ROLLUP_RESULT_CACHE_VERSION);
        dst.extend_from_slice(&self.generation.load(Ordering::Relaxed).to_le_bytes());
        dst.extend_from_slice(&ec.tenant.account_id.to_le_bytes());
        dst.extend_from_slice(&ec.tenant.project_id.to_le_bytes());
        let expr_str = expr.to_string();
        dst.extend_from_slice(&(expr_str.len() as u64).to_le_bytes());
        dst.extend_from_slice(expr_str.as_bytes());
        dst.extend_from_slice(&window.to_le_bytes());
        dst.extend_from_slice(&ec.step.to_le_bytes());
        marshal_tag_filterss(dst, &ec.enforced_tag_filters);
    }
}

fn marshal_tag_filterss(dst: &mut Vec<u8>, etfs: &[Vec<LabelFilter>]) {
    dst.extend_from_slice(&(etfs.len() as u64).to_le_bytes());
    for etf in etfs {
        let mut sorted = etf.iter().collect::<Vec<_>>();
        sorted.sort();
        dst.extend_from_slice(&(sorted.len() as u64).to_le_bytes());
        for f in sorted {
            let s = f.to_string();
            dst.extend_from_slice(&(s.len() as u64).to_le_bytes());
            dst.extend_from_slice(s.as_bytes());
        }
    }
}

/// Concatenates cached series `a` with freshly computed series `b`.
///
/// `a` must cover `[ec.start, b_start)` and `b` must cover `[b_start, ec.end]`, both on the grid of
/// `ec`. Series are matched by name. Returns `None` if either side contains duplicate names, in
/// which case the caller has to compute the whole range.
pub(crate) fn merge_timeseries(
    a: Vec<Timeseries>,
    b: Vec<Timeseries>,
    b_start: Timestamp,
    ec: &EvalConfig,
) -> RuntimeResult<Option<Vec<Timeseries>>> {
    let shared_timestamps = ec.get_timestamps()?;
    let split = shared_timestamps.partition_point(|&ts| ts < b_start);
    let a_timestamps = &shared_timestamps[..split];
    let b_timestamps = &shared_timestamps[split..];

    let mut b = b;
    if b_timestamps.len() == shared_timestamps.len() {
        // Nothing to merge - b covers all the time range.
        for ts_b in b.iter_mut() {
            if ts_b.timestamps.as_slice() != b_timestamps {
                panic!(
                    "BUG: invalid timestamps in b series {}; got {:?}; want {:?}",
                    ts_b.metric_name, ts_b.timestamps, b_timestamps
                );
            }
            ts_b.timestamps = Arc::clone(&shared_timestamps);
        }
        return Ok(Some(b));
    }

    let mut m_a: FastHashMap<Signature, Timeseries> = FastHashMap::with_capacity(a.len());
    for ts in a.into_iter() {
        if ts.timestamps.as_slice() != a_timestamps {
            panic!(
                "BUG: invalid timestamps in a series {}; got {:?}; want {:?}",
                ts.metric_name, ts.timestamps, a_timestamps
            );
        }
        let key = ts.metric_name.signature();
        if m_a.insert(key, ts).is_some() {
            debug!("cannot merge series, since cached series contain duplicates");
            return Ok(None);
        }
    }

    let a_nans = vec![f64::NAN; a_timestamps.len()];
    let mut m_b: FastHashSet<Signature> = FastHashSet::with_capacity(b.len());
    let mut rvs: Vec<Timeseries> = Vec::with_capacity(m_a.len() + b.len());
    for ts_b in b.into_iter() {
        if ts_b.timestamps.as_slice() != b_timestamps {
            panic!(
                "BUG: invalid timestamps for b series {}; got {:?}; want {:?}",
                ts_b.metric_name, ts_b.timestamps, b_timestamps
            );
        }
        let key = ts_b.metric_name.signature();
        if !m_b.insert(key) {
            debug!("cannot merge series, since fresh series contain duplicates");
            return Ok(None);
        }

        let mut values = Vec::with_capacity(shared_timestamps.len());
        match m_a.remove(&key) {
            Some(ts_a) => values.extend_from_slice(&ts_a.values),
            None => values.extend_from_slice(&a_nans),
        }
        values.extend_from_slice(&ts_b.values);
        rvs.push(Timeseries {
            metric_name: ts_b.metric_name,
            values,
            timestamps: Arc::clone(&shared_timestamps),
        });
    }

    // Copy the remaining series from a.
    let b_nans = vec![f64::NAN; b_timestamps.len()];
    for (_, ts_a) in m_a.into_iter() {
        let mut values = ts_a.values;
        values.extend_from_slice(&b_nans);
        rvs.push(Timeseries {
            metric_name: ts_a.metric_name,
            values,
            timestamps: Arc::clone(&shared_timestamps),
        });
    }

    Ok(Some(rvs))
}

#[derive(Default, Debug, Clone, PartialEq)]
struct RollupResultCacheMetaInfo {
    entries: Vec<RollupResultCacheMetaInfoEntry>,
}

impl RollupResultCacheMetaInfo {
    fn from_buf(buf: &[u8]) -> RuntimeResult<Self> {
        let (count, mut src) = read_u64(buf, "meta info entries count")?;
        let mut entries = Vec::with_capacity((count as usize).min(MAX_META_INFO_ENTRIES + 1));
        for i in 0..count {
            let (entry, tail) = RollupResultCacheMetaInfoEntry::unmarshal(src).map_err(|e| {
                RuntimeError::SerializationError(format!("cannot unmarshal entry #{i}: {e}"))
            })?;
            entries.push(entry);
            src = tail;
        }
        if !src.is_empty() {
            return Err(RuntimeError::SerializationError(format!(
                "unexpected non-empty tail left; len(tail)={}",
                src.len()
            )));
        }
        Ok(Self { entries })
    }

    fn marshal(&self, dst: &mut Vec<u8>) {
        dst.extend_from_slice(&(self.entries.len() as u64).to_le_bytes());
        for entry in &self.entries {
            entry.marshal(dst);
        }
    }

    fn covers_time_range(&self, start: Timestamp, end: Timestamp) -> bool {
        if start > end {
            panic!("BUG: start cannot exceed end; got {start} vs {end}")
        }
        self.entries
            .iter()
            .any(|entry| start >= entry.start && end <= entry.end)
    }

    /// Picks the entry starting at or before `start` which overlaps the most with
    /// `[start, end]`. Later entries win ties.
    fn get_best_key(&self, start: Timestamp, end: Timestamp) -> Option<RollupResultCacheKey> {
        if start > end {
            panic!("BUG: start cannot exceed end; got {start} vs {end}")
        }
        let mut best_key = None;
        let mut d_max: i64 = 0;
        for e in self.entries.iter() {
            if start < e.start {
                continue;
            }
            let d = if end <= e.end { end - start } else { e.end - start };
            if d >= d_max {
                d_max = d;
                best_key = Some(e.key);
            }
        }
        best_key
    }

    fn add_key(&mut self, key: RollupResultCacheKey, start: Timestamp, end: Timestamp) {
        if start > end {
            panic!("BUG: start cannot exceed end; got {start} vs {end}")
        }
        self.entries
            .push(RollupResultCacheMetaInfoEntry { start, end, key });
        if self.entries.len() > MAX_META_INFO_ENTRIES {
            // Remove old entries.
            self.entries.drain(0..META_INFO_PRUNE_COUNT);
        }
    }

    fn remove_key(&mut self, key: RollupResultCacheKey) {
        self.entries.retain(|x| x.key != key)
    }
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
struct RollupResultCacheMetaInfoEntry {
    start: Timestamp,
    end: Timestamp,
    key: RollupResultCacheKey,
}

impl RollupResultCacheMetaInfoEntry {
    fn marshal(&self, dst: &mut Vec<u8>) {
        dst.extend_from_slice(&self.start.to_le_bytes());
        dst.extend_from_slice(&self.end.to_le_bytes());
        dst.extend_from_slice(&self.key.prefix.to_le_bytes());
        dst.extend_from_slice(&self.key.suffix.to_le_bytes());
    }

    fn unmarshal(src: &[u8]) -> RuntimeResult<(Self, &[u8])> {
        let (start, src) = read_u64(src, "start")?;
        let (end, src) = read_u64(src, "end")?;
        let (prefix, src) = read_u64(src, "key prefix")?;
        let (suffix, src) = read_u64(src, "key suffix")?;
        let entry = Self {
            start: start as i64,
            end: end as i64,
            key: RollupResultCacheKey { prefix, suffix },
        };
        Ok((entry, src))
    }
}

/// Key of a cached payload. It must be globally unique across nodes,
/// so it has a random prefix and a monotonically increasing suffix.
#[derive(Default, Debug, Hash, Copy, Eq, PartialEq, Clone)]
struct RollupResultCacheKey {
    prefix: u64,
    suffix: u64,
}

impl RollupResultCacheKey {
    fn marshal(&self, dst: &mut Vec<u8>) {
        dst.push(ROLLUP_RESULT_CACHE_VERSION);
        dst.extend_from_slice(&self.prefix.to_le_bytes());
        dst.extend_from_slice(&self.suffix.to_le_bytes());
    }
}

#[cfg(test)]
#[path = "rollup_result_cache_test.rs"]
mod rollup_result_cache_test;
