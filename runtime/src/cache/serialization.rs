use std::sync::Arc;

use crate::runtime_error::{RuntimeError, RuntimeResult};
use crate::types::{assert_identical_timestamps, read_u64, MetricName, Timeseries};

const HEADER_SIZE: usize = 16;

/// Returns the number of bytes `marshal_timeseries_fast` writes for `tss`.
pub(crate) fn marshaled_timeseries_size(tss: &[Timeseries]) -> usize {
    let points = tss.first().map_or(0, |ts| ts.timestamps.len());
    let names = tss
        .iter()
        .map(|ts| ts.metric_name.marshaled_size())
        .sum::<usize>();
    HEADER_SIZE + 8 * points + 8 * points * tss.len() + names
}

/// Appends the binary form of `tss` to `dst`:
///
/// ```text
/// [series count u64][timestamp count u64][timestamps i64...]
/// [values f64... per series][metric name per series]
/// ```
///
/// All numbers are little-endian. Every series must share the same timestamps with the given
/// `step` between them. Returns false and leaves `dst` untouched if the result would exceed
/// `max_size` bytes.
pub(crate) fn marshal_timeseries_fast(
    dst: &mut Vec<u8>,
    tss: &[Timeseries],
    max_size: usize,
    step: i64,
) -> bool {
    assert_identical_timestamps(tss, step);

    let size = marshaled_timeseries_size(tss);
    if size > max_size {
        return false;
    }
    dst.reserve(size);

    let timestamps: &[i64] = tss.first().map_or(&[], |ts| ts.timestamps.as_slice());
    dst.extend_from_slice(&(tss.len() as u64).to_le_bytes());
    dst.extend_from_slice(&(timestamps.len() as u64).to_le_bytes());
    for ts in timestamps {
        dst.extend_from_slice(&ts.to_le_bytes());
    }
    for ts in tss {
        for v in ts.values.iter() {
            dst.extend_from_slice(&v.to_le_bytes());
        }
    }
    for ts in tss {
        ts.metric_name.marshal(dst);
    }
    true
}

/// Decodes series written by `marshal_timeseries_fast`. The decoded series share one
/// timestamps allocation.
pub(crate) fn unmarshal_timeseries_fast(src: &[u8]) -> RuntimeResult<Vec<Timeseries>> {
    let (series_count, tail) = read_u64(src, "series count")?;
    let (points, tail) = read_u64(tail, "timestamp count")?;
    let series_count = series_count as usize;
    let points = points as usize;

    let values_len = points
        .checked_mul(series_count)
        .and_then(|n| n.checked_add(points))
        .and_then(|n| n.checked_mul(8))
        .ok_or_else(|| {
            RuntimeError::SerializationError(format!(
                "invalid header: {series_count} series with {points} points each"
            ))
        })?;
    if tail.len() < values_len {
        return Err(RuntimeError::SerializationError(format!(
            "cannot unmarshal {} series with {} points from {} bytes; need at least {} bytes",
            series_count,
            points,
            tail.len(),
            values_len
        )));
    }

    let (ts_buf, tail) = tail.split_at(8 * points);
    let timestamps: Vec<i64> = ts_buf
        .chunks_exact(8)
        .map(|chunk| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(chunk);
            i64::from_le_bytes(buf)
        })
        .collect();
    let timestamps = Arc::new(timestamps);

    let (values_buf, mut tail) = tail.split_at(8 * points * series_count);
    let mut tss = Vec::with_capacity(series_count);
    if points == 0 {
        for _ in 0..series_count {
            tss.push(Timeseries::with_shared_timestamps(&timestamps, &[]));
        }
    } else {
        for chunk in values_buf.chunks_exact(8 * points) {
            let values = chunk
                .chunks_exact(8)
                .map(|v| {
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(v);
                    f64::from_le_bytes(buf)
                })
                .collect::<Vec<_>>();
            tss.push(Timeseries {
                metric_name: MetricName::default(),
                values,
                timestamps: Arc::clone(&timestamps),
            });
        }
    }

    for (i, ts) in tss.iter_mut().enumerate() {
        let (mn, rest) = MetricName::unmarshal(tail).map_err(|e| {
            RuntimeError::SerializationError(format!("cannot unmarshal metric name #{i}: {e}"))
        })?;
        ts.metric_name = mn;
        tail = rest;
    }

    if !tail.is_empty() {
        return Err(RuntimeError::SerializationError(format!(
            "unexpected non-empty tail left after unmarshaling series; len(tail)={}",
            tail.len()
        )));
    }

    Ok(tss)
}
