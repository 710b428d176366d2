use std::sync::LazyLock;

use byte_pool::{Block, BytePool};
use lockfree_object_pool::{LinearObjectPool, LinearReusable};

static BYTE_POOL: LazyLock<BytePool<Vec<u8>>> = LazyLock::new(BytePool::new);

pub type PooledBuffer = Block<'static, Vec<u8>>;

/// Pooled objects are reset on every return to the pool, so a pulled object is always empty.
/// Dropping the handle is the only way to release it.
pub type PooledVecF64 = LinearReusable<'static, Vec<f64>>;

pub fn get_pooled_buffer(size: usize) -> PooledBuffer {
    let mut buf = BYTE_POOL.alloc(size);
    buf.clear();
    buf
}

static F64_POOL: LazyLock<LinearObjectPool<Vec<f64>>> =
    LazyLock::new(|| LinearObjectPool::new(Vec::new, |v: &mut Vec<f64>| v.clear()));

/// get_pooled_vec_f64 returns an empty f64 vec with at least the given capacity.
pub fn get_pooled_vec_f64(size: usize) -> PooledVecF64 {
    let mut v = F64_POOL.pull();
    v.reserve(size);
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pooled_vectors_are_reset_before_reuse() {
        {
            let mut v = get_pooled_vec_f64(4);
            v.extend_from_slice(&[1.0, 2.0, 3.0]);
        }
        let v = get_pooled_vec_f64(4);
        assert!(v.is_empty());
        assert!(v.capacity() >= 4);
    }

    #[test]
    fn buffer_is_empty() {
        let buf = get_pooled_buffer(64);
        assert!(buf.is_empty());
    }
}
