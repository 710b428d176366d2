use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use scopeguard::{guard, ScopeGuard};

use crate::runtime_error::{RuntimeError, RuntimeResult};

/// A byte budget shared by concurrently running evaluations.
#[derive(Debug, Default)]
pub struct MemoryLimiter {
    usage: AtomicUsize,
    max_size: usize,
}

/// A successful reservation. The reserved bytes are released when it is dropped.
pub type MemoryReservation = ScopeGuard<(Arc<MemoryLimiter>, usize), fn((Arc<MemoryLimiter>, usize))>;

impl MemoryLimiter {
    pub fn new(max_size: usize) -> Self {
        MemoryLimiter {
            usage: AtomicUsize::new(0),
            max_size,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn usage(&self) -> usize {
        self.usage.load(Ordering::Acquire)
    }

    /// Adds `n` to the usage if the result stays within the budget. Returns false and leaves
    /// the usage untouched otherwise.
    pub fn reserve(&self, n: usize) -> bool {
        if n > self.max_size {
            return false;
        }
        self.usage
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |usage| {
                if self.max_size - n >= usage {
                    Some(usage + n)
                } else {
                    None
                }
            })
            .is_ok()
    }

    /// Returns `n` previously reserved bytes. Releasing more than is held is a bug.
    pub fn release(&self, n: usize) {
        let res = self
            .usage
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |usage| {
                usage.checked_sub(n)
            });
        if let Err(usage) = res {
            panic!("BUG: MemoryLimiter: n={n} cannot exceed {usage}");
        }
    }

    /// Reserves `n` bytes for the lifetime of the returned guard.
    pub fn reserve_guard(self: &Arc<Self>, n: usize) -> RuntimeResult<MemoryReservation> {
        if !self.reserve(n) {
            return Err(RuntimeError::ResourcesExhausted(format!(
                "{n} bytes: {} bytes of {} are already in use",
                self.usage(),
                self.max_size
            )));
        }
        let release: fn((Arc<MemoryLimiter>, usize)) = |(limiter, n)| limiter.release(n);
        Ok(guard((Arc::clone(self), n), release))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_and_release() {
        let ml = MemoryLimiter::new(100);
        assert!(ml.reserve(10));
        assert!(ml.reserve(20));
        assert_eq!(ml.usage(), 30);
        assert!(!ml.reserve(1000));
        assert!(!ml.reserve(71));
        assert_eq!(ml.usage(), 30);
        assert!(ml.reserve(70));
        assert_eq!(ml.usage(), 100);
        ml.release(10);
        ml.release(70);
        assert_eq!(ml.usage(), 20);
    }

    #[test]
    #[should_panic(expected = "BUG: MemoryLimiter")]
    fn over_release_panics() {
        let ml = MemoryLimiter::new(100);
        assert!(ml.reserve(10));
        ml.release(11);
    }

    #[test]
    fn guard_releases_on_drop() {
        let ml = Arc::new(MemoryLimiter::new(100));
        {
            let _r = ml.reserve_guard(60).unwrap();
            assert_eq!(ml.usage(), 60);
            let err = ml.reserve_guard(50).unwrap_err();
            assert!(matches!(err, RuntimeError::ResourcesExhausted(_)));
        }
        assert_eq!(ml.usage(), 0);
    }

    #[test]
    fn concurrent_reservations_never_exceed_budget() {
        let ml = Arc::new(MemoryLimiter::new(1000));
        std::thread::scope(|s| {
            for _ in 0..8 {
                let ml = Arc::clone(&ml);
                s.spawn(move || {
                    for _ in 0..1000 {
                        if ml.reserve(7) {
                            assert!(ml.usage() <= 1000);
                            ml.release(7);
                        }
                    }
                });
            }
        });
        assert_eq!(ml.usage(), 0);
    }
}
