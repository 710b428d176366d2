use super::handler::IncrementalAggrHandler;

/// Every non-NaN input contributes one. Merging adds up the partial counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncrementalAggrCount;

impl IncrementalAggrHandler for IncrementalAggrCount {
    fn seed(&self, _v: f64) -> f64 {
        1.0
    }

    fn combine(&self, acc: f64, v: f64) -> f64 {
        acc + v
    }
}
