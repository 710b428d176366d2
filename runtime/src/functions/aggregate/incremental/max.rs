use super::handler::IncrementalAggrHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncrementalAggrMax;

impl IncrementalAggrHandler for IncrementalAggrMax {
    fn combine(&self, acc: f64, v: f64) -> f64 {
        acc.max(v)
    }
}
