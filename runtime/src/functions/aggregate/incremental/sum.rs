use super::handler::IncrementalAggrHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncrementalAggrSum;

impl IncrementalAggrHandler for IncrementalAggrSum {
    fn combine(&self, acc: f64, v: f64) -> f64 {
        acc + v
    }
}
