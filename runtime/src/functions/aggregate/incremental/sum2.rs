use super::handler::IncrementalAggrHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncrementalAggrSum2;

impl IncrementalAggrHandler for IncrementalAggrSum2 {
    fn seed(&self, v: f64) -> f64 {
        v * v
    }

    fn combine(&self, acc: f64, v: f64) -> f64 {
        acc + v
    }
}
