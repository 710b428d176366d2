use super::handler::IncrementalAggrHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncrementalAggrMin;

impl IncrementalAggrHandler for IncrementalAggrMin {
    fn combine(&self, acc: f64, v: f64) -> f64 {
        acc.min(v)
    }
}
