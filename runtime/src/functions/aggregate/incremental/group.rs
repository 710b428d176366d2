use super::context::IncrementalAggrContext;
use super::handler::IncrementalAggrHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncrementalAggrGroup;

impl IncrementalAggrHandler for IncrementalAggrGroup {
    fn seed(&self, _v: f64) -> f64 {
        1.0
    }

    fn combine(&self, _acc: f64, _v: f64) -> f64 {
        1.0
    }

    fn finalize(&self, iac: &mut IncrementalAggrContext) {
        for (count, v) in iac.values.iter().zip(iac.ts.values.iter_mut()) {
            *v = if *count == 0.0 { f64::NAN } else { 1.0 };
        }
    }
}
