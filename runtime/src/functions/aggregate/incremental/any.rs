use super::context::IncrementalAggrContext;
use super::handler::IncrementalAggrHandler;

/// Keeps the values of the first series folded into the group and ignores the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncrementalAggrAny;

impl IncrementalAggrHandler for IncrementalAggrAny {
    fn combine(&self, acc: f64, _v: f64) -> f64 {
        acc
    }

    fn update(&self, iac: &mut IncrementalAggrContext, values: &[f64]) {
        if iac.values.first().is_some_and(|count| *count > 0.0) {
            return;
        }
        iac.values.fill(1.0);
        iac.ts.values.clear();
        iac.ts.values.extend_from_slice(values);
    }

    fn merge(&self, dst: &mut IncrementalAggrContext, src: &IncrementalAggrContext) {
        if dst.values.first().is_some_and(|count| *count > 0.0) {
            return;
        }
        dst.values.copy_from_slice(&src.values);
        dst.ts.values.clear();
        dst.ts.values.extend_from_slice(&src.ts.values);
    }
}
