use super::context::IncrementalAggrContext;
use super::handler::IncrementalAggrHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncrementalAggrGeomean;

impl IncrementalAggrHandler for IncrementalAggrGeomean {
    fn combine(&self, acc: f64, v: f64) -> f64 {
        acc * v
    }

    fn finalize(&self, iac: &mut IncrementalAggrContext) {
        for (count, v) in iac.values.iter().zip(iac.ts.values.iter_mut()) {
            if *count == 0.0 {
                *v = f64::NAN;
                continue;
            }
            *v = v.powf(1.0 / count);
        }
    }
}
