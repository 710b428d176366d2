use super::context::IncrementalAggrContext;
use super::handler::IncrementalAggrHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncrementalAggrAvg;

impl IncrementalAggrHandler for IncrementalAggrAvg {
    // Do not use `Rapid calculation methods` at https://en.wikipedia.org/wiki/Standard_deviation,
    // since it is slower and has no obvious benefits in increased precision.
    fn combine(&self, acc: f64, v: f64) -> f64 {
        acc + v
    }

    fn finalize(&self, iac: &mut IncrementalAggrContext) {
        for (count, v) in iac.values.iter().zip(iac.ts.values.iter_mut()) {
            if *count == 0.0 {
                *v = f64::NAN;
                continue;
            }
            *v /= count;
        }
    }
}
