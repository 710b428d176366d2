use crate::runtime_error::{RuntimeError, RuntimeResult};
use crate::types::Timeseries;

/// An evaluated function argument.
///
/// Numeric arguments arrive as a series set (a scalar is a single unnamed series with one value
/// per output point); string arguments keep their literal text.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryValue {
    InstantVector(Vec<Timeseries>),
    Scalar(f64),
    String(String),
}

impl QueryValue {
    pub fn nan() -> Self {
        QueryValue::Scalar(f64::NAN)
    }

    pub fn data_type_name(&self) -> &'static str {
        match &self {
            QueryValue::Scalar(_) => "Scalar",
            QueryValue::String(_) => "String",
            QueryValue::InstantVector(_) => "InstantVector",
        }
    }

    /// Returns the per-point values of a scalar-like argument. `len` is the number of output
    /// points; plain scalars are broadcast to it.
    pub fn get_scalar_values(&self, arg_num: usize, len: usize) -> RuntimeResult<Vec<f64>> {
        match self {
            QueryValue::Scalar(val) => Ok(vec![*val; len]),
            QueryValue::InstantVector(series) => {
                if series.len() != 1 {
                    return Err(RuntimeError::ArgumentError(format!(
                        "arg #{} must contain a single timeseries; got {} timeseries",
                        arg_num + 1,
                        series.len()
                    )));
                }
                Ok(series[0].values.clone())
            }
            QueryValue::String(_) => Err(RuntimeError::ArgumentError(format!(
                "unexpected type for arg #{}; got {}; want scalar",
                arg_num + 1,
                self.data_type_name()
            ))),
        }
    }

    /// Returns the first value of a scalar-like argument.
    pub fn get_scalar(&self, arg_num: usize) -> RuntimeResult<f64> {
        match self {
            QueryValue::Scalar(val) => Ok(*val),
            _ => {
                let values = self.get_scalar_values(arg_num, 1)?;
                Ok(values.first().copied().unwrap_or(f64::NAN))
            }
        }
    }

    pub fn get_int(&self, arg_num: usize) -> RuntimeResult<i64> {
        let v = self.get_scalar(arg_num)?;
        if v.is_nan() {
            return Ok(0);
        }
        Ok(v.clamp(i64::MIN as f64, i64::MAX as f64) as i64)
    }

    /// Returns the text of a string argument. A string literal evaluated as a series is accepted
    /// as well: it is a single series named after the string, holding only NaNs.
    pub fn get_string(&self, arg_num: usize) -> RuntimeResult<String> {
        match self {
            QueryValue::String(s) => Ok(s.clone()),
            QueryValue::InstantVector(series) => {
                if series.len() != 1 {
                    return Err(RuntimeError::ArgumentError(format!(
                        "arg #{} must contain a single timeseries; got {} timeseries",
                        arg_num + 1,
                        series.len()
                    )));
                }
                let ts = &series[0];
                if ts.values.iter().any(|v| !v.is_nan()) {
                    return Err(RuntimeError::ArgumentError(format!(
                        "arg #{} contains non-string timeseries",
                        arg_num + 1
                    )));
                }
                Ok(ts.metric_name.metric_group.clone())
            }
            QueryValue::Scalar(_) => Err(RuntimeError::ArgumentError(format!(
                "unexpected type for arg #{}; got {}; want string",
                arg_num + 1,
                self.data_type_name()
            ))),
        }
    }

    pub fn into_instant_vector(self, timestamps: &std::sync::Arc<Vec<i64>>) -> Vec<Timeseries> {
        match self {
            QueryValue::InstantVector(series) => series,
            QueryValue::Scalar(v) => vec![Timeseries::constant(timestamps, v)],
            QueryValue::String(s) => {
                let mut ts = Timeseries::constant(timestamps, f64::NAN);
                ts.metric_name.set_metric_group(&s);
                vec![ts]
            }
        }
    }
}
