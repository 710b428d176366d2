pub use metric_name::*;
pub use query_value::*;
pub use timeseries::*;
pub use timestamp::*;

mod metric_name;
mod query_value;
mod timeseries;
mod timestamp;
