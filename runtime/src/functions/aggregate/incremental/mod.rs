mod any;
mod avg;
mod context;
mod count;
mod geomean;
mod group;
mod handler;
mod max;
mod min;
mod sum;
mod sum2;

pub use context::*;
pub use handler::*;
