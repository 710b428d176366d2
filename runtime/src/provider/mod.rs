pub use deadline::*;
pub use memory_storage::MemoryMetricStorage;
pub use search::*;
pub(crate) use utils::*;

mod deadline;
mod memory_storage;
mod search;
mod utils;
