pub use default_result_cache_storage::*;
pub use rollup_result_cache::*;
pub use traits::*;

mod default_result_cache_storage;
mod rollup_result_cache;
pub(crate) mod serialization;
mod traits;
