mod memory;
mod memory_limiter;

pub use memory::*;
pub use memory_limiter::*;
