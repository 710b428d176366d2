extern crate byte_pool;
extern crate lockfree_object_pool;
extern crate xxhash_rust;

pub mod hash;
pub mod pool;

pub mod prelude {
    pub use crate::hash::*;
    pub use crate::pool::*;
}
