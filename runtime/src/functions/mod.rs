pub(crate) mod aggregate;
pub(crate) mod binary;
pub(crate) mod rollup;
pub(crate) mod transform;
