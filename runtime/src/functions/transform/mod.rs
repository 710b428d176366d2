mod transform_fns;
#[cfg(test)]
mod transform_test;
mod union;

pub(crate) use transform_fns::{get_transform_func, TransformFuncArg, TransformFuncHandler};
