mod aggr_fns;
mod incremental;

pub(crate) use aggr_fns::*;
pub(crate) use incremental::*;

#[cfg(test)]
mod aggr_test;
#[cfg(test)]
mod aggr_incremental_test;
