//! Callset definitions shipped with the crate.

pub mod test_rpc;
