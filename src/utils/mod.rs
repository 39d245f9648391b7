//! Small concurrency primitives shared across the crate.

pub mod debouncer;
pub mod pending;
pub mod retry;
pub mod watchable;
