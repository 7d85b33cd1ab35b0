//! Node termination: cordon, drain with tiered eviction, cloud delete, and
//! finalizer removal.

pub mod actions;
pub mod evict;
pub mod reconcile;
