//! NodeClaim lifecycle: launch, registration, initialization, liveness,
//! emptiness, expiration, and garbage collection of orphaned instances.

pub mod actions;
pub mod garbagecollect;
pub mod reconcile;
