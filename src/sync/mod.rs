//! Synchronization primitives used throughout the driver.
//!
//! [`spin::Spin`] backs simple mutual-exclusion state (the object list, per-object properties),
//! while [`rwlock::RwLock`] backs the counting reader/writer locks guarding file content and the
//! block cache, matching the lock hierarchy described for the driver's concurrency model.

pub mod rwlock;
pub mod spin;

pub use rwlock::RwLock;
pub use spin::Spin;
