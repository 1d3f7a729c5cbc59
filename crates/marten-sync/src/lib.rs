//! # Marten VM synchronization primitives
//!
//! Exact mutual-exclusion building blocks shared by the VM crates:
//!
//! - [`Mutex`]: exclusive, non-recursive lock over the platform primitive
//! - [`RecursiveMutex`]: exclusive lock with re-entrant ownership
//! - [`LockGuard`]: scope-bound acquire/release over either mutex type
//! - [`LazyInstance`]: race-free init-on-first-use process singleton
//!
//! Application code holds these locks only through [`LockGuard`]; the raw
//! `unlock` surface exists for the guard and is `unsafe` to discourage
//! hand-matched pairing.

pub mod lazy;
pub mod mutex;

pub use lazy::{LazyInstance, LazyMutex, LazyRecursiveMutex};
pub use mutex::{LockGuard, Lockable, Mutex, RecursiveMutex};
