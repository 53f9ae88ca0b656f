//! Concurrency control over checkouts and the shared KeyDB connection.
//!
//! The lock registry serializes work on one repository's checkout inside this
//! process; the KeyDB pool is shared by the store and the message bus.

pub mod locks;
pub mod redis;

pub use locks::{RepositoryGuard, RepositoryLocker};
