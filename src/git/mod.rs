//! Git backend: bare checkout management, commit enumeration and the
//! commit-range walk.
//!
//! All operations shell out to the `git` binary using `tokio::process::Command`
//! for non-blocking execution.

pub mod checkout;
pub mod commands;
pub mod log;
pub mod manager;
pub mod range_diff;

pub use checkout::Checkout;
pub use manager::{GitManager, RepositoryOps, DEFAULT_HISTORY_DEPTH};
