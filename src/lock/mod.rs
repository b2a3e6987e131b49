//! Distributed locks with token ownership, retry, and lease renewal.

mod distributed;
mod manager;
mod renewal;
mod token;

pub use distributed::{lock_key, DistributedLock, LockOptions, RetryPolicy, LOCK_KEY_PREFIX};
pub use manager::LockManager;
pub use renewal::RenewalStatus;
pub use token::generate_token;
