//! Decrypted-value cache
//!
//! Keeps recently decrypted secrets in memory for a bounded time so repeated
//! reads of the same file do not go back to the keyservice.

mod clock;
mod secret;
mod sweeper;

pub use clock::{Clock, ManualClock, SystemClock};
pub use secret::{CacheStats, SecretCache, SecretValue};
pub use sweeper::{CacheSweeper, SweeperHandle};

use std::time::Duration;

/// Default time-to-live for a decrypted value
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Default interval between expiry sweeps
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);
