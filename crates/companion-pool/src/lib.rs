//! Credential pool for companion auction polling
//!
//! Keeps a set of minted session bundles alive, hands the healthiest one to
//! each poll, tracks per-bundle failures, and mints replacements when the
//! usable count drops below the configured floor.
//!
//! Bundle lifecycle:
//! 1. `SessionMinter` produces a bundle → inserted at the back of the pool
//! 2. `acquire` selects fewest failures, then most recent success, then oldest
//! 3. Success resets the failure counter; auth rejection marks the bundle dead
//! 4. Dead or expired bundles are evicted on the next pool access
//! 5. `ensure_capacity` starts at most one repair mint per cooldown window

pub mod error;
pub mod pool;
pub mod repair;

pub use error::{Error, Result};
pub use pool::{CredentialPool, FailureKind, PoolSettings, RepairTrigger};
pub use repair::spawn_maintenance_task;
