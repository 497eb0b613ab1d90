//! Lock and critical-section tracking

pub mod lock_manager;

pub use lock_manager::{CriticalSection, LockLimits, LockTracker};
