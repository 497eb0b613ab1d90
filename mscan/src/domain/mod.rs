//! Domain model for mscan
//!
//! This module contains core domain types and errors that provide:
//! - Compile-time safety via newtype pattern
//! - Self-documenting function signatures
//! - Structured error handling

pub mod errors;
pub mod types;

// Re-export common types for convenience
pub use types::{CallTag, CpuId, Cycles, IntervalId, LockId, ObjectId};

pub use errors::{CallStackError, DecodeError, LabelError, LockError, ScanError, SerializeError};
