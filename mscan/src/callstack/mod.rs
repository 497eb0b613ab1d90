//! Per-cpu call-stack reconstruction
//!
//! [`PerCallStack`] owns the call-tag state machine (start, pause, resume,
//! done) and one application record per live tag. [`CallTimeline`] is the
//! record that turns fcall and nested call entries into linked intervals.

pub mod per_call_stack;
pub mod timeline;

pub use per_call_stack::{CallRecord, PerCallStack, Transition};
pub use timeline::{CallInterval, CallTimeline, IntervalIds};
