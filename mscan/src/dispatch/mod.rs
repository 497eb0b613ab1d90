//! # Record Dispatch
//!
//! Drives one scan over a decoded trace:
//!
//! ```text
//!  TraceReader ──► Dispatcher::dispatch ──► ScanContext::apply
//!                        │                   (run state, object index)
//!                        ▼
//!                  handlers routed by record kind
//!                        │
//!                        ▼ exit
//!                  JsonDict (report root)
//! ```
//!
//! The shared [`ScanContext`] is updated before any handler sees a record.
//! Handlers are called in registration order.

pub mod context;
pub mod dispatcher;
pub mod run_state;

pub use context::ScanContext;
pub use dispatcher::{Dispatcher, EntryHandler, RunStats};
pub use run_state::{RunState, TaskInfo};
