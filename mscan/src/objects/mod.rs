//! Object index: which labeled object owns a guest address
//!
//! Objects enter the index three ways: label records in the trace (heap and
//! block allocations), a static symbol listing loaded before the scan, and
//! per-cpu templates materialized by segment records.

pub mod label_map;
pub mod nm;

pub use label_map::{ClassStats, IndexLimits, LabeledObject, ObjectIndex, PerCpuTemplate};
pub use nm::{load_nm, load_nm_file, NmSummary};
