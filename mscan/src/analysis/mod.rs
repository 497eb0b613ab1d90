//! Built-in analyses
//!
//! Each analysis is an [`EntryHandler`] contributing one top-level key to
//! the report. `--dump` replaces all of them with [`EntryDump`].

pub mod call_intervals;
pub mod dump;
pub mod serial_sections;
pub mod summary;

pub use call_intervals::CallIntervals;
pub use dump::{write_entry, EntryDump};
pub use serial_sections::{LockSummary, SerialSections};
pub use summary::Summary;

use crate::config::ScanConfig;
use crate::dispatch::{Dispatcher, EntryHandler, ScanContext};

/// Shared state for a scan
///
/// A dump reports records as they are, so it skips the object index and
/// label or segment inconsistencies cannot abort it.
#[must_use]
pub fn context(config: &ScanConfig, dump: bool) -> ScanContext {
    let ctx = ScanContext::new(config.index_limits());
    if dump {
        ctx.without_objects()
    } else {
        ctx
    }
}

/// The analyses a normal scan runs, in report order
#[must_use]
pub fn builtin(config: &ScanConfig) -> Vec<Box<dyn EntryHandler>> {
    vec![
        Box::new(CallIntervals::new()),
        Box::new(Summary::new()),
        Box::new(SerialSections::new(config.lock_limits())),
    ]
}

/// Register either the entry dump or the built-in analyses
pub fn register(dispatcher: &mut Dispatcher, config: &ScanConfig, dump: bool) {
    if dump {
        dispatcher.register(Box::new(EntryDump::new()));
    } else {
        for handler in builtin(config) {
            dispatcher.register(handler);
        }
    }
}
