//! Structured error types for mscan
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! Every fatal error carries enough context (address, tag, cpu, access count)
//! to find the offending record in the log.

use std::io;
use std::path::PathBuf;

use mscan_common::WireError;
use thiserror::Error;

use super::types::{CallTag, CpuId, LockId};

/// The trace stream is corrupt
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("failed to open trace {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("record at offset {offset} declares {size} bytes, larger than any record ({max})")]
    Oversized { offset: u64, size: u16, max: usize },

    #[error("{kind} record at offset {offset} declares {size} bytes, smaller than its {min} byte layout")]
    Undersized { offset: u64, kind: &'static str, size: u16, min: usize },

    #[error("trace ends mid-record at offset {offset}")]
    Truncated { offset: u64 },

    #[error("malformed record at offset {offset}: {source}")]
    Malformed {
        offset: u64,
        #[source]
        source: WireError,
    },

    #[error("invalid record at access {access_count}: {source}")]
    InvalidRecord {
        access_count: u64,
        #[source]
        source: WireError,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Object index invariant broken past its tolerance
#[derive(Error, Debug)]
pub enum LabelError {
    #[error("{count} overlapping {class} labels, latest {name} at {addr:#x} (access {access_count})")]
    TooManyOverlaps { class: &'static str, name: String, addr: u64, access_count: u64, count: u64 },

    #[error("{count} {class} removals matched no live label, latest at {addr:#x} (access {access_count})")]
    TooManyMisses { class: &'static str, addr: u64, access_count: u64, count: u64 },

    #[error("percpu template {name} at offset {offset:#x} ({bytes} bytes) ends past segment end {end:#x}")]
    SegmentOverflow { name: String, offset: u64, bytes: u64, end: u64 },

    #[error("segment record for {0} objects; only percpu segments are supported")]
    UnsupportedSegment(&'static str),

    #[error("failed to read symbol file {}: {source}", .path.display())]
    SymbolFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Call-stack state machine violation
#[derive(Error, Debug)]
pub enum CallStackError {
    #[error("start of {tag} on {cpu} (access {access_count}): tag already exists")]
    DuplicateTag { tag: CallTag, cpu: CpuId, access_count: u64 },

    #[error("{op} of {tag} on {cpu} (access {access_count}): cpu is running {current}")]
    CpuBusy { op: &'static str, tag: CallTag, cpu: CpuId, current: CallTag, access_count: u64 },

    #[error("resume of unknown {tag} on {cpu} (access {access_count})")]
    UnknownTag { tag: CallTag, cpu: CpuId, access_count: u64 },

    #[error("done of {tag} on {cpu} (access {access_count}): cpu has no current call")]
    NoCurrent { tag: CallTag, cpu: CpuId, access_count: u64 },

    #[error("done of {tag} on {cpu} (access {access_count}): cpu is running {current}")]
    TagMismatch { tag: CallTag, cpu: CpuId, current: CallTag, access_count: u64 },

    #[error("{cpu} is beyond the {num_cpus} cpus declared by the machine record (access {access_count})")]
    CpuOutOfRange { cpu: CpuId, num_cpus: u16, access_count: u64 },
}

/// Lock tracker tolerance exceeded
#[derive(Error, Debug)]
pub enum LockError {
    #[error("{count} releases of unheld locks, latest {lock} ({name}) on {cpu} (access {access_count})")]
    TooManyReleaseMisses { lock: LockId, name: String, cpu: CpuId, access_count: u64, count: u64 },

    #[error("{count} acquired without acquire, latest {lock} ({name}) on {cpu} (access {access_count})")]
    TooManyAcquiredMisses { lock: LockId, name: String, cpu: CpuId, access_count: u64, count: u64 },
}

/// Streaming output misuse or sink failure
#[derive(Error, Debug)]
pub enum SerializeError {
    #[error("cannot add to a closed {0}")]
    ClosedCollection(&'static str),

    #[error("duplicate key {0:?} in dict")]
    DuplicateKey(String),

    #[error("{0} output collections still open")]
    Unfinished(usize),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Any fatal error a scan can end with
#[derive(Error, Debug)]
pub enum ScanError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Label(#[from] LabelError),

    #[error(transparent)]
    CallStack(#[from] CallStackError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Serialize(#[from] SerializeError),
}
