//! # Symbol Resolution
//!
//! Turns guest program counters from the trace into function names, source
//! files and line numbers, and names the object fields that lock and access
//! addresses fall in.
//!
//! ## DWARF
//!
//! The trace records raw guest kernel addresses. With an unstripped `vmlinux`
//! (built with `CONFIG_DEBUG_INFO`) the kernel image carries DWARF debug info
//! that maps:
//! - instruction addresses to function names
//! - instruction addresses to source files and lines
//! - inlined call chains at one address (optimized code)
//!
//! **Libraries used**:
//! - `gimli`: Low-level DWARF parser
//! - `addr2line`: High-level symbolization library built on gimli
//! - `object`: ELF parser
//!
//! The kernel is not relocated the way a PIE userspace binary is, so trace
//! pcs are looked up as-is.
//!
//! ## Collaborator Traits
//!
//! Analyses never talk to DWARF directly; they take trait objects so a run
//! without a kernel image still produces a report:
//!
//! ```text
//!  Symbolize ──┬── Symbolizer         (addr2line over vmlinux, cached)
//!              └── AddressSymbolizer  (pc rendered as hex)
//!
//!  TypeResolver ── OffsetTypeResolver (type+0xoffset)
//! ```
//!
//! ## Limitations
//!
//! - **Requires debug info**: a stripped image resolves nothing
//! - **Inlining**: only the innermost entry of an inline chain carries the pc

pub mod symbolizer;
pub mod types;

pub use symbolizer::{
    AddressSymbolizer, InlinedFrame, ResolvedFrame, SourceLocation, Symbolize, Symbolizer,
};
pub use types::{OffsetTypeResolver, TypeResolver};
