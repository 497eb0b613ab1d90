//! Trace log decoding and encoding
//!
//! [`TraceReader`] turns a (possibly gzip-compressed) byte stream into a lazy
//! sequence of [`mscan_common::TraceEntry`]; [`TraceWriter`] produces the same
//! layout for tests and synthetic logs.

pub mod reader;
pub mod writer;

pub use reader::TraceReader;
pub use writer::TraceWriter;
