//! Report output
//!
//! Every analysis writes its results through the streaming JSON writer in
//! [`json_stream`], so a long scan never holds the whole report in memory.

pub mod json_stream;

pub use json_stream::{Hex, JsonDict, JsonList, JsonStream};
