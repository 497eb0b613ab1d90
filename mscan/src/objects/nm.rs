//! Static kernel symbols from an `nm -S` listing
//!
//! Data, bss, read-only and absolute symbols become static objects. Symbols
//! between `__per_cpu_start` and `__per_cpu_end` are per-cpu variables: they
//! become templates instead, placed by the segment records of the trace.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use log::info;

use super::label_map::{ObjectIndex, PerCpuTemplate};
use crate::domain::LabelError;

/// What an nm listing contributed to the index
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NmSummary {
    pub statics: usize,
    pub templates: usize,
    /// Zero-sized symbols and aliases of an earlier symbol
    pub skipped: usize,
}

struct Symbol {
    addr: u64,
    size: u64,
    name: String,
}

/// Load an nm listing from disk into `index`
///
/// # Errors
/// Returns [`LabelError::SymbolFile`] if the file cannot be read
pub fn load_nm_file<P: AsRef<Path>>(path: P, index: &mut ObjectIndex) -> Result<NmSummary, LabelError> {
    let path = path.as_ref();
    let file = File::open(path)
        .map_err(|source| LabelError::SymbolFile { path: path.to_path_buf(), source })?;
    let summary = load_nm(BufReader::new(file), index)
        .map_err(|source| LabelError::SymbolFile { path: path.to_path_buf(), source })?;
    info!(
        "{}: {} static objects, {} per-cpu templates",
        path.display(),
        summary.statics,
        summary.templates
    );
    Ok(summary)
}

/// Load an nm listing from any reader into `index`
///
/// Lines that are neither sized data symbols nor per-cpu markers are ignored.
///
/// # Errors
/// Propagates read errors
pub fn load_nm<R: BufRead>(reader: R, index: &mut ObjectIndex) -> io::Result<NmSummary> {
    let mut symbols = Vec::new();
    let mut percpu_start = None;
    let mut percpu_end = None;

    for line in reader.lines() {
        let line = line?;
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [addr, .., name] if matches!(*name, "__per_cpu_start" | "__per_cpu_end") => {
                let Ok(addr) = u64::from_str_radix(addr, 16) else { continue };
                if *name == "__per_cpu_start" {
                    percpu_start = Some(addr);
                } else {
                    percpu_end = Some(addr);
                }
            }
            [addr, size, kind, name] if is_data_symbol(kind) => {
                let (Ok(addr), Ok(size)) =
                    (u64::from_str_radix(addr, 16), u64::from_str_radix(size, 16))
                else {
                    continue;
                };
                symbols.push(Symbol { addr, size, name: (*name).to_string() });
            }
            _ => {}
        }
    }

    let percpu = match (percpu_start, percpu_end) {
        (Some(start), Some(end)) => start..end,
        _ => 0..0,
    };

    let mut summary = NmSummary::default();
    for sym in symbols {
        if percpu.contains(&sym.addr) {
            index.add_template(PerCpuTemplate {
                name: sym.name,
                offset: sym.addr,
                bytes: sym.size,
                pc: 0,
            });
            summary.templates += 1;
        } else if index.add_static(&sym.name, sym.addr, sym.size).is_some() {
            summary.statics += 1;
        } else {
            summary.skipped += 1;
        }
    }
    Ok(summary)
}

/// `D`/`d` data, `B`/`b` bss, `R`/`r` read-only, `A` absolute
fn is_data_symbol(kind: &str) -> bool {
    matches!(kind, "D" | "d" | "B" | "b" | "R" | "r" | "A")
}
