// String formatting intentionally uses format! for clarity
#![allow(clippy::format_push_string)]

use addr2line::Context;
use anyhow::{Context as _, Result};
use gimli::{EndianRcSlice, RunTimeEndian};
use object::{Object, ObjectSection};
use rustc_demangle::demangle;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::rc::Rc;

/// Maps guest program counters to functions and source lines
pub trait Symbolize {
    /// Inline chain for `pc`, innermost function first
    fn resolve(&self, pc: u64) -> ResolvedFrame;

    /// One-line description used in reports
    fn describe(&self, pc: u64) -> String {
        self.resolve(pc).describe()
    }
}

type DwarfSlice = EndianRcSlice<RunTimeEndian>;

/// Symbolizer backed by the DWARF info of a guest kernel image
///
/// Includes a cache so the same pc is only looked up once; reports tend to
/// symbolize the same few lock call sites over and over.
pub struct Symbolizer {
    ctx: Context<DwarfSlice>,
    /// Cache of resolved frames by address
    cache: RefCell<HashMap<u64, ResolvedFrame>>,
}

impl Symbolizer {
    /// Load the debug info of a guest kernel image (typically `vmlinux`)
    ///
    /// # Errors
    /// Returns an error if the image cannot be read, is not an object file,
    /// or was built without `.debug_info`
    pub fn new<P: AsRef<Path>>(image_path: P) -> Result<Self> {
        let path = image_path.as_ref();
        let image = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let elf = object::File::parse(&*image)
            .with_context(|| format!("{} is not an object file", path.display()))?;
        if elf.section_by_name(".debug_info").is_none() {
            anyhow::bail!("{} has no .debug_info; rebuild the kernel with debug info", path.display());
        }

        let dwarf = load_dwarf(&elf)
            .with_context(|| format!("Failed to load DWARF sections of {}", path.display()))?;
        let ctx = Context::from_dwarf(dwarf)
            .with_context(|| format!("Failed to index DWARF units of {}", path.display()))?;
        Ok(Self { ctx, cache: RefCell::new(HashMap::new()) })
    }

    /// Demangle a symbol name; C symbols come back unchanged
    #[must_use]
    pub fn demangle_symbol(symbol: &str) -> String {
        format!("{:#}", demangle(symbol))
    }
}

/// Copy every DWARF section the image has into shared slices; missing
/// sections load as empty
fn load_dwarf(elf: &object::File<'_>) -> Result<gimli::Dwarf<DwarfSlice>, gimli::Error> {
    let endian = if elf.is_little_endian() { RunTimeEndian::Little } else { RunTimeEndian::Big };
    gimli::Dwarf::load(|id: gimli::SectionId| -> Result<DwarfSlice, gimli::Error> {
        let bytes: Rc<[u8]> = match elf.section_by_name(id.name()) {
            Some(section) => Rc::from(&*section.uncompressed_data().map_err(|_| gimli::Error::Io)?),
            None => Rc::from(Vec::new()),
        };
        Ok(EndianRcSlice::new(bytes, endian))
    })
}

impl Symbolize for Symbolizer {
    fn resolve(&self, pc: u64) -> ResolvedFrame {
        if let Some(cached) = self.cache.borrow().get(&pc) {
            return cached.clone();
        }

        let mut result = Vec::new();

        if let Ok(mut frame_iter) = self.ctx.find_frames(pc).skip_all_loads() {
            while let Ok(Some(frame)) = frame_iter.next() {
                let function = frame
                    .function
                    .and_then(|f| f.raw_name().ok().map(|name| Self::demangle_symbol(&name)))
                    .unwrap_or_else(|| UNKNOWN_FUNCTION.to_string());

                let location = frame.location.map(|loc| SourceLocation {
                    file: loc.file.map(std::string::ToString::to_string),
                    line: loc.line,
                    column: loc.column,
                });

                result.push(InlinedFrame { function, location });
            }
        }

        let resolved = if result.is_empty() {
            ResolvedFrame::unknown(pc)
        } else {
            ResolvedFrame { addr: pc, frames: result }
        };

        self.cache.borrow_mut().insert(pc, resolved.clone());
        resolved
    }
}

/// Used when no kernel image was given: every pc resolves to itself
#[derive(Debug, Default, Clone, Copy)]
pub struct AddressSymbolizer;

impl Symbolize for AddressSymbolizer {
    fn resolve(&self, pc: u64) -> ResolvedFrame {
        ResolvedFrame::unknown(pc)
    }

    fn describe(&self, pc: u64) -> String {
        format!("{pc:#x}")
    }
}

const UNKNOWN_FUNCTION: &str = "<unknown>";

/// A resolved pc (may contain multiple inlined frames)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFrame {
    /// Only meaningful for the innermost entry of the chain
    pub addr: u64,
    /// Innermost first
    pub frames: Vec<InlinedFrame>,
}

/// An inlined frame within a resolved frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlinedFrame {
    pub function: String,
    pub location: Option<SourceLocation>,
}

/// Source code location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl ResolvedFrame {
    fn unknown(addr: u64) -> Self {
        Self {
            addr,
            frames: vec![InlinedFrame { function: UNKNOWN_FUNCTION.to_string(), location: None }],
        }
    }

    /// Innermost function name
    #[must_use]
    pub fn function(&self) -> &str {
        self.frames.first().map_or(UNKNOWN_FUNCTION, |frame| frame.function.as_str())
    }

    #[must_use]
    pub fn is_known(&self) -> bool {
        self.function() != UNKNOWN_FUNCTION
    }

    /// `function at file:line`, or the bare address when nothing is known
    #[must_use]
    pub fn describe(&self) -> String {
        if !self.is_known() {
            return format!("{:#x}", self.addr);
        }
        let mut output = self.function().to_string();
        if let Some(loc) = self.frames.first().and_then(|frame| frame.location.as_ref()) {
            if let Some(ref file) = loc.file {
                output.push_str(&format!(" at {file}"));
                if let Some(line) = loc.line {
                    output.push_str(&format!(":{line}"));
                }
            }
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(function: &str, file: Option<&str>, line: Option<u32>) -> InlinedFrame {
        InlinedFrame {
            function: function.to_string(),
            location: Some(SourceLocation { file: file.map(str::to_string), line, column: None }),
        }
    }

    #[test]
    fn test_address_symbolizer_describes_hex() {
        let symbols = AddressSymbolizer;
        assert_eq!(symbols.describe(0xffff_8000_0010_2030), "0xffff800000102030");
        assert!(!symbols.resolve(0x10).is_known());
    }

    #[test]
    fn test_describe_uses_innermost_frame() {
        let resolved = ResolvedFrame {
            addr: 0x1000,
            frames: vec![
                frame("spin_lock", Some("include/linux/spinlock.h"), Some(310)),
                frame("dput", Some("fs/dcache.c"), Some(640)),
            ],
        };
        assert_eq!(resolved.function(), "spin_lock");
        assert_eq!(resolved.describe(), "spin_lock at include/linux/spinlock.h:310");
    }

    #[test]
    fn test_demangle_leaves_c_symbols() {
        assert_eq!(Symbolizer::demangle_symbol("do_sys_open"), "do_sys_open");
    }

    #[test]
    fn test_missing_image_is_an_error() {
        let err = Symbolizer::new("/nonexistent/vmlinux").err().unwrap();
        assert!(err.to_string().contains("/nonexistent/vmlinux"));
    }

    #[test]
    fn test_non_elf_image_names_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"not an elf image").unwrap();
        let err = Symbolizer::new(file.path()).err().unwrap();
        assert!(err.to_string().contains("is not an object file"));
    }
}
