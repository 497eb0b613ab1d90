use mscan_common::{Payload, TraceEntry};

use super::run_state::RunState;
use crate::domain::ScanError;
use crate::objects::{IndexLimits, ObjectIndex};
use crate::symbolization::{AddressSymbolizer, OffsetTypeResolver, Symbolize, TypeResolver};

/// State shared by every analysis during a scan
///
/// The dispatcher applies each record here before handing it to the
/// analyses, so handlers always see the object index and run state as of
/// the record they are handling.
pub struct ScanContext {
    pub run: RunState,
    pub objects: ObjectIndex,
    pub symbols: Box<dyn Symbolize>,
    pub types: Box<dyn TypeResolver>,
    /// Whether label and segment records reach the object index
    track_objects: bool,
}

impl ScanContext {
    /// Context with address-only symbolization
    #[must_use]
    pub fn new(limits: IndexLimits) -> Self {
        Self {
            run: RunState::default(),
            objects: ObjectIndex::new(limits),
            symbols: Box::new(AddressSymbolizer),
            types: Box::new(OffsetTypeResolver),
            track_objects: true,
        }
    }

    /// Leave the object index alone; label and segment records are only
    /// counted and passed on
    #[must_use]
    pub fn without_objects(mut self) -> Self {
        self.track_objects = false;
        self
    }

    #[must_use]
    pub fn with_symbols(mut self, symbols: Box<dyn Symbolize>) -> Self {
        self.symbols = symbols;
        self
    }

    /// Fold one record into the shared state
    ///
    /// # Errors
    /// Returns a [`ScanError::Label`] when the object index gives up on the
    /// label stream, or a [`ScanError::Decode`] for an impossible host record
    pub fn apply(&mut self, entry: &TraceEntry) -> Result<(), ScanError> {
        self.run.apply(entry)?;
        if !self.track_objects {
            return Ok(());
        }
        match &entry.payload {
            Payload::Label(label) => self.objects.apply_label(label, entry.access_count())?,
            Payload::Segment(segment) => {
                let created = self.objects.apply_segment(segment, entry.access_count())?;
                log::debug!(
                    "segment {:#x}..{:#x}: {created} per-cpu objects",
                    segment.base,
                    segment.end
                );
            }
            _ => {}
        }
        Ok(())
    }

    /// Describe the object field at `addr`, or the bare address if no object owns it
    #[must_use]
    pub fn describe_addr(&self, addr: u64, pc_hint: u64) -> String {
        match self.objects.point_lookup(addr) {
            Some(obj) => self.types.describe(&obj.name, obj.start, addr - obj.start, pc_hint),
            None => format!("{addr:#x}"),
        }
    }

    /// Names of the other objects sharing the cache line that holds `addr`
    #[must_use]
    pub fn line_sharers(&self, addr: u64) -> Vec<String> {
        let owner = self.objects.point_lookup(addr).map(|obj| obj.id);
        self.objects
            .cacheline_lookup(addr)
            .into_iter()
            .filter(|obj| Some(obj.id) != owner)
            .map(|obj| obj.name.clone())
            .collect()
    }
}

impl Default for ScanContext {
    fn default() -> Self {
        Self::new(IndexLimits::default())
    }
}
