use std::collections::BTreeMap;

use log::{debug, warn};
use mscan_common::{LabelClass, LabelEntry, SegmentEntry};

use crate::domain::{LabelError, ObjectId};

/// Default number of overlapping labels tolerated before a scan aborts
pub const DEFAULT_OVERLAP_LIMIT: u64 = 20;

/// Default number of unmatched removals tolerated per label class
pub const DEFAULT_MISS_LIMIT: u64 = 200;

/// Default cache-line size used by [`ObjectIndex::cacheline_lookup`]
pub const DEFAULT_CACHELINE: u64 = 64;

/// One live object: `[start, end)` in guest memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledObject {
    pub id: ObjectId,
    pub name: String,
    pub class: LabelClass,
    pub start: u64,
    pub end: u64,
    /// Allocation call site, zero for symbols
    pub alloc_pc: u64,
    /// Log position of the allocation, zero for symbols
    pub access_count: u64,
}

impl LabeledObject {
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// A per-cpu variable waiting for a segment record to give it a base
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerCpuTemplate {
    pub name: String,
    /// Offset inside the per-cpu area
    pub offset: u64,
    pub bytes: u64,
    pub pc: u64,
}

/// Tolerance thresholds for the index
#[derive(Debug, Clone, Copy)]
pub struct IndexLimits {
    /// Overlapping inserts tolerated across all classes
    pub overlaps: u64,
    /// Unmatched removals tolerated per class
    pub misses_per_class: u64,
    /// Cache-line size in bytes, a power of two
    pub cacheline: u64,
}

impl Default for IndexLimits {
    fn default() -> Self {
        Self {
            overlaps: DEFAULT_OVERLAP_LIMIT,
            misses_per_class: DEFAULT_MISS_LIMIT,
            cacheline: DEFAULT_CACHELINE,
        }
    }
}

/// Counters for one label class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassStats {
    pub live: usize,
    pub added: u64,
    pub removed: u64,
    pub misses: u64,
}

#[derive(Debug, Default)]
struct ClassMap {
    /// Live intervals keyed by start address; disjoint by construction
    live: BTreeMap<u64, LabeledObject>,
    added: u64,
    removed: u64,
    misses: u64,
}

impl ClassMap {
    fn overlapping(&self, start: u64, end: u64) -> Option<&LabeledObject> {
        self.live.range(..end).next_back().map(|(_, obj)| obj).filter(|obj| obj.end > start)
    }

    fn lookup(&self, addr: u64) -> Option<&LabeledObject> {
        self.live.range(..=addr).next_back().map(|(_, obj)| obj).filter(|obj| obj.contains(addr))
    }
}

/// Live object bindings, one interval map per label class
///
/// Heap and block objects come and go with allocations; static and per-cpu
/// objects are loaded once and live for the whole run. Lookups prefer the
/// dynamic classes.
#[derive(Debug)]
pub struct ObjectIndex {
    classes: [ClassMap; 4],
    templates: Vec<PerCpuTemplate>,
    limits: IndexLimits,
    overlaps: u64,
    next_id: u64,
}

impl Default for ObjectIndex {
    fn default() -> Self {
        Self::new(IndexLimits::default())
    }
}

impl ObjectIndex {
    #[must_use]
    pub fn new(limits: IndexLimits) -> Self {
        Self {
            classes: Default::default(),
            templates: Vec::new(),
            limits,
            overlaps: 0,
            next_id: 1,
        }
    }

    /// Route a label record: per-cpu allocations become templates, zero-sized
    /// labels retire objects, everything else is added.
    ///
    /// # Errors
    /// Returns a [`LabelError`] once a tolerance threshold is crossed
    pub fn apply_label(&mut self, label: &LabelEntry, access_count: u64) -> Result<(), LabelError> {
        if label.is_removal() {
            self.remove(label, access_count)?;
        } else if label.class == LabelClass::PerCpu {
            self.add_template(PerCpuTemplate {
                name: label.name.clone(),
                offset: label.guest_addr,
                bytes: label.bytes,
                pc: label.pc,
            });
        } else {
            self.add(label, access_count)?;
        }
        Ok(())
    }

    /// Insert `[guest_addr, guest_addr + bytes)` into the label's class
    ///
    /// An insert that overlaps a live object of the same class is dropped
    /// and the existing object stays. Returns the new object's id, or `None`
    /// if it was dropped.
    ///
    /// # Errors
    /// Returns [`LabelError::TooManyOverlaps`] once more overlaps than the
    /// configured limit have been seen
    pub fn add(
        &mut self,
        label: &LabelEntry,
        access_count: u64,
    ) -> Result<Option<ObjectId>, LabelError> {
        if label.bytes == 0 {
            debug!("ignoring zero-sized add of {} at {:#x}", label.name, label.guest_addr);
            return Ok(None);
        }
        let inserted = self.try_insert(
            label.class,
            &label.name,
            label.guest_addr,
            label.bytes,
            label.pc,
            access_count,
        );
        if inserted.is_none() {
            self.record_overlap(label.class, &label.name, label.guest_addr, access_count)?;
        }
        Ok(inserted)
    }

    /// Retire the live object starting at `label.guest_addr`
    ///
    /// # Errors
    /// Returns [`LabelError::TooManyMisses`] once a class has seen more
    /// unmatched removals than the configured limit
    pub fn remove(
        &mut self,
        label: &LabelEntry,
        access_count: u64,
    ) -> Result<Option<LabeledObject>, LabelError> {
        let limit = self.limits.misses_per_class;
        let map = &mut self.classes[label.class.index()];

        if let Some(obj) = map.live.remove(&label.guest_addr) {
            map.removed += 1;
            return Ok(Some(obj));
        }

        // Frees of objects allocated before tracing began are expected
        map.misses += 1;
        debug!(
            "{} removal at {:#x} matched no live object ({} so far)",
            label.class.as_str(),
            label.guest_addr,
            map.misses
        );
        if map.misses > limit {
            return Err(LabelError::TooManyMisses {
                class: label.class.as_str(),
                addr: label.guest_addr,
                access_count,
                count: map.misses,
            });
        }
        Ok(None)
    }

    /// Insert a static symbol; overlapping symbols (aliases) are skipped quietly
    pub fn add_static(&mut self, name: &str, addr: u64, bytes: u64) -> Option<ObjectId> {
        if bytes == 0 {
            return None;
        }
        let inserted = self.try_insert(LabelClass::Static, name, addr, bytes, 0, 0);
        if inserted.is_none() {
            debug!("static symbol {name} at {addr:#x} overlaps an earlier symbol");
        }
        inserted
    }

    pub fn add_template(&mut self, template: PerCpuTemplate) {
        self.templates.push(template);
    }

    #[must_use]
    pub fn templates(&self) -> &[PerCpuTemplate] {
        &self.templates
    }

    /// Materialize every per-cpu template at `seg.base + offset`
    ///
    /// Returns the number of objects created.
    ///
    /// # Errors
    /// Returns [`LabelError::SegmentOverflow`] if a template ends past
    /// `seg.end`, or [`LabelError::UnsupportedSegment`] for a non per-cpu
    /// segment
    pub fn apply_segment(
        &mut self,
        seg: &SegmentEntry,
        access_count: u64,
    ) -> Result<usize, LabelError> {
        if seg.class != LabelClass::PerCpu {
            return Err(LabelError::UnsupportedSegment(seg.class.as_str()));
        }

        let templates = std::mem::take(&mut self.templates);
        let mut created = 0;
        let mut result = Ok(());
        for template in &templates {
            let start = seg.base.saturating_add(template.offset);
            if start.saturating_add(template.bytes) > seg.end {
                result = Err(LabelError::SegmentOverflow {
                    name: template.name.clone(),
                    offset: template.offset,
                    bytes: template.bytes,
                    end: seg.end,
                });
                break;
            }
            let inserted = self.try_insert(
                LabelClass::PerCpu,
                &template.name,
                start,
                template.bytes,
                template.pc,
                access_count,
            );
            match inserted {
                Some(_) => created += 1,
                None => {
                    if let Err(e) =
                        self.record_overlap(LabelClass::PerCpu, &template.name, start, access_count)
                    {
                        result = Err(e);
                        break;
                    }
                }
            }
        }
        self.templates = templates;
        result.map(|()| created)
    }

    /// The object containing `addr`, dynamic classes first
    #[must_use]
    pub fn point_lookup(&self, addr: u64) -> Option<&LabeledObject> {
        LabelClass::ALL.iter().find_map(|class| self.classes[class.index()].lookup(addr))
    }

    /// Every live object overlapping the cache line holding `addr`, ordered by start
    #[must_use]
    pub fn cacheline_lookup(&self, addr: u64) -> Vec<&LabeledObject> {
        let line_start = addr & !(self.limits.cacheline - 1);
        let line_end = line_start.saturating_add(self.limits.cacheline);

        let mut found: Vec<&LabeledObject> = self
            .classes
            .iter()
            .flat_map(|map| {
                // Ends are sorted like starts, so walk back until objects end before the line
                map.live.range(..line_end).rev().map(|(_, obj)| obj).take_while(|obj| obj.end > line_start)
            })
            .collect();
        found.sort_by_key(|obj| (obj.start, obj.class));
        found
    }

    #[must_use]
    pub fn class_stats(&self, class: LabelClass) -> ClassStats {
        let map = &self.classes[class.index()];
        ClassStats { live: map.live.len(), added: map.added, removed: map.removed, misses: map.misses }
    }

    /// Overlapping inserts dropped so far
    #[must_use]
    pub fn overlaps(&self) -> u64 {
        self.overlaps
    }

    /// Live objects across all classes
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.classes.iter().map(|map| map.live.len()).sum()
    }

    fn try_insert(
        &mut self,
        class: LabelClass,
        name: &str,
        start: u64,
        bytes: u64,
        alloc_pc: u64,
        access_count: u64,
    ) -> Option<ObjectId> {
        let end = start.saturating_add(bytes);
        let map = &mut self.classes[class.index()];
        if let Some(existing) = map.overlapping(start, end) {
            debug!(
                "{name} [{start:#x}, {end:#x}) overlaps {} [{:#x}, {:#x})",
                existing.name, existing.start, existing.end
            );
            return None;
        }

        let id = ObjectId(self.next_id);
        self.next_id += 1;
        map.added += 1;
        map.live.insert(
            start,
            LabeledObject { id, name: name.to_string(), class, start, end, alloc_pc, access_count },
        );
        Some(id)
    }

    fn record_overlap(
        &mut self,
        class: LabelClass,
        name: &str,
        addr: u64,
        access_count: u64,
    ) -> Result<(), LabelError> {
        self.overlaps += 1;
        warn!(
            "dropping {} label {name} at {addr:#x}: overlaps a live object (access {access_count})",
            class.as_str()
        );
        if self.overlaps > self.limits.overlaps {
            return Err(LabelError::TooManyOverlaps {
                class: class.as_str(),
                name: name.to_string(),
                addr,
                access_count,
                count: self.overlaps,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label(class: LabelClass, name: &str, addr: u64, bytes: u64) -> LabelEntry {
        LabelEntry {
            host_addr: 0,
            class,
            name: name.to_string(),
            guest_addr: addr,
            bytes,
            pc: 0xffff_ffff_8100_0000,
        }
    }

    #[test]
    fn test_point_lookup_and_remove() {
        let mut index = ObjectIndex::default();
        index.apply_label(&label(LabelClass::Heap, "obj1", 0x1000, 64), 1).unwrap();

        let obj = index.point_lookup(0x1010).unwrap();
        assert_eq!(obj.name, "obj1");
        assert_eq!(obj.id, ObjectId(1));
        assert!(index.point_lookup(0x1040).is_none(), "end is exclusive");

        index.apply_label(&label(LabelClass::Heap, "obj1", 0x1000, 0), 2).unwrap();
        assert!(index.point_lookup(0x1010).is_none());
        assert_eq!(index.class_stats(LabelClass::Heap).removed, 1);
    }

    #[test]
    fn test_dynamic_classes_win() {
        let mut index = ObjectIndex::default();
        index.add_static("big_static", 0x1000, 0x1000);
        index.add(&label(LabelClass::Block, "page", 0x1800, 0x100), 1).unwrap();

        assert_eq!(index.point_lookup(0x1810).unwrap().name, "page");
        assert_eq!(index.point_lookup(0x1010).unwrap().name, "big_static");
    }

    #[test]
    fn test_overlap_keeps_first() {
        let mut index = ObjectIndex::default();
        assert!(index.add(&label(LabelClass::Heap, "first", 0x1000, 32), 1).unwrap().is_some());
        assert!(index.add(&label(LabelClass::Heap, "second", 0x1010, 32), 2).unwrap().is_none());
        assert!(index.add(&label(LabelClass::Heap, "third", 0xff0, 0x20), 3).unwrap().is_none());

        assert_eq!(index.point_lookup(0x1018).unwrap().name, "first");
        assert_eq!(index.overlaps(), 2);
    }

    #[test]
    fn test_too_many_overlaps() {
        let limits = IndexLimits { overlaps: 2, ..IndexLimits::default() };
        let mut index = ObjectIndex::new(limits);
        index.add(&label(LabelClass::Heap, "a", 0x1000, 32), 1).unwrap();
        index.add(&label(LabelClass::Heap, "b", 0x1000, 32), 2).unwrap();
        index.add(&label(LabelClass::Heap, "c", 0x1000, 32), 3).unwrap();
        let err = index.add(&label(LabelClass::Heap, "d", 0x1000, 32), 4).unwrap_err();
        assert!(matches!(err, LabelError::TooManyOverlaps { count: 3, .. }));
    }

    #[test]
    fn test_removal_misses_are_bounded_per_class() {
        let limits = IndexLimits { misses_per_class: 2, ..IndexLimits::default() };
        let mut index = ObjectIndex::new(limits);
        for i in 0..2 {
            assert!(index.remove(&label(LabelClass::Heap, "x", 0x100 * i, 0), i).unwrap().is_none());
        }
        // A different class has its own budget
        index.remove(&label(LabelClass::Block, "x", 0x100, 0), 3).unwrap();

        let err = index.remove(&label(LabelClass::Heap, "x", 0x900, 0), 4).unwrap_err();
        assert!(matches!(err, LabelError::TooManyMisses { class: "heap", count: 3, .. }));
    }

    #[test]
    fn test_cacheline_lookup() {
        let mut index = ObjectIndex::default();
        index.add(&label(LabelClass::Heap, "before", 0x0f00, 0x100), 1).unwrap();
        index.add(&label(LabelClass::Heap, "spans", 0x1030, 0x20), 2).unwrap();
        index.add(&label(LabelClass::Heap, "inside", 0x1010, 0x8), 3).unwrap();
        index.add(&label(LabelClass::Heap, "after", 0x1040, 0x10), 4).unwrap();
        index.add_static("static_head", 0x0ff8, 0x10);

        let names: Vec<_> =
            index.cacheline_lookup(0x1020).into_iter().map(|obj| obj.name.as_str()).collect();
        assert_eq!(names, vec!["static_head", "inside", "spans"]);
    }

    #[test]
    fn test_cacheline_lookup_whole_line_and_neighbours() {
        let mut index = ObjectIndex::default();
        let line_base = 0x1000;
        let line = DEFAULT_CACHELINE;

        index.add(&label(LabelClass::Heap, "prev_line", 0x0f00, 0x100), 1).unwrap();
        index.add_static("straddles_in", 0x0ff0, 0x20).unwrap();
        index.add(&label(LabelClass::Block, "middle", 0x1018, 0x8), 2).unwrap();
        index.add(&label(LabelClass::Heap, "straddles_out", 0x1038, 0x10), 3).unwrap();
        index.add(&label(LabelClass::Heap, "next_line", 0x1048, 0x8), 4).unwrap();

        let names = |addr: u64| -> Vec<String> {
            index.cacheline_lookup(addr).into_iter().map(|obj| obj.name.clone()).collect()
        };

        for offset in 0..line {
            assert_eq!(
                names(line_base + offset),
                vec!["straddles_in", "middle", "straddles_out"],
                "offset {offset:#x}"
            );
        }
        assert_eq!(names(line_base - 1), vec!["prev_line", "straddles_in"]);
        assert_eq!(names(line_base + line), vec!["straddles_out", "next_line"]);
    }

    #[test]
    fn test_segment_materializes_templates() {
        let mut index = ObjectIndex::default();
        index.apply_label(&label(LabelClass::PerCpu, "runqueue", 0x40, 0x80), 1).unwrap();
        assert_eq!(index.templates().len(), 1);

        let seg = SegmentEntry { base: 0x10_0000, end: 0x10_1000, class: LabelClass::PerCpu };
        assert_eq!(index.apply_segment(&seg, 2).unwrap(), 1);
        let seg = SegmentEntry { base: 0x20_0000, end: 0x20_1000, class: LabelClass::PerCpu };
        assert_eq!(index.apply_segment(&seg, 3).unwrap(), 1);

        let obj = index.point_lookup(0x20_0050).unwrap();
        assert_eq!(obj.name, "runqueue");
        assert_eq!(obj.class, LabelClass::PerCpu);
        assert_eq!(index.class_stats(LabelClass::PerCpu).live, 2);
    }

    #[test]
    fn test_segment_overflow() {
        let mut index = ObjectIndex::default();
        index.add_template(PerCpuTemplate {
            name: "too_big".to_string(),
            offset: 0xf00,
            bytes: 0x200,
            pc: 0,
        });
        let seg = SegmentEntry { base: 0x1000, end: 0x2000, class: LabelClass::PerCpu };
        let err = index.apply_segment(&seg, 1).unwrap_err();
        assert!(matches!(err, LabelError::SegmentOverflow { .. }));
    }
}
