//! Serial-section analysis: where the guest serializes on locks.
//!
//! Every completed critical section from the [`LockTracker`] is folded into
//! a per-lock summary. At the end of the scan locks are reported by total
//! hold time, longest first.
//!
//! # Output
//!
//! ```text
//! "serial-sections": {
//!   "release-misses": 0, "acquired-misses": 0,
//!   "locks": [
//!     { "name": "dcache_lock", "lock": "0xffff...", "addr": "struct dentry+0x58",
//!       "cacheline-sharers": ["dentry_hashtable"],
//!       "section-type": "lock", "acquires": 120, "read-acquires": 0,
//!       "spin-cycles": 900, "hold-cycles": 45000,
//!       "per-cpu-percent": [50.0, 50.0],
//!       "coherence-miss": 12, "locked-inst": 240,
//!       "per-acquire-pc": [ { "pc": "0x...", "info": "d_alloc at fs/dcache.c:1210", "acquires": 80 } ] }
//!   ]
//! }
//! ```
//!
//! Only sections while the guest has tracing enabled are considered.

// Percentages intentionally convert cycle counts to f64
#![allow(clippy::cast_precision_loss)]

use std::collections::BTreeMap;

use mscan_common::{EntryKind, Payload, TraceEntry};

use crate::dispatch::{EntryHandler, ScanContext};
use crate::domain::{CpuId, Cycles, LockId, ScanError};
use crate::export::{Hex, JsonDict};
use crate::locks::{CriticalSection, LockLimits, LockTracker};

// =============================================================================
// PER-LOCK SUMMARY
// =============================================================================

/// Aggregate of every critical section of one lock
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LockSummary {
    pub lock: LockId,
    pub name: String,
    /// Field the lock lives in, resolved when the first section completed
    pub location: String,
    /// Other objects on the lock's cache line at that point
    pub line_sharers: Vec<String>,
    pub acquires: u64,
    pub read_acquires: u64,
    pub spin: Cycles,
    pub hold: Cycles,
    pub locked_inst: u64,
    pub coherence_miss: u64,
    pub per_cpu_hold: BTreeMap<CpuId, Cycles>,
    pub per_pc: BTreeMap<u64, u64>,
}

impl LockSummary {
    fn add(&mut self, section: &CriticalSection) {
        self.acquires += 1;
        self.read_acquires += u64::from(section.read);
        self.spin += section.spin_time();
        self.hold += section.hold_time();
        self.locked_inst += section.locked_access_count;
        self.coherence_miss += section.traffic_access_count;
        *self.per_cpu_hold.entry(section.start_cpu).or_default() += section.hold_time();
        *self.per_pc.entry(section.pc).or_default() += 1;
    }

    /// Share of hold time per cpu, `num_cpus` entries
    #[must_use]
    pub fn per_cpu_percent(&self, num_cpus: usize) -> Vec<f64> {
        let total = self.hold.0;
        (0..num_cpus)
            .map(|cpu| {
                let cpu = CpuId(u16::try_from(cpu).unwrap_or(u16::MAX));
                let held = self.per_cpu_hold.get(&cpu).map_or(0, |c| c.0);
                if total == 0 {
                    0.0
                } else {
                    held as f64 * 100.0 / total as f64
                }
            })
            .collect()
    }
}

// =============================================================================
// HANDLER
// =============================================================================

pub struct SerialSections {
    tracker: LockTracker,
    locks: BTreeMap<LockId, LockSummary>,
    /// Highest cpu seen, for sizing per-cpu tables without a machine record
    max_cpu: u16,
}

impl SerialSections {
    #[must_use]
    pub fn new(limits: LockLimits) -> Self {
        Self { tracker: LockTracker::new(limits), locks: BTreeMap::new(), max_cpu: 0 }
    }

    fn on_section(&mut self, section: &CriticalSection, ctx: &ScanContext) {
        let summary = self.locks.entry(section.lock).or_insert_with(|| LockSummary {
            lock: section.lock,
            name: section.lock_name.clone(),
            location: ctx.describe_addr(section.lock.0, section.pc),
            line_sharers: ctx.line_sharers(section.lock.0),
            ..LockSummary::default()
        });
        summary.add(section);
    }

    /// Locks seen so far, longest total hold first
    #[must_use]
    pub fn ranked(&self) -> Vec<&LockSummary> {
        let mut ranked: Vec<&LockSummary> = self.locks.values().collect();
        ranked.sort_by(|a, b| b.hold.cmp(&a.hold).then(a.lock.cmp(&b.lock)));
        ranked
    }
}

impl Default for SerialSections {
    fn default() -> Self {
        Self::new(LockLimits::default())
    }
}

impl EntryHandler for SerialSections {
    fn name(&self) -> &'static str {
        "serial-sections"
    }

    fn kinds(&self) -> &'static [EntryKind] {
        &[EntryKind::Lock, EntryKind::Access]
    }

    fn handle(&mut self, entry: &TraceEntry, ctx: &ScanContext) -> Result<(), ScanError> {
        if !ctx.run.enabled() {
            return Ok(());
        }
        self.max_cpu = self.max_cpu.max(entry.cpu());

        match &entry.payload {
            Payload::Lock(lock) => {
                if let Some(section) = self.tracker.handle(&entry.header, lock)? {
                    self.on_section(&section, ctx);
                }
            }
            Payload::Access(access) => {
                self.tracker.on_access(access);
            }
            _ => {}
        }
        Ok(())
    }

    fn exit(&mut self, out: &JsonDict, ctx: &ScanContext) -> Result<(), ScanError> {
        let num_cpus = ctx.run.num_cpus().map_or(usize::from(self.max_cpu) + 1, usize::from);
        if self.tracker.innermost().is_some() {
            log::warn!("{} locks still held at end of log", self.tracker.held().count());
        }

        let dict = out.put_dict("serial-sections")?;
        dict.put("release-misses", &self.tracker.release_misses())?;
        dict.put("acquired-misses", &self.tracker.acquired_misses())?;

        let list = dict.put_list("locks")?;
        for summary in self.ranked() {
            let entry = list.append_dict()?;
            entry.put("name", &summary.name)?;
            entry.put("lock", &Hex(summary.lock.0))?;
            entry.put("addr", &summary.location)?;
            let sharers = entry.put_list("cacheline-sharers")?;
            for name in &summary.line_sharers {
                sharers.append(name)?;
            }
            sharers.done()?;
            entry.put("section-type", "lock")?;
            entry.put("acquires", &summary.acquires)?;
            entry.put("read-acquires", &summary.read_acquires)?;
            entry.put("spin-cycles", &summary.spin.0)?;
            entry.put("hold-cycles", &summary.hold.0)?;
            entry.put("per-cpu-percent", &summary.per_cpu_percent(num_cpus))?;
            entry.put("coherence-miss", &summary.coherence_miss)?;
            entry.put("locked-inst", &summary.locked_inst)?;

            let pcs = entry.put_list("per-acquire-pc")?;
            let mut per_pc: Vec<(&u64, &u64)> = summary.per_pc.iter().collect();
            per_pc.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
            for (&pc, &acquires) in per_pc {
                let pc_dict = pcs.append_dict()?;
                pc_dict.put("pc", &Hex(pc))?;
                pc_dict.put("info", &ctx.symbols.describe(pc))?;
                pc_dict.put("acquires", &acquires)?;
                pc_dict.done()?;
            }
            pcs.done()?;
            entry.done()?;
        }
        list.done()?;
        dict.done()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::JsonStream;
    use mscan_common::{
        AccessEntry, AccessType, HostEntry, HostType, LabelClass, LabelEntry, LockEntry, LockOp,
        RecordMode,
    };

    fn enable(on: bool) -> TraceEntry {
        let mode = if on { RecordMode::Movement } else { RecordMode::Disable };
        TraceEntry::new(
            0,
            0,
            0,
            Payload::Host(HostEntry {
                host_type: HostType::AccessAllCpu,
                mode,
                call_cpu: 0,
                label: String::new(),
            }),
        )
    }

    fn lock(cpu: u16, ts: u64, op: LockOp) -> TraceEntry {
        TraceEntry::new(
            cpu,
            ts,
            ts,
            Payload::Lock(LockEntry {
                pc: 0x8000 + u64::from(cpu),
                lock: 0x1058,
                name: "d_lock".to_string(),
                op,
                read: false,
            }),
        )
    }

    fn traffic(cpu: u16) -> TraceEntry {
        TraceEntry::new(
            cpu,
            0,
            0,
            Payload::Access(AccessEntry {
                access_type: AccessType::Store,
                pc: 0x9000,
                host_addr: 0,
                guest_addr: 0x1060,
                bytes: 8,
                traffic: true,
                lock: false,
            }),
        )
    }

    fn feed(ctx: &mut ScanContext, handler: &mut SerialSections, entry: &TraceEntry) {
        ctx.apply(entry).unwrap();
        if handler.kinds().contains(&entry.kind()) {
            handler.handle(entry, ctx).unwrap();
        }
    }

    #[test]
    fn test_sections_aggregate_per_lock() {
        let mut ctx = ScanContext::default();
        let mut handler = SerialSections::default();
        let dentry = TraceEntry::new(
            0,
            0,
            0,
            Payload::Label(LabelEntry {
                host_addr: 0,
                class: LabelClass::Heap,
                name: "struct dentry".to_string(),
                guest_addr: 0x1000,
                bytes: 0x100,
                pc: 0,
            }),
        );

        ctx.objects.add_static("dentry_hashtable", 0x1070, 8).unwrap();
        for entry in [
            dentry,
            enable(true),
            lock(0, 10, LockOp::Acquire),
            lock(0, 15, LockOp::Acquired),
            traffic(0),
            lock(0, 40, LockOp::Release),
            lock(1, 50, LockOp::Acquire),
            lock(1, 50, LockOp::Acquired),
            lock(1, 60, LockOp::Release),
            enable(false),
            lock(1, 70, LockOp::Acquire),
        ] {
            feed(&mut ctx, &mut handler, &entry);
        }

        let ranked = handler.ranked();
        assert_eq!(ranked.len(), 1);
        let summary = ranked[0];
        assert_eq!(summary.acquires, 2);
        assert_eq!(summary.spin, Cycles(5));
        assert_eq!(summary.hold, Cycles(35));
        assert_eq!(summary.coherence_miss, 1);
        assert_eq!(summary.location, "struct dentry+0x58");
        assert_eq!(summary.line_sharers, vec!["dentry_hashtable"]);
        assert_eq!(summary.per_pc.len(), 2);
        assert_eq!(handler.tracker.innermost(), None, "acquire while disabled is ignored");

        let percent = summary.per_cpu_percent(2);
        assert!((percent[0] - 25.0 / 35.0 * 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_exit_renders_report() {
        let mut ctx = ScanContext::default();
        let mut handler = SerialSections::default();
        for entry in [enable(true), lock(0, 1, LockOp::Acquire), lock(0, 9, LockOp::Release)] {
            feed(&mut ctx, &mut handler, &entry);
        }

        let stream = JsonStream::new(Vec::new()).unwrap();
        let root = stream.root();
        handler.exit(&root, &ctx).unwrap();
        root.done().unwrap();
        stream.finish().unwrap();
    }
}
