//! Whole-log summary: record counts, machine description, per-cpu state at
//! the end of the log and object index statistics.

use mscan_common::{EntryKind, LabelClass, Payload, TraceEntry};

use crate::dispatch::{EntryHandler, ScanContext};
use crate::domain::{CpuId, ScanError};
use crate::export::JsonDict;

#[derive(Debug, Default)]
pub struct Summary {
    per_kind: [u64; EntryKind::ALL.len()],
    /// Accesses seen while the guest had tracing enabled
    enabled_accesses: u64,
    /// Enabled accesses on cpus whose counting was switched off
    uncounted_accesses: u64,
    traffic_accesses: u64,
    locked_accesses: u64,
    first_access_count: Option<u64>,
    last_access_count: u64,
}

impl Summary {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn count(&self, kind: EntryKind) -> u64 {
        self.per_kind[kind.index()]
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.per_kind.iter().sum()
    }
}

impl EntryHandler for Summary {
    fn name(&self) -> &'static str {
        "summary"
    }

    fn kinds(&self) -> &'static [EntryKind] {
        &EntryKind::ALL
    }

    fn handle(&mut self, entry: &TraceEntry, ctx: &ScanContext) -> Result<(), ScanError> {
        self.per_kind[entry.kind().index()] += 1;
        self.first_access_count.get_or_insert(entry.access_count());
        self.last_access_count = entry.access_count();

        if let Payload::Access(access) = &entry.payload {
            if ctx.run.enabled() {
                if ctx.run.counting(CpuId(entry.cpu())) {
                    self.enabled_accesses += 1;
                    self.traffic_accesses += u64::from(access.traffic);
                    self.locked_accesses += u64::from(access.lock);
                } else {
                    self.uncounted_accesses += 1;
                }
            }
        }
        Ok(())
    }

    fn exit(&mut self, out: &JsonDict, ctx: &ScanContext) -> Result<(), ScanError> {
        let dict = out.put_dict("summary")?;
        dict.put("entries", &self.total())?;

        let kinds = dict.put_dict("per-kind")?;
        for kind in EntryKind::ALL {
            kinds.put(kind.name(), &self.count(kind))?;
        }
        kinds.done()?;

        dict.put("first-access-count", &self.first_access_count)?;
        dict.put("last-access-count", &self.last_access_count)?;
        dict.put("enabled-accesses", &self.enabled_accesses)?;
        dict.put("uncounted-accesses", &self.uncounted_accesses)?;
        dict.put("traffic-accesses", &self.traffic_accesses)?;
        dict.put("locked-accesses", &self.locked_accesses)?;
        dict.put("record-mode", ctx.run.mode().map_or("unset", |mode| mode.as_str()))?;
        dict.put("enables", &ctx.run.enables())?;
        dict.put("live-tasks", &ctx.run.live_tasks())?;

        if let Some(machine) = ctx.run.machine() {
            let info = dict.put_dict("machine")?;
            info.put("ncpu", &machine.num_cpus)?;
            info.put("nram", &machine.num_ram)?;
            info.put("quantum", &machine.quantum)?;
            info.put("sample", &machine.sample)?;
            info.put("locked", &machine.locked)?;
            info.put("calls", &machine.calls)?;
            info.done()?;

            let cpus = dict.put_list("cpus")?;
            for cpu in (0..machine.num_cpus).map(CpuId) {
                let tid = ctx.run.running_tid(cpu);
                let state = cpus.append_dict()?;
                state.put("cpu", &cpu.0)?;
                state.put("tid", &tid)?;
                state.put("task", &tid.and_then(|tid| ctx.run.task(tid)).map(|task| task.name.as_str()))?;
                state.put("calls", &ctx.run.calls_enabled(cpu))?;
                state.put("counting", &ctx.run.counting(cpu))?;
                state.done()?;
            }
            cpus.done()?;
        }

        let objects = dict.put_dict("objects")?;
        objects.put("live", &ctx.objects.live_count())?;
        objects.put("overlaps", &ctx.objects.overlaps())?;
        objects.put("percpu-templates", &ctx.objects.templates().len())?;
        for class in LabelClass::ALL {
            let stats = ctx.objects.class_stats(class);
            let per_class = objects.put_dict(class.as_str())?;
            per_class.put("dynamic", &class.is_dynamic())?;
            per_class.put("live", &stats.live)?;
            per_class.put("added", &stats.added)?;
            per_class.put("removed", &stats.removed)?;
            per_class.put("misses", &stats.misses)?;
            per_class.done()?;
        }
        objects.done()?;
        dict.done()?;
        Ok(())
    }
}
