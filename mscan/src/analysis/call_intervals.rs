//! Call-interval timelines, streamed while the log is scanned.
//!
//! Each finished call (done transition, or still live at the end of the
//! log) is written out immediately and dropped, so memory only holds the
//! calls that are live at any one time.

use mscan_common::{EntryKind, Payload, TraceEntry};

use crate::callstack::{CallInterval, CallTimeline, IntervalIds, PerCallStack};
use crate::dispatch::{EntryHandler, ScanContext};
use crate::domain::{CpuId, ScanError, SerializeError};
use crate::export::{Hex, JsonDict, JsonList};

pub struct CallIntervals {
    stacks: PerCallStack<CallTimeline>,
    ids: IntervalIds,
    out: Option<JsonList>,
    emitted: u64,
}

impl CallIntervals {
    #[must_use]
    pub fn new() -> Self {
        Self { stacks: PerCallStack::new(), ids: IntervalIds::default(), out: None, emitted: 0 }
    }

    /// Calls written so far
    #[must_use]
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    fn emit(&mut self, timeline: &CallTimeline, ctx: &ScanContext) -> Result<(), SerializeError> {
        let Some(list) = self.out.as_ref() else {
            return Ok(());
        };
        self.emitted += 1;

        let call = list.append_dict()?;
        call.put("tag", &Hex(timeline.tag.0))?;
        call.put("tid", &timeline.tid)?;
        if let Some(task) = ctx.run.task(timeline.tid) {
            call.put("task", &task.name)?;
        }
        call.put("pc", &Hex(timeline.start_pc))?;
        call.put("info", &ctx.symbols.describe(timeline.start_pc))?;

        let intervals = call.put_list("intervals")?;
        for interval in timeline.intervals() {
            write_interval(&intervals, interval)?;
        }
        intervals.done()?;
        call.done()
    }
}

impl Default for CallIntervals {
    fn default() -> Self {
        Self::new()
    }
}

fn write_interval(list: &JsonList, interval: &CallInterval) -> Result<(), SerializeError> {
    let dict = list.append_dict()?;
    dict.put("id", &interval.id.0)?;
    dict.put("cpu", &interval.cpu.0)?;
    dict.put("start-pc", &Hex(interval.start_pc))?;
    dict.put("end-pc", &Hex(interval.end_pc))?;
    dict.put("access-start", &interval.access_start)?;
    dict.put("access-end", &interval.access_end)?;
    dict.put("prev", &interval.prev.map(|id| id.0))?;
    dict.put("next", &interval.next.map(|id| id.0))?;
    dict.put("return-target", &interval.return_target.map(|id| id.0))?;
    dict.done()
}

impl EntryHandler for CallIntervals {
    fn name(&self) -> &'static str {
        "call-intervals"
    }

    fn kinds(&self) -> &'static [EntryKind] {
        &[EntryKind::Machine, EntryKind::Fcall, EntryKind::Call]
    }

    fn init(&mut self, out: &JsonDict) -> Result<(), ScanError> {
        self.out = Some(out.put_list("call-intervals")?);
        Ok(())
    }

    fn handle(&mut self, entry: &TraceEntry, ctx: &ScanContext) -> Result<(), ScanError> {
        match &entry.payload {
            Payload::Machine(machine) => self.stacks.set_num_cpus(machine.num_cpus),
            Payload::Fcall(fcall) => {
                if let Some(timeline) = self.stacks.handle(&entry.header, fcall, &mut self.ids)? {
                    self.emit(&timeline, ctx)?;
                }
            }
            Payload::Call(call) => {
                if let Some(timeline) = self.stacks.current_mut(CpuId(entry.cpu())) {
                    timeline.on_call(&entry.header, call, &mut self.ids);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn exit(&mut self, _out: &JsonDict, ctx: &ScanContext) -> Result<(), ScanError> {
        let live = self.stacks.flush(ctx.run.last_access_count(), &mut self.ids);
        if !live.is_empty() {
            log::info!("{} calls still live at end of log", live.len());
        }
        for timeline in &live {
            self.emit(timeline, ctx)?;
        }
        if let Some(list) = self.out.take() {
            list.done()?;
        }
        log::debug!("{} calls, {} intervals", self.emitted, self.ids.allocated());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::JsonStream;
    use mscan_common::{CallEntry, CallState, FcallEntry, MachineEntry};

    fn fcall(cpu: u16, ac: u64, tag: u64, state: CallState) -> TraceEntry {
        TraceEntry::new(
            cpu,
            ac,
            ac,
            Payload::Fcall(FcallEntry { tid: 9, pc: 0x100 + ac, tag, depth: 0, state }),
        )
    }

    fn run(handler: &mut CallIntervals, entries: &[TraceEntry]) -> Result<(), ScanError> {
        let mut ctx = ScanContext::default();
        let stream = JsonStream::new(Vec::new())?;
        let root = stream.root();
        handler.init(&root)?;
        for entry in entries {
            ctx.apply(entry)?;
            handler.handle(entry, &ctx)?;
        }
        handler.exit(&root, &ctx)?;
        root.done()?;
        stream.finish()?;
        Ok(())
    }

    #[test]
    fn test_done_and_live_calls_are_emitted() {
        let mut handler = CallIntervals::new();
        let entries = [
            fcall(0, 1, 0xa, CallState::Start),
            TraceEntry::new(
                0,
                2,
                2,
                Payload::Call(CallEntry { target_pc: 0x500, return_pc: 0x104, ret: false }),
            ),
            fcall(0, 3, 0xa, CallState::Pause),
            fcall(0, 4, 0xb, CallState::Start),
            fcall(0, 5, 0xb, CallState::Done),
        ];
        run(&mut handler, &entries).unwrap();
        assert_eq!(handler.emitted(), 2);
        assert!(handler.stacks.is_empty());
        assert_eq!(handler.ids.allocated(), 3);
    }

    #[test]
    fn test_cpu_beyond_machine_count_is_fatal() {
        let mut handler = CallIntervals::new();
        let machine = TraceEntry::new(
            0,
            0,
            0,
            Payload::Machine(MachineEntry {
                num_cpus: 2,
                num_ram: 1 << 30,
                quantum: 0,
                sample: 0,
                locked: true,
                calls: true,
            }),
        );
        let err = run(&mut handler, &[machine, fcall(5, 1, 0xa, CallState::Start)]).unwrap_err();
        assert!(matches!(err, ScanError::CallStack(_)));
    }
}
