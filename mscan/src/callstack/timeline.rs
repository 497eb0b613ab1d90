use mscan_common::{CallEntry, EntryHeader, FcallEntry};

use super::per_call_stack::{CallRecord, Transition};
use crate::domain::{CallTag, CpuId, IntervalId};

/// Hands out run-unique interval ids starting at 1
#[derive(Debug)]
pub struct IntervalIds {
    next: u64,
}

impl Default for IntervalIds {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl IntervalIds {
    pub fn allocate(&mut self) -> IntervalId {
        let id = IntervalId(self.next);
        self.next += 1;
        id
    }

    /// Ids handed out so far
    #[must_use]
    pub fn allocated(&self) -> u64 {
        self.next - 1
    }
}

/// A stretch of one call's execution on one cpu without nested calls or returns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallInterval {
    pub id: IntervalId,
    pub call_tag: CallTag,
    pub cpu: CpuId,
    pub start_pc: u64,
    pub end_pc: u64,
    pub access_start: u64,
    pub access_end: u64,
    /// Previous closed interval of the same call
    pub prev: Option<IntervalId>,
    /// Next closed interval of the same call
    pub next: Option<IntervalId>,
    /// Interval of the frame this one returns to
    pub return_target: Option<IntervalId>,
}

/// Reconstructed execution of one call tag
///
/// Intervals are opened by start/resume transitions and nested calls, and
/// closed by pause/done transitions and nested calls/returns. Closed
/// intervals form a doubly linked timeline; `return_target` links turn the
/// same set into a call tree.
#[derive(Debug)]
pub struct CallTimeline {
    pub tag: CallTag,
    pub tid: u64,
    pub start_pc: u64,
    current: Option<CallInterval>,
    timeline: Vec<CallInterval>,
    /// Latest interval of each active frame, innermost last
    frames: Vec<IntervalId>,
}

impl CallTimeline {
    /// Closed intervals in execution order
    #[must_use]
    pub fn intervals(&self) -> &[CallInterval] {
        &self.timeline
    }

    /// Apply a nested call or return
    pub fn on_call(&mut self, header: &EntryHeader, call: &CallEntry, ids: &mut IntervalIds) {
        let cpu = CpuId(header.cpu);
        let access_count = header.access_count;

        if call.ret {
            self.close(call.target_pc, access_count);
            self.frames.pop();
            let return_target = self.caller_of_top();
            let id = self.open(cpu, call.target_pc, access_count, return_target, ids);
            match self.frames.last_mut() {
                Some(top) => *top = id,
                None => self.frames.push(id),
            }
        } else {
            self.close(call.return_pc, access_count);
            let return_target = self.frames.last().copied();
            let id = self.open(cpu, call.target_pc, access_count, return_target, ids);
            self.frames.push(id);
        }
    }

    /// Continue the innermost frame in a fresh interval
    fn reopen(&mut self, at: &Transition, ids: &mut IntervalIds) {
        self.close(at.pc, at.access_count);
        let return_target = self.caller_of_top();
        let id = self.open(at.cpu, at.pc, at.access_count, return_target, ids);
        match self.frames.last_mut() {
            Some(top) => *top = id,
            None => self.frames.push(id),
        }
    }

    fn caller_of_top(&self) -> Option<IntervalId> {
        self.frames.len().checked_sub(2).map(|idx| self.frames[idx])
    }

    fn open(
        &mut self,
        cpu: CpuId,
        start_pc: u64,
        access_start: u64,
        return_target: Option<IntervalId>,
        ids: &mut IntervalIds,
    ) -> IntervalId {
        let id = ids.allocate();
        self.current = Some(CallInterval {
            id,
            call_tag: self.tag,
            cpu,
            start_pc,
            end_pc: start_pc,
            access_start,
            access_end: access_start,
            prev: None,
            next: None,
            return_target,
        });
        id
    }

    fn close(&mut self, end_pc: u64, access_end: u64) {
        let Some(mut interval) = self.current.take() else {
            return;
        };
        if let Some(prev) = self.timeline.last_mut() {
            prev.next = Some(interval.id);
            interval.prev = Some(prev.id);
        }
        interval.end_pc = end_pc;
        interval.access_end = access_end;
        self.timeline.push(interval);
    }
}

impl CallRecord for CallTimeline {
    type Context = IntervalIds;

    fn start(fcall: &FcallEntry, at: &Transition, ids: &mut IntervalIds) -> Self {
        let mut timeline = CallTimeline {
            tag: CallTag(fcall.tag),
            tid: fcall.tid,
            start_pc: fcall.pc,
            current: None,
            timeline: Vec::new(),
            frames: Vec::new(),
        };
        timeline.reopen(at, ids);
        timeline
    }

    fn on_pause(&mut self, at: &Transition, _: &mut IntervalIds) {
        self.close(at.pc, at.access_count);
    }

    fn on_resume(&mut self, at: &Transition, ids: &mut IntervalIds) {
        self.reopen(at, ids);
    }

    fn on_done(&mut self, at: &Transition, _: &mut IntervalIds) {
        self.close(at.pc, at.access_count);
    }

    fn on_flush(&mut self, last_access_count: u64, _: &mut IntervalIds) {
        // Still running at the end of the log: close where it started
        if let Some(pc) = self.current.as_ref().map(|interval| interval.start_pc) {
            self.close(pc, last_access_count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callstack::PerCallStack;
    use mscan_common::{CallState, EntryKind, HEADER_SIZE};

    fn header(kind: EntryKind, cpu: u16, access_count: u64) -> EntryHeader {
        EntryHeader {
            kind,
            size: u16::try_from(HEADER_SIZE + kind.payload_size()).unwrap(),
            cpu,
            access_count,
            ts: access_count * 10,
        }
    }

    struct Driver {
        stacks: PerCallStack<CallTimeline>,
        ids: IntervalIds,
    }

    impl Driver {
        fn new() -> Self {
            Self { stacks: PerCallStack::new(), ids: IntervalIds::default() }
        }

        fn fcall(&mut self, state: CallState, pc: u64, cpu: u16, ac: u64) -> Option<CallTimeline> {
            let entry = FcallEntry { tid: 42, pc, tag: 0xabc, depth: 0, state };
            self.stacks.handle(&header(EntryKind::Fcall, cpu, ac), &entry, &mut self.ids).unwrap()
        }

        fn call(&mut self, target_pc: u64, return_pc: u64, ret: bool, cpu: u16, ac: u64) {
            let entry = CallEntry { target_pc, return_pc, ret };
            if let Some(timeline) = self.stacks.current_mut(CpuId(cpu)) {
                timeline.on_call(&header(EntryKind::Call, cpu, ac), &entry, &mut self.ids);
            }
        }
    }

    #[test]
    fn test_pause_resume_links_intervals() {
        let mut driver = Driver::new();
        driver.fcall(CallState::Start, 0x100, 0, 1);
        driver.fcall(CallState::Pause, 0x110, 0, 5);
        driver.fcall(CallState::Resume, 0x110, 1, 9);
        let done = driver.fcall(CallState::Done, 0x120, 1, 12).unwrap();

        let intervals = done.intervals();
        assert_eq!(intervals.len(), 2);
        assert_eq!(intervals.iter().map(|i| i.cpu.0).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(intervals[0].id, IntervalId(1));
        assert_eq!(intervals[0].next, Some(intervals[1].id));
        assert_eq!(intervals[1].prev, Some(intervals[0].id));
        assert_eq!(intervals[0].prev, None);
        assert_eq!(intervals[1].next, None);
        assert_eq!((intervals[0].access_start, intervals[0].access_end), (1, 5));
        assert_eq!((intervals[1].start_pc, intervals[1].end_pc), (0x110, 0x120));
        assert!(!driver.stacks.contains(CallTag(0xabc)));
    }

    #[test]
    fn test_nested_call_and_return() {
        let mut driver = Driver::new();
        driver.fcall(CallState::Start, 0x100, 0, 1);
        driver.call(0x500, 0x104, false, 0, 2);
        driver.call(0x900, 0x508, false, 0, 3);
        driver.call(0x508, 0, true, 0, 4);
        driver.call(0x104, 0, true, 0, 5);
        let done = driver.fcall(CallState::Done, 0x110, 0, 6).unwrap();

        let iv = done.intervals();
        assert_eq!(iv.len(), 5);
        // top-level, callee, nested callee, callee continuation, top-level continuation
        assert_eq!(iv.iter().map(|i| i.start_pc).collect::<Vec<_>>(), vec![0x100, 0x500, 0x900, 0x508, 0x104]);
        assert_eq!(iv[0].end_pc, 0x104);
        assert_eq!(iv[1].return_target, Some(iv[0].id));
        assert_eq!(iv[2].return_target, Some(iv[1].id));
        assert_eq!(iv[3].return_target, Some(iv[0].id), "continuation returns to the caller's caller");
        assert_eq!(iv[4].return_target, None);
        assert_eq!(iv[4].end_pc, 0x110);
    }

    #[test]
    fn test_calls_without_current_are_ignored() {
        let mut driver = Driver::new();
        driver.call(0x500, 0x104, false, 3, 1);
        assert!(driver.stacks.is_empty());
        assert_eq!(driver.ids.allocated(), 0);
    }

    #[test]
    fn test_flush_closes_open_interval() {
        let mut driver = Driver::new();
        driver.fcall(CallState::Start, 0x100, 0, 1);
        let flushed = driver.stacks.flush(50, &mut driver.ids);
        assert_eq!(flushed[0].intervals()[0].access_end, 50);
    }
}
