use std::collections::BTreeMap;

use log::warn;
use mscan_common::{CallState, EntryHeader, FcallEntry};

use crate::domain::{CallStackError, CallTag, CpuId};

/// Where and when an fcall transition happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub cpu: CpuId,
    pub access_count: u64,
    pub ts: u64,
    pub pc: u64,
}

impl Transition {
    #[must_use]
    pub fn new(header: &EntryHeader, pc: u64) -> Self {
        Self { cpu: CpuId(header.cpu), access_count: header.access_count, ts: header.ts, pc }
    }
}

/// Per-call-stack application state driven by [`PerCallStack`]
///
/// One value is built from the start transition and lives until the
/// matching done transition or the end of the log. `Context` carries
/// whatever the record needs beyond the transition itself.
pub trait CallRecord: Sized {
    type Context;

    fn start(fcall: &FcallEntry, at: &Transition, ctx: &mut Self::Context) -> Self;

    fn on_pause(&mut self, _at: &Transition, _ctx: &mut Self::Context) {}

    fn on_resume(&mut self, _at: &Transition, _ctx: &mut Self::Context) {}

    fn on_done(&mut self, _at: &Transition, _ctx: &mut Self::Context) {}

    /// The log ended with this call still live
    fn on_flush(&mut self, _last_access_count: u64, _ctx: &mut Self::Context) {}
}

struct Slot<T> {
    record: T,
    /// The cpu currently executing this call, `None` while paused
    cpu: Option<CpuId>,
}

/// Tracks the live call stacks and which one each cpu is executing
///
/// Each call tag is either active on exactly one cpu or paused; a cpu runs
/// at most one tag. Start conflicts, resumes of unknown tags and mismatched
/// done transitions are fatal. A pause with the wrong (or no) current tag and
/// a repeated resume are tolerated with a single warning per run.
pub struct PerCallStack<T> {
    calls: BTreeMap<CallTag, Slot<T>>,
    current: Vec<Option<CallTag>>,
    /// Cpu count from the machine record; unbounded until it arrives
    num_cpus: Option<u16>,
    warned_pause: bool,
    warned_resume: bool,
}

impl<T: CallRecord> Default for PerCallStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: CallRecord> PerCallStack<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            calls: BTreeMap::new(),
            current: Vec::new(),
            num_cpus: None,
            warned_pause: false,
            warned_resume: false,
        }
    }

    /// Size the per-cpu table from the machine record
    pub fn set_num_cpus(&mut self, num_cpus: u16) {
        self.num_cpus = Some(num_cpus);
        if self.current.len() < usize::from(num_cpus) {
            self.current.resize(usize::from(num_cpus), None);
        }
    }

    /// Apply one fcall transition
    ///
    /// Returns the finalized record when the transition is `done`.
    ///
    /// # Errors
    /// Returns a [`CallStackError`] when the transition violates the state
    /// machine
    pub fn handle(
        &mut self,
        header: &EntryHeader,
        fcall: &FcallEntry,
        ctx: &mut T::Context,
    ) -> Result<Option<T>, CallStackError> {
        let at = Transition::new(header, fcall.pc);
        let tag = CallTag(fcall.tag);
        let cpu = self.check_cpu(at.cpu, at.access_count)?;

        match fcall.state {
            CallState::Start => {
                if self.calls.contains_key(&tag) {
                    return Err(CallStackError::DuplicateTag {
                        tag,
                        cpu: at.cpu,
                        access_count: at.access_count,
                    });
                }
                if let Some(current) = self.current[cpu] {
                    return Err(CallStackError::CpuBusy {
                        op: "start",
                        tag,
                        cpu: at.cpu,
                        current,
                        access_count: at.access_count,
                    });
                }
                let record = T::start(fcall, &at, ctx);
                self.calls.insert(tag, Slot { record, cpu: Some(at.cpu) });
                self.current[cpu] = Some(tag);
                Ok(None)
            }
            CallState::Pause => {
                let detached = self.current[cpu].take();
                if detached != Some(tag) && !self.warned_pause {
                    warn!(
                        "pause of {tag} on {} (access {}) but the cpu is running {}",
                        at.cpu,
                        at.access_count,
                        detached.map_or_else(|| "nothing".to_string(), |t| t.to_string())
                    );
                    self.warned_pause = true;
                }
                if let Some(slot) = detached.and_then(|t| self.calls.get_mut(&t)) {
                    slot.cpu = None;
                    slot.record.on_pause(&at, ctx);
                }
                Ok(None)
            }
            CallState::Resume => {
                if !self.calls.contains_key(&tag) {
                    return Err(CallStackError::UnknownTag {
                        tag,
                        cpu: at.cpu,
                        access_count: at.access_count,
                    });
                }
                match self.current[cpu] {
                    Some(current) if current == tag => {
                        if !self.warned_resume {
                            warn!("double resume of {tag} on {} (access {})", at.cpu, at.access_count);
                            self.warned_resume = true;
                        }
                        return Ok(None);
                    }
                    Some(current) => {
                        return Err(CallStackError::CpuBusy {
                            op: "resume",
                            tag,
                            cpu: at.cpu,
                            current,
                            access_count: at.access_count,
                        });
                    }
                    None => {}
                }

                let Some(slot) = self.calls.get_mut(&tag) else {
                    return Ok(None);
                };
                // A call resumed elsewhere without a pause migrates
                if let Some(other) = slot.cpu.replace(at.cpu) {
                    warn!("{tag} resumed on {} while still running on {other}", at.cpu);
                    if let Some(entry) = self.current.get_mut(other.index()) {
                        *entry = None;
                    }
                }
                slot.record.on_resume(&at, ctx);
                self.current[cpu] = Some(tag);
                Ok(None)
            }
            CallState::Done => {
                match self.current[cpu] {
                    None => {
                        return Err(CallStackError::NoCurrent {
                            tag,
                            cpu: at.cpu,
                            access_count: at.access_count,
                        })
                    }
                    Some(current) if current != tag => {
                        return Err(CallStackError::TagMismatch {
                            tag,
                            cpu: at.cpu,
                            current,
                            access_count: at.access_count,
                        })
                    }
                    Some(_) => {}
                }
                self.current[cpu] = None;
                Ok(self.calls.remove(&tag).map(|mut slot| {
                    slot.record.on_done(&at, ctx);
                    slot.record
                }))
            }
        }
    }

    /// Record for the call `cpu` is executing
    #[must_use]
    pub fn current(&self, cpu: CpuId) -> Option<&T> {
        let tag = self.current_tag(cpu)?;
        self.calls.get(&tag).map(|slot| &slot.record)
    }

    pub fn current_mut(&mut self, cpu: CpuId) -> Option<&mut T> {
        let tag = self.current_tag(cpu)?;
        self.calls.get_mut(&tag).map(|slot| &mut slot.record)
    }

    #[must_use]
    pub fn current_tag(&self, cpu: CpuId) -> Option<CallTag> {
        self.current.get(cpu.index()).copied().flatten()
    }

    #[must_use]
    pub fn contains(&self, tag: CallTag) -> bool {
        self.calls.contains_key(&tag)
    }

    /// Live call stacks, active or paused
    #[must_use]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Finalize every remaining record, in tag order
    pub fn flush(&mut self, last_access_count: u64, ctx: &mut T::Context) -> Vec<T> {
        self.current.iter_mut().for_each(|cpu| *cpu = None);
        std::mem::take(&mut self.calls)
            .into_values()
            .map(|mut slot| {
                slot.record.on_flush(last_access_count, ctx);
                slot.record
            })
            .collect()
    }

    fn check_cpu(&mut self, cpu: CpuId, access_count: u64) -> Result<usize, CallStackError> {
        let idx = cpu.index();
        match self.num_cpus {
            Some(num_cpus) if idx >= usize::from(num_cpus) => {
                Err(CallStackError::CpuOutOfRange { cpu, num_cpus, access_count })
            }
            _ => {
                if idx >= self.current.len() {
                    self.current.resize(idx + 1, None);
                }
                Ok(idx)
            }
        }
    }
}
