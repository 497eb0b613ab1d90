use std::collections::{HashMap, VecDeque};

use log::debug;
use mscan_common::{AccessEntry, EntryHeader, LockEntry, LockOp};

use crate::domain::{CpuId, Cycles, LockError, LockId};

/// Default number of releases of unheld locks tolerated
pub const DEFAULT_RELEASE_MISS_LIMIT: u64 = 20;

/// Default number of `acquired` records without an `acquire` tolerated
pub const DEFAULT_ACQUIRED_MISS_LIMIT: u64 = 10;

/// One completed, fully nested hold of a lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CriticalSection {
    pub lock: LockId,
    pub lock_name: String,
    /// Where the outermost acquire happened
    pub pc: u64,
    pub start_cpu: CpuId,
    pub release_cpu: CpuId,
    pub acquire_ts: u64,
    /// `None` if the lock was never reported as actually taken
    pub acquired_ts: Option<u64>,
    pub release_ts: u64,
    pub read: bool,
    /// Locked instructions executed while holding the lock
    pub locked_access_count: u64,
    /// Accesses that moved a cache line while holding the lock
    pub traffic_access_count: u64,
}

impl CriticalSection {
    /// Time spent waiting for the lock
    #[must_use]
    pub fn spin_time(&self) -> Cycles {
        self.acquired_ts.map_or(Cycles(0), |acquired| Cycles::between(self.acquire_ts, acquired))
    }

    /// Time the lock was held
    #[must_use]
    pub fn hold_time(&self) -> Cycles {
        let held_from = self.acquired_ts.map_or(self.acquire_ts, |t| t.max(self.acquire_ts));
        Cycles::between(held_from, self.release_ts)
    }
}

#[derive(Debug)]
struct LockState {
    depth: u32,
    section: CriticalSection,
}

/// Tolerance thresholds for the tracker
#[derive(Debug, Clone, Copy)]
pub struct LockLimits {
    pub release_misses: u64,
    pub acquired_misses: u64,
}

impl Default for LockLimits {
    fn default() -> Self {
        Self {
            release_misses: DEFAULT_RELEASE_MISS_LIMIT,
            acquired_misses: DEFAULT_ACQUIRED_MISS_LIMIT,
        }
    }
}

/// Turns acquire / acquired / release records into critical sections
///
/// Nested acquires of the same lock extend one section; the section is
/// emitted when the nesting returns to zero. Ordinary accesses are charged
/// to the most recently acquired lock still held.
#[derive(Debug, Default)]
pub struct LockTracker {
    states: HashMap<LockId, LockState>,
    /// Held locks, most recent first
    held: VecDeque<LockId>,
    limits: LockLimits,
    release_misses: u64,
    acquired_misses: u64,
}

impl LockTracker {
    #[must_use]
    pub fn new(limits: LockLimits) -> Self {
        Self { limits, ..Self::default() }
    }

    /// Apply one lock record
    ///
    /// # Errors
    /// Returns a [`LockError`] once a miss threshold is crossed
    pub fn handle(
        &mut self,
        header: &EntryHeader,
        lock: &LockEntry,
    ) -> Result<Option<CriticalSection>, LockError> {
        match lock.op {
            LockOp::Acquire => {
                self.acquire(header, lock);
                Ok(None)
            }
            LockOp::Acquired => self.acquired(header, lock).map(|()| None),
            LockOp::Release => self.release(header, lock),
        }
    }

    pub fn acquire(&mut self, header: &EntryHeader, lock: &LockEntry) {
        let id = LockId(lock.lock);
        let state = self.states.entry(id).or_insert_with(|| LockState {
            depth: 0,
            section: CriticalSection {
                lock: id,
                lock_name: lock.name.clone(),
                pc: lock.pc,
                start_cpu: CpuId(header.cpu),
                release_cpu: CpuId(header.cpu),
                acquire_ts: header.ts,
                acquired_ts: None,
                release_ts: header.ts,
                read: lock.read,
                locked_access_count: 0,
                traffic_access_count: 0,
            },
        });
        if state.depth == 0 {
            self.held.push_front(id);
        }
        state.depth += 1;
    }

    /// # Errors
    /// Returns [`LockError::TooManyAcquiredMisses`] once too many locks are
    /// reported taken without being acquired
    pub fn acquired(&mut self, header: &EntryHeader, lock: &LockEntry) -> Result<(), LockError> {
        let id = LockId(lock.lock);
        let Some(state) = self.states.get_mut(&id) else {
            self.acquired_misses += 1;
            debug!("{id} ({}) acquired without acquire", lock.name);
            if self.acquired_misses > self.limits.acquired_misses {
                return Err(LockError::TooManyAcquiredMisses {
                    lock: id,
                    name: lock.name.clone(),
                    cpu: CpuId(header.cpu),
                    access_count: header.access_count,
                    count: self.acquired_misses,
                });
            }
            return Ok(());
        };

        if state.section.acquired_ts.is_none() {
            state.section.acquired_ts = Some(header.ts);
            state.section.locked_access_count = 0;
            state.section.traffic_access_count = 0;
        }
        Ok(())
    }

    /// # Errors
    /// Returns [`LockError::TooManyReleaseMisses`] once too many unheld
    /// locks are released
    pub fn release(
        &mut self,
        header: &EntryHeader,
        lock: &LockEntry,
    ) -> Result<Option<CriticalSection>, LockError> {
        let id = LockId(lock.lock);
        let Some(state) = self.states.get_mut(&id) else {
            self.release_misses += 1;
            debug!("release of unheld {id} ({})", lock.name);
            if self.release_misses > self.limits.release_misses {
                return Err(LockError::TooManyReleaseMisses {
                    lock: id,
                    name: lock.name.clone(),
                    cpu: CpuId(header.cpu),
                    access_count: header.access_count,
                    count: self.release_misses,
                });
            }
            return Ok(None);
        };

        state.depth -= 1;
        if state.depth > 0 {
            return Ok(None);
        }

        if let Some(pos) = self.held.iter().position(|held| *held == id) {
            self.held.remove(pos);
        }
        Ok(self.states.remove(&id).map(|state| {
            let mut section = state.section;
            section.release_cpu = CpuId(header.cpu);
            section.release_ts = header.ts;
            section
        }))
    }

    /// Charge an access to the innermost held lock
    ///
    /// Returns false if no lock is held.
    pub fn on_access(&mut self, access: &AccessEntry) -> bool {
        let Some(state) = self.held.front().and_then(|id| self.states.get_mut(id)) else {
            return false;
        };
        state.section.locked_access_count += u64::from(access.lock);
        state.section.traffic_access_count += u64::from(access.traffic);
        true
    }

    /// Most recently acquired lock still held
    #[must_use]
    pub fn innermost(&self) -> Option<LockId> {
        self.held.front().copied()
    }

    /// Held locks, most recent first
    pub fn held(&self) -> impl Iterator<Item = LockId> + '_ {
        self.held.iter().copied()
    }

    /// Current nesting depth of `lock`, zero if not held
    #[must_use]
    pub fn depth(&self, lock: LockId) -> u32 {
        self.states.get(&lock).map_or(0, |state| state.depth)
    }

    #[must_use]
    pub fn release_misses(&self) -> u64 {
        self.release_misses
    }

    #[must_use]
    pub fn acquired_misses(&self) -> u64 {
        self.acquired_misses
    }
}
