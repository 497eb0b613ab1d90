//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers keep the many `u64` values flowing through a scan
//! apart: a call tag is not a lock address, and a cpu index is not a tid.

use std::fmt;

/// Virtual cpu that produced a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CpuId(pub u16);

impl CpuId {
    /// Index into per-cpu tables
    #[must_use]
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// Identifier of one logical call activation
///
/// Tags are assigned by the instrumented guest and stay the same while the
/// activation migrates between cpus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallTag(pub u64);

impl fmt::Display for CallTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tag:{:#x}", self.0)
    }
}

/// Lock identity (the guest address of the lock word)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct LockId(pub u64);

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock:{:#x}", self.0)
    }
}

/// Identifier of a labeled object, unique per run, allocated from 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

/// Identifier of a call interval, unique per run, allocated from 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IntervalId(pub u64);

impl fmt::Display for IntervalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "interval#{}", self.0)
    }
}

/// Elapsed guest cycles between two timestamps of the same cpu
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Cycles(pub u64);

impl Cycles {
    /// Cycles from `start` to `end`, zero if the clock went backwards
    #[must_use]
    pub fn between(start: u64, end: u64) -> Self {
        Cycles(end.saturating_sub(start))
    }
}

impl std::ops::Add for Cycles {
    type Output = Cycles;

    fn add(self, rhs: Cycles) -> Cycles {
        Cycles(self.0.saturating_add(rhs.0))
    }
}

impl std::ops::AddAssign for Cycles {
    fn add_assign(&mut self, rhs: Cycles) {
        *self = *self + rhs;
    }
}

impl fmt::Display for Cycles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1_000_000 {
            #[allow(clippy::cast_precision_loss)]
            let mega = self.0 as f64 / 1_000_000.0;
            write!(f, "{mega:.2}M cycles")
        } else {
            write!(f, "{} cycles", self.0)
        }
    }
}
