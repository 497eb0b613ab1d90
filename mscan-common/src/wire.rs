//! Field-by-field encoding of records
//!
//! Every record is read and written one field at a time in the order listed
//! in the crate docs, native-endian, with no padding. Nothing here relies on
//! in-memory struct layout.

use std::io::{self, Read, Write};

use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use crate::{
    AccessEntry, AccessType, AppDataEntry, CallEntry, CallState, EntryHeader, EntryKind,
    FcallEntry, HostEntry, HostType, LabelClass, LabelEntry, LockEntry, LockOp, MachineEntry,
    Payload, RecordMode, SchedEntry, SegmentEntry, TaskEntry, TaskType, TraceEntry, HEADER_SIZE,
    NAME_LEN,
};

/// Errors produced while decoding a single record body
#[derive(Error, Debug)]
pub enum WireError {
    #[error("unknown record kind {0}")]
    UnknownKind(u32),

    #[error("invalid {field} value {value} in {kind:?} record")]
    InvalidField { kind: EntryKind, field: &'static str, value: u32 },

    #[error("call cpu {0:#x} is neither a cpu id nor the current-cpu marker")]
    InvalidCallCpu(u64),

    #[error(transparent)]
    Io(#[from] io::Error),
}

// ============================================================================
// Header
// ============================================================================

impl EntryHeader {
    /// Parse a raw header
    ///
    /// # Errors
    /// Returns [`WireError::UnknownKind`] if the kind tag is not part of the schema
    pub fn parse(raw: &[u8; HEADER_SIZE]) -> Result<Self, WireError> {
        let mut r = &raw[..];
        let tag = r.read_u32::<NativeEndian>()?;
        let kind = EntryKind::from_tag(tag).ok_or(WireError::UnknownKind(tag))?;
        Ok(Self {
            kind,
            size: r.read_u16::<NativeEndian>()?,
            cpu: r.read_u16::<NativeEndian>()?,
            access_count: r.read_u64::<NativeEndian>()?,
            ts: r.read_u64::<NativeEndian>()?,
        })
    }

    /// Write the header in its on-disk form
    ///
    /// # Errors
    /// Propagates write errors from `w`
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<NativeEndian>(self.kind.tag())?;
        w.write_u16::<NativeEndian>(self.size)?;
        w.write_u16::<NativeEndian>(self.cpu)?;
        w.write_u64::<NativeEndian>(self.access_count)?;
        w.write_u64::<NativeEndian>(self.ts)
    }
}

// ============================================================================
// Payloads
// ============================================================================

impl Payload {
    /// Decode the payload of a `kind` record from `body`
    ///
    /// `body` must hold at least `kind.payload_size()` bytes; extra bytes
    /// are ignored.
    ///
    /// # Errors
    /// Returns an error if `body` is short or an enumerated field holds an
    /// unknown value
    pub fn decode(kind: EntryKind, body: &[u8]) -> Result<Self, WireError> {
        let mut r = body;
        let payload = match kind {
            EntryKind::Label => Payload::Label(LabelEntry {
                host_addr: r.read_u64::<NativeEndian>()?,
                class: label_class(kind, r.read_u32::<NativeEndian>()?)?,
                name: read_name(&mut r)?,
                guest_addr: r.read_u64::<NativeEndian>()?,
                bytes: r.read_u64::<NativeEndian>()?,
                pc: r.read_u64::<NativeEndian>()?,
            }),
            EntryKind::Access => {
                let raw = r.read_u32::<NativeEndian>()?;
                Payload::Access(AccessEntry {
                    access_type: AccessType::from_raw(raw)
                        .ok_or(WireError::InvalidField { kind, field: "access_type", value: raw })?,
                    pc: r.read_u64::<NativeEndian>()?,
                    host_addr: r.read_u64::<NativeEndian>()?,
                    guest_addr: r.read_u64::<NativeEndian>()?,
                    bytes: r.read_u32::<NativeEndian>()?,
                    traffic: r.read_u8()? != 0,
                    lock: r.read_u8()? != 0,
                })
            }
            EntryKind::Host => {
                let raw = r.read_u32::<NativeEndian>()?;
                let host_type = HostType::from_raw(raw)
                    .ok_or(WireError::InvalidField { kind, field: "host_type", value: raw })?;
                let raw = r.read_u32::<NativeEndian>()?;
                let mode = RecordMode::from_raw(raw)
                    .ok_or(WireError::InvalidField { kind, field: "mode", value: raw })?;
                let host = HostEntry {
                    host_type,
                    mode,
                    call_cpu: r.read_u64::<NativeEndian>()?,
                    label: read_name(&mut r)?,
                };
                if host_type != HostType::AccessAllCpu {
                    host.target_cpu(0)?;
                }
                Payload::Host(host)
            }
            EntryKind::Fcall => {
                let tid = r.read_u64::<NativeEndian>()?;
                let pc = r.read_u64::<NativeEndian>()?;
                let tag = r.read_u64::<NativeEndian>()?;
                let depth = r.read_u16::<NativeEndian>()?;
                let raw = r.read_u32::<NativeEndian>()?;
                let state = CallState::from_raw(raw)
                    .ok_or(WireError::InvalidField { kind, field: "state", value: raw })?;
                Payload::Fcall(FcallEntry { tid, pc, tag, depth, state })
            }
            EntryKind::Segment => Payload::Segment(SegmentEntry {
                base: r.read_u64::<NativeEndian>()?,
                end: r.read_u64::<NativeEndian>()?,
                class: label_class(kind, r.read_u32::<NativeEndian>()?)?,
            }),
            EntryKind::Call => Payload::Call(CallEntry {
                target_pc: r.read_u64::<NativeEndian>()?,
                return_pc: r.read_u64::<NativeEndian>()?,
                ret: r.read_u32::<NativeEndian>()? != 0,
            }),
            EntryKind::Lock => {
                let pc = r.read_u64::<NativeEndian>()?;
                let lock = r.read_u64::<NativeEndian>()?;
                let name = read_name(&mut r)?;
                let raw = r.read_u32::<NativeEndian>()?;
                let op = LockOp::from_raw(raw)
                    .ok_or(WireError::InvalidField { kind, field: "op", value: raw })?;
                Payload::Lock(LockEntry { pc, lock, name, op, read: r.read_u8()? != 0 })
            }
            EntryKind::Task => {
                let raw = r.read_u32::<NativeEndian>()?;
                let task_type = TaskType::from_raw(raw)
                    .ok_or(WireError::InvalidField { kind, field: "task_type", value: raw })?;
                Payload::Task(TaskEntry {
                    task_type,
                    tid: r.read_u64::<NativeEndian>()?,
                    tgid: r.read_u64::<NativeEndian>()?,
                    name: read_name(&mut r)?,
                })
            }
            EntryKind::Sched => Payload::Sched(SchedEntry { tid: r.read_u64::<NativeEndian>()? }),
            EntryKind::Machine => Payload::Machine(MachineEntry {
                num_cpus: r.read_u16::<NativeEndian>()?,
                num_ram: r.read_u64::<NativeEndian>()?,
                quantum: r.read_u64::<NativeEndian>()?,
                sample: r.read_u64::<NativeEndian>()?,
                locked: r.read_u8()? != 0,
                calls: r.read_u8()? != 0,
            }),
            EntryKind::AppData => Payload::AppData(AppDataEntry {
                appdata_type: r.read_u16::<NativeEndian>()?,
                value: r.read_u64::<NativeEndian>()?,
            }),
        };
        Ok(payload)
    }

    /// Write the payload in its on-disk form
    ///
    /// # Errors
    /// Propagates write errors from `w`
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        match self {
            Payload::Label(l) => {
                w.write_u64::<NativeEndian>(l.host_addr)?;
                w.write_u32::<NativeEndian>(l.class.raw())?;
                write_name(w, &l.name)?;
                w.write_u64::<NativeEndian>(l.guest_addr)?;
                w.write_u64::<NativeEndian>(l.bytes)?;
                w.write_u64::<NativeEndian>(l.pc)
            }
            Payload::Access(a) => {
                w.write_u32::<NativeEndian>(a.access_type.raw())?;
                w.write_u64::<NativeEndian>(a.pc)?;
                w.write_u64::<NativeEndian>(a.host_addr)?;
                w.write_u64::<NativeEndian>(a.guest_addr)?;
                w.write_u32::<NativeEndian>(a.bytes)?;
                w.write_u8(u8::from(a.traffic))?;
                w.write_u8(u8::from(a.lock))
            }
            Payload::Host(h) => {
                w.write_u32::<NativeEndian>(h.host_type.raw())?;
                w.write_u32::<NativeEndian>(h.mode.raw())?;
                w.write_u64::<NativeEndian>(h.call_cpu)?;
                write_name(w, &h.label)
            }
            Payload::Fcall(f) => {
                w.write_u64::<NativeEndian>(f.tid)?;
                w.write_u64::<NativeEndian>(f.pc)?;
                w.write_u64::<NativeEndian>(f.tag)?;
                w.write_u16::<NativeEndian>(f.depth)?;
                w.write_u32::<NativeEndian>(f.state.raw())
            }
            Payload::Segment(s) => {
                w.write_u64::<NativeEndian>(s.base)?;
                w.write_u64::<NativeEndian>(s.end)?;
                w.write_u32::<NativeEndian>(s.class.raw())
            }
            Payload::Call(c) => {
                w.write_u64::<NativeEndian>(c.target_pc)?;
                w.write_u64::<NativeEndian>(c.return_pc)?;
                w.write_u32::<NativeEndian>(u32::from(c.ret))
            }
            Payload::Lock(l) => {
                w.write_u64::<NativeEndian>(l.pc)?;
                w.write_u64::<NativeEndian>(l.lock)?;
                write_name(w, &l.name)?;
                w.write_u32::<NativeEndian>(l.op.raw())?;
                w.write_u8(u8::from(l.read))
            }
            Payload::Task(t) => {
                w.write_u32::<NativeEndian>(t.task_type.raw())?;
                w.write_u64::<NativeEndian>(t.tid)?;
                w.write_u64::<NativeEndian>(t.tgid)?;
                write_name(w, &t.name)
            }
            Payload::Sched(s) => w.write_u64::<NativeEndian>(s.tid),
            Payload::Machine(m) => {
                w.write_u16::<NativeEndian>(m.num_cpus)?;
                w.write_u64::<NativeEndian>(m.num_ram)?;
                w.write_u64::<NativeEndian>(m.quantum)?;
                w.write_u64::<NativeEndian>(m.sample)?;
                w.write_u8(u8::from(m.locked))?;
                w.write_u8(u8::from(m.calls))
            }
            Payload::AppData(a) => {
                w.write_u16::<NativeEndian>(a.appdata_type)?;
                w.write_u64::<NativeEndian>(a.value)
            }
        }
    }
}

impl TraceEntry {
    /// Write header and payload
    ///
    /// The declared size written is the one in `self.header`; records built
    /// with [`TraceEntry::new`] carry the exact record size.
    ///
    /// # Errors
    /// Propagates write errors from `w`
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        self.header.write_to(w)?;
        self.payload.write_to(w)?;
        // Declared sizes larger than the payload are padded so the next
        // header starts where the reader expects it.
        let written = self.header.kind.record_size();
        let declared = usize::from(self.header.size);
        if declared > written {
            w.write_all(&vec![0; declared - written])?;
        }
        Ok(())
    }
}

fn label_class(kind: EntryKind, raw: u32) -> Result<LabelClass, WireError> {
    LabelClass::from_raw(raw).ok_or(WireError::InvalidField { kind, field: "class", value: raw })
}

/// Read a NUL-padded fixed-width string field
fn read_name<R: Read>(r: &mut R) -> io::Result<String> {
    let mut raw = [0u8; NAME_LEN];
    r.read_exact(&mut raw)?;
    let len = raw.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
    Ok(String::from_utf8_lossy(&raw[..len]).into_owned())
}

/// Write a fixed-width string field, truncated so a NUL terminator always fits
///
/// Truncation backs off to a character boundary so the field stays valid UTF-8.
fn write_name<W: Write>(w: &mut W, name: &str) -> io::Result<()> {
    let mut raw = [0u8; NAME_LEN];
    let mut len = name.len().min(NAME_LEN - 1);
    while !name.is_char_boundary(len) {
        len -= 1;
    }
    raw[..len].copy_from_slice(&name.as_bytes()[..len]);
    w.write_all(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HOST_CALL_CPU_CURRENT;

    fn encode(entry: &TraceEntry) -> Vec<u8> {
        let mut out = Vec::new();
        entry.write_to(&mut out).unwrap();
        out
    }

    #[test]
    fn test_encoded_length_matches_schema() {
        let entry = TraceEntry::new(
            2,
            100,
            5000,
            Payload::Lock(LockEntry {
                pc: 0xffff_ffff_8100_0000,
                lock: 0x1000,
                name: "dcache_lock".to_string(),
                op: LockOp::Acquire,
                read: false,
            }),
        );
        let bytes = encode(&entry);
        assert_eq!(bytes.len(), EntryKind::Lock.record_size());
        assert_eq!(bytes.len(), usize::from(entry.header.size));
    }

    #[test]
    fn test_header_parse() {
        let entry = TraceEntry::new(3, 42, 77, Payload::Sched(SchedEntry { tid: 9 }));
        let bytes = encode(&entry);
        let raw: [u8; HEADER_SIZE] = bytes[..HEADER_SIZE].try_into().unwrap();
        assert_eq!(EntryHeader::parse(&raw).unwrap(), entry.header);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut raw = [0u8; HEADER_SIZE];
        raw[..4].copy_from_slice(&99u32.to_ne_bytes());
        assert!(matches!(EntryHeader::parse(&raw), Err(WireError::UnknownKind(99))));
    }

    #[test]
    fn test_long_names_truncated() {
        let long = "x".repeat(40);
        let entry = TraceEntry::new(
            0,
            1,
            1,
            Payload::Task(TaskEntry {
                task_type: TaskType::Init,
                tid: 1,
                tgid: 1,
                name: long,
            }),
        );
        let bytes = encode(&entry);
        let decoded = Payload::decode(EntryKind::Task, &bytes[HEADER_SIZE..]).unwrap();
        let Payload::Task(task) = decoded else { panic!("expected task payload") };
        assert_eq!(task.name.len(), NAME_LEN - 1);
    }

    #[test]
    fn test_host_call_cpu_must_be_a_cpu_id() {
        let host = |host_type, call_cpu| {
            let entry = TraceEntry::new(
                1,
                1,
                1,
                Payload::Host(HostEntry {
                    host_type,
                    mode: RecordMode::Disable,
                    call_cpu,
                    label: String::new(),
                }),
            );
            Payload::decode(EntryKind::Host, &encode(&entry)[HEADER_SIZE..])
        };

        assert!(host(HostType::CallSetCpu, 3).is_ok());
        assert!(host(HostType::CallSetCpu, HOST_CALL_CPU_CURRENT).is_ok());
        assert!(matches!(
            host(HostType::CallClearCpu, 0x1_0000),
            Err(WireError::InvalidCallCpu(0x1_0000))
        ));
        // Only the per-cpu host records name a cpu
        assert!(host(HostType::AccessAllCpu, 0x1_0000).is_ok());
    }

    #[test]
    fn test_truncation_keeps_whole_characters() {
        // 30 ASCII bytes, then a 3 byte character that would straddle the limit
        let name = format!("{}\u{20ac}tail", "a".repeat(NAME_LEN - 2));
        let entry = TraceEntry::new(
            0,
            1,
            1,
            Payload::Lock(LockEntry {
                pc: 0,
                lock: 0x40,
                name,
                op: LockOp::Acquire,
                read: false,
            }),
        );
        let bytes = encode(&entry);
        let decoded = Payload::decode(EntryKind::Lock, &bytes[HEADER_SIZE..]).unwrap();
        let Payload::Lock(lock) = decoded else { panic!("expected lock payload") };
        assert_eq!(lock.name, "a".repeat(NAME_LEN - 2));
        assert!(!lock.name.contains('\u{fffd}'));

        let fits = "\u{20ac}".repeat(10);
        let entry = TraceEntry::new(
            0,
            2,
            2,
            Payload::Lock(LockEntry { pc: 0, lock: 0x40, name: fits, op: LockOp::Release, read: false }),
        );
        let bytes = encode(&entry);
        let Payload::Lock(lock) = Payload::decode(EntryKind::Lock, &bytes[HEADER_SIZE..]).unwrap()
        else {
            panic!("expected lock payload")
        };
        assert_eq!(lock.name, "\u{20ac}".repeat(10));
    }

    #[test]
    fn test_invalid_enum_value_reported() {
        let entry = TraceEntry::new(
            0,
            1,
            1,
            Payload::Call(CallEntry { target_pc: 1, return_pc: 2, ret: false }),
        );
        let bytes = encode(&entry);
        // A call body is too short to hold an fcall payload
        let err = Payload::decode(EntryKind::Fcall, &bytes[HEADER_SIZE..]).unwrap_err();
        assert!(matches!(err, WireError::Io(_)));

        let mut body = vec![0u8; EntryKind::Fcall.payload_size()];
        let state_at = 8 + 8 + 8 + 2;
        body[state_at..state_at + 4].copy_from_slice(&9u32.to_ne_bytes());
        let err = Payload::decode(EntryKind::Fcall, &body).unwrap_err();
        assert!(matches!(err, WireError::InvalidField { field: "state", value: 9, .. }));
    }
}
