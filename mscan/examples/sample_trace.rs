//! Writes a small gzip-compressed trace exercising every record kind.
//!
//! ```bash
//! cargo run --example sample_trace -- /tmp/mtrace.out.gz
//! mscan /tmp/mtrace.out.gz
//! ```

use std::env;
use std::fs::File;
use std::io::{BufWriter, Write};

use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use mscan::decode::TraceWriter;
use mscan_common::{
    AccessEntry, AccessType, AppDataEntry, CallEntry, CallState, FcallEntry, HostEntry, HostType,
    LabelClass, LabelEntry, LockEntry, LockOp, MachineEntry, Payload, RecordMode, SchedEntry,
    SegmentEntry, TaskEntry, TaskType, TraceEntry, HOST_CALL_CPU_CURRENT,
};

const NUM_CPUS: u16 = 2;
const INODE: u64 = 0xffff_8800_0010_0000;
const PERCPU_BASE: u64 = 0xffff_8800_1000_0000;

/// Assigns access counts and per-cpu timestamps in log order
struct Clock {
    access_count: u64,
    ts: [u64; NUM_CPUS as usize],
}

impl Clock {
    fn entry(&mut self, cpu: u16, payload: Payload) -> TraceEntry {
        self.access_count += 1;
        self.ts[usize::from(cpu)] += 25;
        TraceEntry::new(cpu, self.access_count, self.ts[usize::from(cpu)], payload)
    }
}

fn host(host_type: HostType, mode: RecordMode, label: &str) -> Payload {
    Payload::Host(HostEntry {
        host_type,
        mode,
        call_cpu: HOST_CALL_CPU_CURRENT,
        label: label.to_string(),
    })
}

fn label(class: LabelClass, name: &str, addr: u64, bytes: u64) -> Payload {
    Payload::Label(LabelEntry {
        host_addr: addr & 0x0000_ffff_ffff_ffff,
        class,
        name: name.to_string(),
        guest_addr: addr,
        bytes,
        pc: 0xffff_ffff_8110_2030,
    })
}

fn access(addr: u64, traffic: bool, lock: bool) -> Payload {
    Payload::Access(AccessEntry {
        access_type: if lock { AccessType::Store } else { AccessType::Load },
        pc: 0xffff_ffff_8120_0400,
        host_addr: addr & 0x0000_ffff_ffff_ffff,
        guest_addr: addr,
        bytes: 8,
        traffic,
        lock,
    })
}

fn fcall(tag: u64, pc: u64, state: CallState) -> Payload {
    Payload::Fcall(FcallEntry { tid: 100, pc, tag, depth: 0, state })
}

fn lock(op: LockOp) -> Payload {
    Payload::Lock(LockEntry {
        pc: 0xffff_ffff_8130_0010,
        lock: INODE + 0x58,
        name: "i_lock".to_string(),
        op,
        read: false,
    })
}

fn sample() -> Vec<TraceEntry> {
    let mut clock = Clock { access_count: 0, ts: [0; NUM_CPUS as usize] };
    let mut c = |cpu: u16, payload: Payload| clock.entry(cpu, payload);

    vec![
        c(
            0,
            Payload::Machine(MachineEntry {
                num_cpus: NUM_CPUS,
                num_ram: 256 << 20,
                quantum: 1000,
                sample: 1,
                locked: true,
                calls: true,
            }),
        ),
        c(0, label(LabelClass::PerCpu, "runqueues", 0x80, 0x40)),
        c(
            0,
            Payload::Segment(SegmentEntry {
                base: PERCPU_BASE,
                end: PERCPU_BASE + 0x1000,
                class: LabelClass::PerCpu,
            }),
        ),
        c(
            0,
            Payload::Task(TaskEntry {
                task_type: TaskType::Init,
                tid: 100,
                tgid: 100,
                name: "bench".to_string(),
            }),
        ),
        c(1, Payload::Sched(SchedEntry { tid: 100 })),
        c(1, host(HostType::CallSetCpu, RecordMode::Disable, "")),
        c(0, host(HostType::AccessAllCpu, RecordMode::Movement, "open-close")),
        c(1, Payload::AppData(AppDataEntry { appdata_type: 1, value: 7 })),
        c(1, label(LabelClass::Heap, "struct inode", INODE, 0x230)),
        c(1, fcall(0x1, 0xffff_ffff_8140_0000, CallState::Start)),
        c(
            1,
            Payload::Call(CallEntry {
                target_pc: 0xffff_ffff_8150_0000,
                return_pc: 0xffff_ffff_8140_0010,
                ret: false,
            }),
        ),
        c(1, lock(LockOp::Acquire)),
        c(1, lock(LockOp::Acquired)),
        c(1, access(INODE + 0x60, true, false)),
        c(1, access(PERCPU_BASE + 0x88, false, true)),
        c(1, lock(LockOp::Release)),
        c(
            1,
            Payload::Call(CallEntry {
                target_pc: 0xffff_ffff_8140_0010,
                return_pc: 0,
                ret: true,
            }),
        ),
        c(1, fcall(0x1, 0xffff_ffff_8140_0020, CallState::Pause)),
        c(0, fcall(0x1, 0xffff_ffff_8140_0020, CallState::Resume)),
        c(0, fcall(0x1, 0xffff_ffff_8140_0030, CallState::Done)),
        c(0, label(LabelClass::Heap, "struct inode", INODE, 0)),
        c(0, host(HostType::AccessAllCpu, RecordMode::Disable, "")),
        c(
            0,
            Payload::Task(TaskEntry {
                task_type: TaskType::Exit,
                tid: 100,
                tgid: 100,
                name: "bench".to_string(),
            }),
        ),
    ]
}

fn main() -> Result<()> {
    let path = env::args().nth(1).unwrap_or_else(|| "mtrace.out.gz".to_string());
    let file = File::create(&path).with_context(|| format!("Failed to create {path}"))?;

    let mut writer =
        TraceWriter::new(GzEncoder::new(BufWriter::new(file), Compression::default()));
    for entry in sample() {
        writer.write(&entry)?;
    }
    let records = writer.records();
    writer.finish()?.finish()?.flush()?;

    println!("wrote {records} records to {path}");
    Ok(())
}
