//! Builders shared by the integration tests
#![allow(dead_code)]

use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;
use mscan::analysis;
use mscan::config::ScanConfig;
use mscan::decode::{TraceReader, TraceWriter};
use mscan::dispatch::Dispatcher;
use mscan::domain::ScanError;
use mscan::export::JsonStream;
use mscan_common::{
    AccessEntry, AccessType, AppDataEntry, CallEntry, CallState, FcallEntry, HostEntry, HostType,
    LabelClass, LabelEntry, LockEntry, LockOp, MachineEntry, Payload, RecordMode, SchedEntry,
    SegmentEntry, TaskEntry, TaskType, TraceEntry, HOST_CALL_CPU_CURRENT,
};
use tempfile::NamedTempFile;

pub fn label(ac: u64, class: LabelClass, name: &str, addr: u64, bytes: u64) -> TraceEntry {
    TraceEntry::new(
        0,
        ac,
        ac * 10,
        Payload::Label(LabelEntry {
            host_addr: addr + 0x7f00_0000_0000,
            class,
            name: name.to_string(),
            guest_addr: addr,
            bytes,
            pc: 0xffff_ffff_8100_0000,
        }),
    )
}

pub fn access(cpu: u16, ac: u64, addr: u64, traffic: bool) -> TraceEntry {
    TraceEntry::new(
        cpu,
        ac,
        ac * 10,
        Payload::Access(AccessEntry {
            access_type: AccessType::Store,
            pc: 0xffff_ffff_8120_0000,
            host_addr: addr + 0x7f00_0000_0000,
            guest_addr: addr,
            bytes: 8,
            traffic,
            lock: false,
        }),
    )
}

pub fn record_mode(ac: u64, mode: RecordMode) -> TraceEntry {
    TraceEntry::new(
        0,
        ac,
        ac * 10,
        Payload::Host(HostEntry {
            host_type: HostType::AccessAllCpu,
            mode,
            call_cpu: 0,
            label: "bench".to_string(),
        }),
    )
}

pub fn machine(num_cpus: u16) -> TraceEntry {
    TraceEntry::new(
        0,
        0,
        0,
        Payload::Machine(MachineEntry {
            num_cpus,
            num_ram: 512 << 20,
            quantum: 1000,
            sample: 1,
            locked: true,
            calls: true,
        }),
    )
}

pub fn fcall(cpu: u16, ac: u64, tag: u64, pc: u64, state: CallState) -> TraceEntry {
    TraceEntry::new(
        cpu,
        ac,
        ac * 10,
        Payload::Fcall(FcallEntry { tid: 42, pc, tag, depth: 1, state }),
    )
}

pub fn lock(cpu: u16, ac: u64, ts: u64, addr: u64, op: LockOp) -> TraceEntry {
    TraceEntry::new(
        cpu,
        ac,
        ts,
        Payload::Lock(LockEntry {
            pc: 0xffff_ffff_8130_0000,
            lock: addr,
            name: "inode_lock".to_string(),
            op,
            read: false,
        }),
    )
}

/// One record of every kind, every field set
pub fn every_kind() -> Vec<TraceEntry> {
    vec![
        machine(4),
        label(1, LabelClass::Heap, "struct inode", 0xffff_8800_0000_1000, 0x230),
        access(1, 2, 0xffff_8800_0000_1010, true),
        TraceEntry::new(
            2,
            3,
            30,
            Payload::Host(HostEntry {
                host_type: HostType::CallSetCpu,
                mode: RecordMode::Ascope,
                call_cpu: HOST_CALL_CPU_CURRENT,
                label: "xv6-bench".to_string(),
            }),
        ),
        fcall(3, 4, 0xdead, 0xffff_ffff_8140_0000, CallState::Resume),
        TraceEntry::new(
            0,
            5,
            50,
            Payload::Segment(SegmentEntry {
                base: 0xffff_8800_1000_0000,
                end: 0xffff_8800_1001_0000,
                class: LabelClass::PerCpu,
            }),
        ),
        TraceEntry::new(
            1,
            6,
            60,
            Payload::Call(CallEntry { target_pc: 0x1234, return_pc: 0x5678, ret: true }),
        ),
        lock(2, 7, 70, 0xffff_8800_0000_1058, LockOp::Acquired),
        TraceEntry::new(
            3,
            8,
            80,
            Payload::Task(TaskEntry {
                task_type: TaskType::Update,
                tid: 77,
                tgid: 70,
                name: "kworker/3:1".to_string(),
            }),
        ),
        TraceEntry::new(0, 9, 90, Payload::Sched(SchedEntry { tid: 77 })),
        TraceEntry::new(
            1,
            10,
            100,
            Payload::AppData(AppDataEntry { appdata_type: 3, value: u64::MAX }),
        ),
    ]
}

pub fn encode(entries: &[TraceEntry]) -> Vec<u8> {
    let mut writer = TraceWriter::new(Vec::new());
    for entry in entries {
        writer.write(entry).unwrap();
    }
    writer.finish().unwrap()
}

pub fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}

pub fn write_file(bytes: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(bytes).unwrap();
    file.flush().unwrap();
    file
}

/// Run a full scan over `entries` and parse the report
///
/// # Errors
/// Returns the scan error, if any
pub fn scan(entries: &[TraceEntry], dump: bool) -> Result<serde_json::Value, ScanError> {
    let trace = write_file(&encode(entries));
    let out = NamedTempFile::new().unwrap();

    let stream = JsonStream::new(out.as_file().try_clone().unwrap())?;
    let root = stream.root();
    let config = ScanConfig::default();
    let mut dispatcher = Dispatcher::new(analysis::context(&config, dump));
    analysis::register(&mut dispatcher, &config, dump);

    dispatcher.run(TraceReader::open(trace.path())?, &root)?;
    root.done()?;
    stream.finish()?;

    let text = std::fs::read_to_string(out.path()).unwrap();
    Ok(serde_json::from_str(&text).unwrap())
}
