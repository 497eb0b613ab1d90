mod common;

use std::cell::RefCell;
use std::rc::Rc;

use mscan::dispatch::{Dispatcher, EntryHandler, ScanContext};
use mscan::domain::{DecodeError, ScanError};
use mscan::export::{JsonDict, JsonStream};
use mscan_common::{
    CallState, EntryKind, LabelClass, LockOp, Payload, RecordMode, SegmentEntry, TraceEntry,
};

use common::{access, fcall, label, lock, machine, record_mode, scan};

/// Looks up the owner of every access as it is dispatched
struct Owners(Rc<RefCell<Vec<Option<String>>>>);

impl EntryHandler for Owners {
    fn name(&self) -> &'static str {
        "owners"
    }

    fn kinds(&self) -> &'static [EntryKind] {
        &[EntryKind::Access]
    }

    fn handle(&mut self, entry: &TraceEntry, ctx: &ScanContext) -> Result<(), ScanError> {
        if let Payload::Access(access) = &entry.payload {
            let owner = ctx.objects.point_lookup(access.guest_addr).map(|obj| obj.name.clone());
            self.0.borrow_mut().push(owner);
        }
        Ok(())
    }

    fn exit(&mut self, _out: &JsonDict, _ctx: &ScanContext) -> Result<(), ScanError> {
        Ok(())
    }
}

#[test]
fn test_label_access_remove_resolves_object() {
    let owners = Rc::new(RefCell::new(Vec::new()));
    let mut dispatcher = Dispatcher::new(ScanContext::default());
    dispatcher.register(Box::new(Owners(Rc::clone(&owners))));

    let entries = vec![
        label(1, LabelClass::Heap, "obj1", 0x1000, 0x40),
        access(0, 2, 0x1008, false),
        label(3, LabelClass::Heap, "obj1", 0x1000, 0),
        access(0, 4, 0x1008, false),
    ];
    let stream = JsonStream::new(Vec::new()).unwrap();
    dispatcher.run(entries.into_iter().map(Ok), &stream.root()).unwrap();

    assert_eq!(*owners.borrow(), vec![Some("obj1".to_string()), None]);
}

#[test]
fn test_report_sections() {
    let entries = vec![
        machine(2),
        record_mode(1, RecordMode::Movement),
        label(2, LabelClass::Heap, "struct inode", 0x2000, 0x100),
        // call 0xa: start on cpu0, pause, resume on cpu1, done
        fcall(0, 3, 0xa, 0x100, CallState::Start),
        lock(0, 4, 100, 0x2040, LockOp::Acquire),
        lock(0, 5, 130, 0x2040, LockOp::Acquired),
        lock(0, 6, 140, 0x2040, LockOp::Acquire),
        access(0, 7, 0x2048, true),
        lock(0, 8, 150, 0x2040, LockOp::Release),
        lock(0, 9, 200, 0x2040, LockOp::Release),
        fcall(0, 10, 0xa, 0x110, CallState::Pause),
        fcall(1, 11, 0xa, 0x110, CallState::Resume),
        fcall(1, 12, 0xa, 0x120, CallState::Done),
    ];
    let report = scan(&entries, false).unwrap();

    let calls = report["call-intervals"].as_array().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0]["tag"], "0xa");
    let intervals = calls[0]["intervals"].as_array().unwrap();
    assert_eq!(intervals.len(), 2);
    assert_eq!(intervals[0]["cpu"], 0);
    assert_eq!(intervals[1]["cpu"], 1);
    assert_eq!(intervals[0]["next"], intervals[1]["id"]);
    assert_eq!(intervals[1]["prev"], intervals[0]["id"]);
    assert!(intervals[0]["prev"].is_null());

    let summary = &report["summary"];
    assert_eq!(summary["entries"], 13);
    assert_eq!(summary["per-kind"]["lock"], 5);
    assert_eq!(summary["machine"]["ncpu"], 2);
    assert_eq!(summary["objects"]["heap"]["live"], 1);
    assert_eq!(summary["traffic-accesses"], 1);

    let locks = report["serial-sections"]["locks"].as_array().unwrap();
    assert_eq!(locks.len(), 1, "nested acquires form one section");
    let section = &locks[0];
    assert_eq!(section["acquires"], 1);
    assert_eq!(section["spin-cycles"], 30);
    assert_eq!(section["hold-cycles"], 70);
    assert_eq!(section["coherence-miss"], 1);
    assert_eq!(section["lock"], "0x2040");
    assert_eq!(section["addr"], "struct inode+0x40");
    assert_eq!(section["per-acquire-pc"][0]["info"], "0xffffffff81300000");
    assert_eq!(section["cacheline-sharers"], serde_json::json!([]));
}

#[test]
fn test_report_lists_cacheline_sharers() {
    let entries = vec![
        machine(1),
        record_mode(0, RecordMode::Movement),
        label(1, LabelClass::Heap, "struct file", 0x3000, 0x20),
        label(2, LabelClass::Heap, "struct pid", 0x3020, 0x10),
        label(3, LabelClass::Heap, "struct cred", 0x3030, 0x40),
        lock(0, 4, 10, 0x3008, LockOp::Acquire),
        lock(0, 5, 20, 0x3008, LockOp::Acquired),
        lock(0, 6, 50, 0x3008, LockOp::Release),
    ];
    let report = scan(&entries, false).unwrap();

    let section = &report["serial-sections"]["locks"][0];
    assert_eq!(section["addr"], "struct file+0x8");
    assert_eq!(section["cacheline-sharers"], serde_json::json!(["struct pid", "struct cred"]));
}

#[test]
fn test_dump_lists_every_record() {
    let entries = common::every_kind();
    let report = scan(&entries, true).unwrap();

    let dumped = report["entries"].as_array().unwrap();
    assert_eq!(dumped.len(), entries.len());
    assert!(report.get("summary").is_none());

    assert_eq!(dumped[0]["type"], "machine");
    assert_eq!(dumped[0]["ncpu"], 4);
    assert_eq!(dumped[1]["label"], "struct inode");
    assert_eq!(dumped[1]["guest_addr"], "0xffff880000001000");
    assert_eq!(dumped[3]["call_cpu"], "cur");
    assert_eq!(dumped[4]["state"], "resume");
    assert_eq!(dumped[10]["appval"], u64::MAX);
}

#[test]
fn test_dump_ignores_object_index_errors() {
    let heap_segment = TraceEntry::new(
        0,
        2,
        2,
        Payload::Segment(SegmentEntry { base: 0x1000, end: 0x2000, class: LabelClass::Heap }),
    );
    let entries = vec![machine(1), heap_segment];

    let err = scan(&entries, false).unwrap_err();
    assert!(matches!(err, ScanError::Label(_)));

    let report = scan(&entries, true).unwrap();
    let dumped = report["entries"].as_array().unwrap();
    assert_eq!(dumped.len(), 2);
    assert_eq!(dumped[1]["object_type"], "heap");
    assert_eq!(dumped[1]["baseaddr"], "0x1000");
}

#[test]
fn test_corrupt_trace_aborts_scan() {
    let mut dispatcher = Dispatcher::new(ScanContext::default());
    let entries = vec![Ok(machine(1)), Err(DecodeError::Truncated { offset: 58 })];
    let stream = JsonStream::new(Vec::new()).unwrap();

    let err = dispatcher.run(entries, &stream.root()).unwrap_err();
    assert!(err.to_string().contains("offset 58"));
    assert_eq!(dispatcher.stats().entries, 1);
}

#[test]
fn test_busy_cpu_is_fatal() {
    let entries = vec![
        fcall(0, 1, 0xa, 0x100, CallState::Start),
        fcall(0, 2, 0xb, 0x200, CallState::Start),
    ];
    let err = scan(&entries, false).unwrap_err();
    assert!(matches!(err, ScanError::CallStack(_)));
}
