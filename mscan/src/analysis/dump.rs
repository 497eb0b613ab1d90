//! `--dump`: every decoded record as one JSON dict, in log order.

use mscan_common::{EntryKind, Payload, TraceEntry, HOST_CALL_CPU_CURRENT};

use crate::dispatch::{EntryHandler, ScanContext};
use crate::domain::{ScanError, SerializeError};
use crate::export::{Hex, JsonDict, JsonList};

#[derive(Default)]
pub struct EntryDump {
    out: Option<JsonList>,
}

impl EntryDump {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Write the fields of one record into `dict`
///
/// # Errors
/// Propagates output errors
pub fn write_entry(dict: &JsonDict, entry: &TraceEntry) -> Result<(), SerializeError> {
    dict.put("type", entry.kind().name())?;
    dict.put("cpu", &entry.cpu())?;
    dict.put("access_count", &entry.access_count())?;
    dict.put("ts", &entry.ts())?;

    match &entry.payload {
        Payload::Label(label) => {
            dict.put("label_type", label.class.as_str())?;
            dict.put("label", &label.name)?;
            dict.put("pc", &Hex(label.pc))?;
            dict.put("host_addr", &Hex(label.host_addr))?;
            dict.put("guest_addr", &Hex(label.guest_addr))?;
            dict.put("bytes", &label.bytes)?;
        }
        Payload::Access(access) => {
            dict.put("acctype", access.access_type.as_str())?;
            dict.put("pc", &Hex(access.pc))?;
            dict.put("host_addr", &Hex(access.host_addr))?;
            dict.put("guest_addr", &Hex(access.guest_addr))?;
            dict.put("bytes", &access.bytes)?;
            dict.put("traffic", &access.traffic)?;
            dict.put("lock", &access.lock)?;
        }
        Payload::Host(host) => {
            dict.put("host_type", host.host_type.as_str())?;
            dict.put("mode", host.mode.as_str())?;
            if host.call_cpu == HOST_CALL_CPU_CURRENT {
                dict.put("call_cpu", "cur")?;
            } else {
                dict.put("call_cpu", &host.call_cpu)?;
            }
            dict.put("access_str", &host.label)?;
        }
        Payload::Fcall(fcall) => {
            dict.put("tid", &fcall.tid)?;
            dict.put("pc", &Hex(fcall.pc))?;
            dict.put("tag", &Hex(fcall.tag))?;
            dict.put("depth", &fcall.depth)?;
            dict.put("state", fcall.state.as_str())?;
        }
        Payload::Segment(segment) => {
            dict.put("object_type", segment.class.as_str())?;
            dict.put("baseaddr", &Hex(segment.base))?;
            dict.put("endaddr", &Hex(segment.end))?;
        }
        Payload::Call(call) => {
            dict.put("ret", &call.ret)?;
            dict.put("target_pc", &Hex(call.target_pc))?;
            dict.put("return_pc", &Hex(call.return_pc))?;
        }
        Payload::Lock(lock) => {
            dict.put("op", lock.op.as_str())?;
            dict.put("pc", &Hex(lock.pc))?;
            dict.put("lock", &Hex(lock.lock))?;
            dict.put("str", &lock.name)?;
            dict.put("read", &lock.read)?;
        }
        Payload::Task(task) => {
            dict.put("tasktype", task.task_type.as_str())?;
            dict.put("tid", &task.tid)?;
            dict.put("tgid", &task.tgid)?;
            dict.put("str", &task.name)?;
        }
        Payload::Sched(sched) => {
            dict.put("tid", &sched.tid)?;
        }
        Payload::Machine(machine) => {
            dict.put("ncpu", &machine.num_cpus)?;
            dict.put("nram", &machine.num_ram)?;
            dict.put("quantum", &machine.quantum)?;
            dict.put("sample", &machine.sample)?;
            dict.put("locked", &machine.locked)?;
            dict.put("calls", &machine.calls)?;
        }
        Payload::AppData(app) => {
            dict.put("apptype", &app.appdata_type)?;
            dict.put("appval", &app.value)?;
        }
    }
    dict.done()
}

impl EntryHandler for EntryDump {
    fn name(&self) -> &'static str {
        "dump"
    }

    fn kinds(&self) -> &'static [EntryKind] {
        &EntryKind::ALL
    }

    fn init(&mut self, out: &JsonDict) -> Result<(), ScanError> {
        self.out = Some(out.put_list("entries")?);
        Ok(())
    }

    fn handle(&mut self, entry: &TraceEntry, _ctx: &ScanContext) -> Result<(), ScanError> {
        if let Some(list) = &self.out {
            write_entry(&list.append_dict()?, entry)?;
        }
        Ok(())
    }

    fn exit(&mut self, _out: &JsonDict, _ctx: &ScanContext) -> Result<(), ScanError> {
        if let Some(list) = self.out.take() {
            list.done()?;
        }
        Ok(())
    }
}
