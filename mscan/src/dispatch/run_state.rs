use std::collections::{BTreeMap, BTreeSet, HashMap};

use log::{debug, info};
use mscan_common::{
    EntryHeader, HostEntry, HostType, MachineEntry, Payload, RecordMode, TaskEntry, TaskType,
    TraceEntry,
};

use crate::domain::{CpuId, DecodeError};

/// A guest thread seen in task records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub tgid: u64,
    pub name: String,
}

/// Process-wide metadata carried by the out-of-band records
///
/// Host, machine, task, sched and app-data records never feed the
/// reconstruction state machines; they only update this.
#[derive(Debug, Default)]
pub struct RunState {
    mode: Option<RecordMode>,
    /// String attached to the latest record-mode change
    label: String,
    machine: Option<MachineEntry>,
    call_cpus: BTreeSet<CpuId>,
    uncounted_cpus: BTreeSet<CpuId>,
    tasks: HashMap<u64, TaskInfo>,
    /// Current tid per cpu
    running: Vec<Option<u64>>,
    app_data: BTreeMap<u16, u64>,
    /// Mode changes seen so far
    enables: u64,
    last_access_count: u64,
}

impl RunState {
    /// Update from any record; non-metadata records only advance the position
    ///
    /// # Errors
    /// Returns [`DecodeError::InvalidRecord`] for a host record naming a cpu
    /// that cannot exist
    pub fn apply(&mut self, entry: &TraceEntry) -> Result<(), DecodeError> {
        self.last_access_count = entry.access_count();
        match &entry.payload {
            Payload::Host(host) => self.on_host(&entry.header, host)?,
            Payload::Machine(machine) => {
                info!(
                    "machine: {} cpus, {} MB ram, locked={}, calls={}",
                    machine.num_cpus,
                    machine.num_ram >> 20,
                    machine.locked,
                    machine.calls
                );
                let cpus = usize::from(machine.num_cpus);
                if cpus > self.running.len() {
                    self.running.resize(cpus, None);
                }
                self.machine = Some(machine.clone());
            }
            Payload::Task(task) => self.on_task(task),
            Payload::Sched(sched) => {
                let cpu = usize::from(entry.cpu());
                if cpu >= self.running.len() {
                    self.running.resize(cpu + 1, None);
                }
                self.running[cpu] = Some(sched.tid);
            }
            Payload::AppData(app) => {
                self.app_data.insert(app.appdata_type, app.value);
            }
            _ => {}
        }
        Ok(())
    }

    fn on_host(&mut self, header: &EntryHeader, host: &HostEntry) -> Result<(), DecodeError> {
        let cpu = || {
            host.target_cpu(header.cpu).map(CpuId).map_err(|source| DecodeError::InvalidRecord {
                access_count: header.access_count,
                source,
            })
        };

        match host.host_type {
            HostType::AccessAllCpu => {
                self.enables += 1;
                self.mode = Some(host.mode);
                self.label.clone_from(&host.label);
                info!(
                    "record mode {} at access {} ({})",
                    host.mode.as_str(),
                    header.access_count,
                    if host.label.is_empty() { "-" } else { host.label.as_str() }
                );
            }
            HostType::CallSetCpu => {
                self.call_cpus.insert(cpu()?);
            }
            HostType::CallClearCpu => {
                self.call_cpus.remove(&cpu()?);
            }
            HostType::DisableCountCpu => {
                self.uncounted_cpus.insert(cpu()?);
            }
            HostType::EnableCountCpu => {
                self.uncounted_cpus.remove(&cpu()?);
            }
        }
        Ok(())
    }

    fn on_task(&mut self, task: &TaskEntry) {
        match task.task_type {
            TaskType::Init | TaskType::Update => {
                self.tasks
                    .insert(task.tid, TaskInfo { tgid: task.tgid, name: task.name.clone() });
            }
            TaskType::Exit => {
                if self.tasks.remove(&task.tid).is_none() {
                    debug!("exit of unknown tid {}", task.tid);
                }
            }
        }
    }

    /// Whether the guest has tracing switched on
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.mode.is_some_and(|mode| mode != RecordMode::Disable)
    }

    #[must_use]
    pub fn mode(&self) -> Option<RecordMode> {
        self.mode
    }

    /// String attached to the current enabled region
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn machine(&self) -> Option<&MachineEntry> {
        self.machine.as_ref()
    }

    /// Cpu count from the machine record, if it has arrived
    #[must_use]
    pub fn num_cpus(&self) -> Option<u16> {
        self.machine.as_ref().map(|machine| machine.num_cpus)
    }

    /// Whether call tracking is switched on for `cpu`
    #[must_use]
    pub fn calls_enabled(&self, cpu: CpuId) -> bool {
        self.call_cpus.contains(&cpu)
    }

    /// Whether accesses on `cpu` count towards totals
    #[must_use]
    pub fn counting(&self, cpu: CpuId) -> bool {
        !self.uncounted_cpus.contains(&cpu)
    }

    #[must_use]
    pub fn task(&self, tid: u64) -> Option<&TaskInfo> {
        self.tasks.get(&tid)
    }

    #[must_use]
    pub fn live_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Thread the guest scheduler last switched to on `cpu`
    #[must_use]
    pub fn running_tid(&self, cpu: CpuId) -> Option<u64> {
        self.running.get(cpu.index()).copied().flatten()
    }

    #[must_use]
    pub fn app_data(&self, appdata_type: u16) -> Option<u64> {
        self.app_data.get(&appdata_type).copied()
    }

    #[must_use]
    pub fn enables(&self) -> u64 {
        self.enables
    }

    /// `access_count` of the latest record applied
    #[must_use]
    pub fn last_access_count(&self) -> u64 {
        self.last_access_count
    }
}
