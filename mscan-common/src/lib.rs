//! # Trace Record Schema (hypervisor ↔ analysis tools)
//!
//! Defines the on-disk layout of the binary trace log written by the
//! instrumented hypervisor and read by `mscan`. Every record is a fixed
//! header followed by a kind-specific payload, packed and native-endian.
//!
//! ## Layout
//!
//! ```text
//! ┌──────────┬────────┬────────┬──────────────┬────────────┬─────────────────┐
//! │ kind u32 │ size   │ cpu    │ access_count │ timestamp  │ payload ...     │
//! │          │ u16    │ u16    │ u64          │ u64        │ (per kind)      │
//! └──────────┴────────┴────────┴──────────────┴────────────┴─────────────────┘
//!  ◄──────────────────────── 24 byte header ──────────────►
//! ```
//!
//! `size` covers the whole record, header included. Readers accept records
//! whose declared size is larger than the payload they know about (trailing
//! bytes are skipped) but never larger than [`MAX_ENTRY_SIZE`].
//!
//! ## Key Types
//!
//! - [`TraceEntry`] - one decoded record (header + payload)
//! - [`Payload`] - the closed set of record payloads
//! - [`EntryKind`] - the record discriminant written in the header
//!
//! Field-by-field encoding lives in [`wire`].

pub mod wire;

pub use wire::WireError;

// ============================================================================
// Layout Constants
// ============================================================================

/// Version of the record layout described by this crate.
///
/// Version 1 logs (no timestamp in the header, no lock or machine records)
/// are a legacy layout and are not decoded.
pub const SCHEMA_VERSION: u32 = 2;

/// Size of [`EntryHeader`] on disk
pub const HEADER_SIZE: usize = 24;

/// Fixed width of every name/string field, NUL padded
pub const NAME_LEN: usize = 32;

/// Largest record any known kind produces (a label record)
pub const MAX_ENTRY_SIZE: usize = HEADER_SIZE + EntryKind::Label.payload_size();

// ============================================================================
// Record Kinds
// ============================================================================

/// Discriminant stored in the `kind` field of every header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntryKind {
    /// An object allocation or free
    Label = 1,
    /// A guest memory access
    Access = 2,
    /// Host control: record mode changes, per-cpu call tracking
    Host = 3,
    /// A call-stack transition (start / pause / resume / done)
    Fcall = 4,
    /// Runtime base address for a label class (per-cpu areas)
    Segment = 5,
    /// A nested call or return inside an active call stack
    Call = 6,
    /// A lock operation
    Lock = 7,
    /// Guest thread lifecycle
    Task = 8,
    /// Guest scheduler switched threads on a cpu
    Sched = 9,
    /// Machine description, written once near the start of the log
    Machine = 10,
    /// Application-defined value
    AppData = 11,
}

impl EntryKind {
    /// Every kind, in tag order
    pub const ALL: [EntryKind; 11] = [
        EntryKind::Label,
        EntryKind::Access,
        EntryKind::Host,
        EntryKind::Fcall,
        EntryKind::Segment,
        EntryKind::Call,
        EntryKind::Lock,
        EntryKind::Task,
        EntryKind::Sched,
        EntryKind::Machine,
        EntryKind::AppData,
    ];

    /// Map a header tag to a kind
    #[must_use]
    pub fn from_tag(tag: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.tag() == tag)
    }

    /// The tag written in the header
    #[must_use]
    pub const fn tag(self) -> u32 {
        self as u32
    }

    /// Dense index (0-based) for per-kind tables
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize - 1
    }

    /// Number of payload bytes following the header
    #[must_use]
    pub const fn payload_size(self) -> usize {
        match self {
            // host_addr, class, name, guest_addr, bytes, pc
            EntryKind::Label => 8 + 4 + NAME_LEN + 8 + 8 + 8,
            // type, pc, host_addr, guest_addr, bytes, traffic, lock
            EntryKind::Access => 4 + 8 + 8 + 8 + 4 + 1 + 1,
            // host_type, mode, call_cpu, str
            EntryKind::Host => 4 + 4 + 8 + NAME_LEN,
            // tid, pc, tag, depth, state
            EntryKind::Fcall => 8 + 8 + 8 + 2 + 4,
            // base, end, class
            EntryKind::Segment => 8 + 8 + 4,
            // target_pc, return_pc, ret
            EntryKind::Call => 8 + 8 + 4,
            // pc, lock, name, op, read
            EntryKind::Lock => 8 + 8 + NAME_LEN + 4 + 1,
            // task_type, tid, tgid, str
            EntryKind::Task => 4 + 8 + 8 + NAME_LEN,
            // tid
            EntryKind::Sched => 8,
            // num_cpus, num_ram, quantum, sample, locked, calls
            EntryKind::Machine => 2 + 8 + 8 + 8 + 1 + 1,
            // appdata_type, value
            EntryKind::AppData => 2 + 8,
        }
    }

    /// Total on-disk size of a record of this kind
    #[must_use]
    pub const fn record_size(self) -> usize {
        HEADER_SIZE + self.payload_size()
    }

    /// Short lowercase name used in reports
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            EntryKind::Label => "label",
            EntryKind::Access => "access",
            EntryKind::Host => "host",
            EntryKind::Fcall => "fcall",
            EntryKind::Segment => "segment",
            EntryKind::Call => "call",
            EntryKind::Lock => "lock",
            EntryKind::Task => "task",
            EntryKind::Sched => "sched",
            EntryKind::Machine => "machine",
            EntryKind::AppData => "app",
        }
    }
}

// ============================================================================
// Payload Enumerations
// ============================================================================

/// Declares a `u32`-backed wire enum with a fallible tag conversion.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $( $(#[$vmeta:meta])* $variant:ident = $value:literal => $label:literal ),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $value ),+
        }

        impl $name {
            /// Decode a raw tag
            #[must_use]
            pub fn from_raw(raw: u32) -> Option<Self> {
                match raw {
                    $( $value => Some($name::$variant), )+
                    _ => None,
                }
            }

            /// The raw tag written on disk
            #[must_use]
            pub const fn raw(self) -> u32 {
                self as u32
            }

            /// Short name used in reports and dumps
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $( $name::$variant => $label, )+
                }
            }
        }
    };
}

wire_enum! {
    /// Kind of object a label describes
    LabelClass {
        /// kmalloc and friends
        Heap = 1 => "heap",
        /// page allocator
        Block = 2 => "block",
        /// .data, .bss, .rodata
        Static = 3 => "static",
        /// .data..percpu, base address set at runtime by a segment record
        PerCpu = 4 => "percpu",
    }
}

impl LabelClass {
    /// Every class, dynamic classes first
    pub const ALL: [LabelClass; 4] =
        [LabelClass::Heap, LabelClass::Block, LabelClass::Static, LabelClass::PerCpu];

    /// Short-lived allocations (heap and block) as opposed to long-lived objects
    #[must_use]
    pub const fn is_dynamic(self) -> bool {
        matches!(self, LabelClass::Heap | LabelClass::Block)
    }

    /// Dense index (0-based) for per-class tables
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize - 1
    }
}

wire_enum! {
    /// Type of a guest memory access
    AccessType {
        Load = 1 => "ld",
        Store = 2 => "st",
        /// IO write, which actually lands in RAM
        IoWrite = 3 => "iw",
    }
}

wire_enum! {
    /// Transition carried by an fcall record
    CallState {
        Start = 1 => "start",
        Done = 2 => "done",
        Resume = 3 => "resume",
        Pause = 4 => "pause",
    }
}

wire_enum! {
    /// Lock operation
    LockOp {
        Release = 1 => "release",
        /// The cpu started trying to take the lock
        Acquire = 2 => "acquire",
        /// The cpu actually holds the lock
        Acquired = 3 => "acquired",
    }
}

wire_enum! {
    /// Type of a host control record
    HostType {
        /// Record mode changed for all cpus (the global enable/disable switch)
        AccessAllCpu = 1 => "access_all_cpu",
        CallSetCpu = 2 => "call_set_cpu",
        CallClearCpu = 3 => "call_clear_cpu",
        DisableCountCpu = 4 => "disable_count_cpu",
        EnableCountCpu = 5 => "enable_count_cpu",
    }
}

wire_enum! {
    /// Record mode set by an `AccessAllCpu` host record
    RecordMode {
        Disable = 0 => "disable",
        Movement = 1 => "movement",
        Ascope = 2 => "ascope",
    }
}

wire_enum! {
    /// Guest thread lifecycle event
    TaskType {
        Init = 1 => "init",
        Update = 2 => "update",
        Exit = 3 => "exit",
    }
}

/// `call_cpu` value in a host record meaning "the cpu that wrote the record"
pub const HOST_CALL_CPU_CURRENT: u64 = u64::MAX;

// ============================================================================
// Records
// ============================================================================

/// Common header of every record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    pub kind: EntryKind,
    /// Declared record size, header included
    pub size: u16,
    /// Virtual cpu that produced the record
    pub cpu: u16,
    /// Global logical order, monotonically increasing across all cpus
    pub access_count: u64,
    /// Per-core timestamp (cycles); only comparable within one cpu
    pub ts: u64,
}

/// Object allocation (`bytes != 0`) or free (`bytes == 0`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelEntry {
    pub host_addr: u64,
    pub class: LabelClass,
    pub name: String,
    pub guest_addr: u64,
    pub bytes: u64,
    /// Allocation call site
    pub pc: u64,
}

impl LabelEntry {
    /// A zero-sized label retires the object at `guest_addr`
    #[must_use]
    pub fn is_removal(&self) -> bool {
        self.bytes == 0
    }
}

/// A guest memory access
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessEntry {
    pub access_type: AccessType,
    pub pc: u64,
    pub host_addr: u64,
    pub guest_addr: u64,
    pub bytes: u32,
    /// The access moved a cache line between cpus
    pub traffic: bool,
    /// The access was a locked (atomic) instruction
    pub lock: bool,
}

/// Host control record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub host_type: HostType,
    /// Meaningful for [`HostType::AccessAllCpu`]
    pub mode: RecordMode,
    /// Meaningful for the call set/clear types; [`HOST_CALL_CPU_CURRENT`] means the writer's cpu
    pub call_cpu: u64,
    /// Free-form label for the enabled region (e.g. a benchmark name)
    pub label: String,
}

impl HostEntry {
    /// Cpu a per-cpu host record applies to
    ///
    /// # Errors
    /// Returns [`WireError::InvalidCallCpu`] when `call_cpu` is neither a
    /// cpu id nor [`HOST_CALL_CPU_CURRENT`]
    pub fn target_cpu(&self, writer_cpu: u16) -> Result<u16, WireError> {
        if self.call_cpu == HOST_CALL_CPU_CURRENT {
            return Ok(writer_cpu);
        }
        u16::try_from(self.call_cpu).map_err(|_| WireError::InvalidCallCpu(self.call_cpu))
    }
}

/// Call-stack transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FcallEntry {
    pub tid: u64,
    pub pc: u64,
    /// Unique identifier of one logical call activation
    pub tag: u64,
    pub depth: u16,
    pub state: CallState,
}

/// Runtime base for a label class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentEntry {
    pub base: u64,
    pub end: u64,
    pub class: LabelClass,
}

/// Nested call (`ret == false`) or return (`ret == true`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallEntry {
    pub target_pc: u64,
    pub return_pc: u64,
    pub ret: bool,
}

/// Lock operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockEntry {
    pub pc: u64,
    /// Lock identity (the lock's guest address)
    pub lock: u64,
    pub name: String,
    pub op: LockOp,
    /// Reader side of a reader/writer lock
    pub read: bool,
}

/// Guest thread lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEntry {
    pub task_type: TaskType,
    pub tid: u64,
    pub tgid: u64,
    pub name: String,
}

/// Guest scheduler switch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedEntry {
    pub tid: u64,
}

/// Machine description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineEntry {
    pub num_cpus: u16,
    pub num_ram: u64,
    pub quantum: u64,
    pub sample: u64,
    /// Locked-instruction flags are recorded
    pub locked: bool,
    /// Call/return records are recorded
    pub calls: bool,
}

/// Application-defined value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDataEntry {
    pub appdata_type: u16,
    pub value: u64,
}

/// The closed set of record payloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Label(LabelEntry),
    Access(AccessEntry),
    Host(HostEntry),
    Fcall(FcallEntry),
    Segment(SegmentEntry),
    Call(CallEntry),
    Lock(LockEntry),
    Task(TaskEntry),
    Sched(SchedEntry),
    Machine(MachineEntry),
    AppData(AppDataEntry),
}

impl Payload {
    /// Record kind carrying this payload
    #[must_use]
    pub fn kind(&self) -> EntryKind {
        match self {
            Payload::Label(_) => EntryKind::Label,
            Payload::Access(_) => EntryKind::Access,
            Payload::Host(_) => EntryKind::Host,
            Payload::Fcall(_) => EntryKind::Fcall,
            Payload::Segment(_) => EntryKind::Segment,
            Payload::Call(_) => EntryKind::Call,
            Payload::Lock(_) => EntryKind::Lock,
            Payload::Task(_) => EntryKind::Task,
            Payload::Sched(_) => EntryKind::Sched,
            Payload::Machine(_) => EntryKind::Machine,
            Payload::AppData(_) => EntryKind::AppData,
        }
    }
}

/// One decoded record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    pub header: EntryHeader,
    pub payload: Payload,
}

impl TraceEntry {
    /// Build a record whose header kind and size match `payload`
    #[must_use]
    pub fn new(cpu: u16, access_count: u64, ts: u64, payload: Payload) -> Self {
        let kind = payload.kind();
        #[allow(clippy::cast_possible_truncation)]
        let size = kind.record_size() as u16;
        Self { header: EntryHeader { kind, size, cpu, access_count, ts }, payload }
    }

    #[must_use]
    pub fn kind(&self) -> EntryKind {
        self.header.kind
    }

    #[must_use]
    pub fn cpu(&self) -> u16 {
        self.header.cpu
    }

    #[must_use]
    pub fn access_count(&self) -> u64 {
        self.header.access_count
    }

    #[must_use]
    pub fn ts(&self) -> u64 {
        self.header.ts
    }
}
