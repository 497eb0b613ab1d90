//! # mscan - Offline mtrace Log Analysis
//!
//! mscan reads the binary log written by an instrumented hypervisor (every
//! guest memory access, lock operation, call transition and object
//! allocation across all virtual cpus) and reconstructs the state the guest
//! was in at each point: which object owns an address, which call each cpu
//! is executing, which locks are held. Analyses consume that state and write
//! one JSON report.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │            Trace log (mtrace.out, optionally gzipped)           │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ packed native-endian records
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  decode::TraceReader  ──►  dispatch::Dispatcher                 │
//! │                               │                                 │
//! │             ┌─────────────────┼──────────────────┐              │
//! │             ▼                 ▼                  ▼              │
//! │      ScanContext        call-intervals     serial-sections      │
//! │   (RunState, objects)  (callstack::*)      (locks::*)  summary  │
//! │             │                 │                  │              │
//! │             ▼                 └────────┬─────────┘              │
//! │      symbolization                     ▼                        │
//! │   (addr2line, types)          export::JsonStream                │
//! └─────────────────────────────────────────┬───────────────────────┘
//!                                           ▼
//!                                   report.json / stdout
//! ```
//!
//! ## Module Structure
//!
//! ### Reconstruction
//!
//! - [`decode`]: lazy record decoder and matching encoder
//! - [`objects`]: live object index (labels, static symbols, per-cpu copies)
//! - [`callstack`]: per-cpu call-tag state machine and call timelines
//! - [`locks`]: nested lock holds turned into critical sections
//!
//! ### Plumbing
//!
//! - [`dispatch`]: routes records to analyses, owns the shared scan context
//! - [`export`]: streaming JSON writer with bounded memory
//! - [`symbolization`]: pc and field-offset descriptions
//! - [`analysis`]: the built-in analyses and the record dump
//! - [`config`], [`cli`]: tolerances and command-line arguments
//! - [`domain`]: newtypes and error enums
//!
//! ## Typical Usage
//!
//! ```bash
//! # Summary, serial sections and call intervals to stdout
//! mscan mtrace.out.gz
//!
//! # Symbolized report with static objects from the kernel image
//! mscan mtrace.out.gz -o report.json --vmlinux vmlinux --symbols vmlinux.syms
//!
//! # Raw records
//! mscan mtrace.out.gz --dump
//! ```
//!
//! ## Key Concepts
//!
//! - **access count**: global logical order of records across cpus; per-cpu
//!   timestamps are only comparable within one cpu
//! - **call tag**: identity of one logical call activation, which may pause
//!   on one cpu and resume on another
//! - **tolerated miss**: inconsistencies the guest instrumentation is known
//!   to produce occasionally; counted, and fatal only past a threshold

pub mod analysis;
pub mod callstack;
pub mod cli;
pub mod config;
pub mod decode;
pub mod dispatch;
pub mod domain;
pub mod export;
pub mod locks;
pub mod objects;
pub mod symbolization;
