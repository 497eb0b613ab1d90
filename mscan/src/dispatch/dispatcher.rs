use log::{debug, info};
use mscan_common::{EntryKind, TraceEntry};

use super::context::ScanContext;
use crate::domain::{DecodeError, ScanError};
use crate::export::JsonDict;

const NUM_KINDS: usize = EntryKind::ALL.len();

/// An analysis fed by the [`Dispatcher`]
///
/// A handler only sees the record kinds it lists in [`kinds`](Self::kinds).
/// `init` runs before the first record and is where streaming analyses open
/// their output collection; `exit` runs after the last record.
pub trait EntryHandler {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Record kinds routed to this handler
    fn kinds(&self) -> &'static [EntryKind];

    /// # Errors
    /// Propagates output errors
    fn init(&mut self, _out: &JsonDict) -> Result<(), ScanError> {
        Ok(())
    }

    /// # Errors
    /// Any error aborts the scan
    fn handle(&mut self, entry: &TraceEntry, ctx: &ScanContext) -> Result<(), ScanError>;

    /// # Errors
    /// Any error aborts the scan
    fn exit(&mut self, out: &JsonDict, ctx: &ScanContext) -> Result<(), ScanError>;
}

/// Totals for one scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub entries: u64,
    pub per_kind: [u64; NUM_KINDS],
    pub last_access_count: u64,
}

impl RunStats {
    #[must_use]
    pub fn count(&self, kind: EntryKind) -> u64 {
        self.per_kind[kind.index()]
    }
}

/// Feeds decoded records to the registered analyses in log order
pub struct Dispatcher {
    handlers: Vec<Box<dyn EntryHandler>>,
    /// Handler indices per kind, in registration order
    routes: [Vec<usize>; NUM_KINDS],
    ctx: ScanContext,
    stats: RunStats,
    /// Log progress every this many records; 0 disables
    progress_interval: u64,
}

impl Dispatcher {
    #[must_use]
    pub fn new(ctx: ScanContext) -> Self {
        Self {
            handlers: Vec::new(),
            routes: Default::default(),
            ctx,
            stats: RunStats::default(),
            progress_interval: 0,
        }
    }

    #[must_use]
    pub fn with_progress_interval(mut self, interval: u64) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn register(&mut self, handler: Box<dyn EntryHandler>) {
        let idx = self.handlers.len();
        for kind in handler.kinds() {
            self.routes[kind.index()].push(idx);
        }
        debug!("registered {} for {} kinds", handler.name(), handler.kinds().len());
        self.handlers.push(handler);
    }

    /// Apply one record to the shared state, then to every handler routed for it
    ///
    /// # Errors
    /// Returns the first error from the shared state or a handler
    pub fn dispatch(&mut self, entry: &TraceEntry) -> Result<(), ScanError> {
        self.stats.entries += 1;
        self.stats.per_kind[entry.kind().index()] += 1;
        self.stats.last_access_count = entry.access_count();

        self.ctx.apply(entry)?;
        for &idx in &self.routes[entry.kind().index()] {
            self.handlers[idx].handle(entry, &self.ctx)?;
        }

        if self.progress_interval > 0 && self.stats.entries % self.progress_interval == 0 {
            info!(
                "{} entries scanned (access {}, {} live objects)",
                self.stats.entries,
                self.stats.last_access_count,
                self.ctx.objects.live_count()
            );
        }
        Ok(())
    }

    /// Run a whole scan: init every handler, dispatch every record, exit every handler
    ///
    /// # Errors
    /// Stops at the first decode, state or output error
    pub fn run<I>(&mut self, entries: I, out: &JsonDict) -> Result<&RunStats, ScanError>
    where
        I: IntoIterator<Item = Result<TraceEntry, DecodeError>>,
    {
        for handler in &mut self.handlers {
            handler.init(out)?;
        }

        for entry in entries {
            self.dispatch(&entry?)?;
        }

        info!("scan complete: {} entries", self.stats.entries);
        for handler in &mut self.handlers {
            debug!("finishing {}", handler.name());
            handler.exit(out, &self.ctx)?;
        }
        Ok(&self.stats)
    }

    #[must_use]
    pub fn context(&self) -> &ScanContext {
        &self.ctx
    }

    #[must_use]
    pub fn stats(&self) -> &RunStats {
        &self.stats
    }
}
