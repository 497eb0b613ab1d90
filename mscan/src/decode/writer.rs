use std::io::{self, Write};

use mscan_common::TraceEntry;

/// Writes records in the layout [`super::TraceReader`] decodes
///
/// Wrap the sink in a `flate2::write::GzEncoder` to produce a compressed log.
pub struct TraceWriter<W: Write> {
    inner: W,
    records: u64,
}

impl<W: Write> TraceWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, records: 0 }
    }

    /// Append one record
    ///
    /// # Errors
    /// Propagates write errors from the sink
    pub fn write(&mut self, entry: &TraceEntry) -> io::Result<()> {
        entry.write_to(&mut self.inner)?;
        self.records += 1;
        Ok(())
    }

    /// Records written so far
    #[must_use]
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Flush and hand back the sink
    ///
    /// # Errors
    /// Propagates flush errors from the sink
    pub fn finish(mut self) -> io::Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}
