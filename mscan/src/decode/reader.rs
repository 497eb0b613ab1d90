use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::iter::FusedIterator;
use std::path::Path;

use flate2::read::MultiGzDecoder;
use log::debug;
use mscan_common::{EntryHeader, Payload, TraceEntry, HEADER_SIZE, MAX_ENTRY_SIZE};

use crate::domain::DecodeError;

/// First two bytes of every gzip member
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Lazy, forward-only reader of trace records
///
/// Yields `Ok(entry)` per record and stops at a clean end of stream. After
/// the first error the iterator is exhausted.
pub struct TraceReader<R> {
    inner: R,
    /// Bytes consumed so far, used to locate corrupt records
    offset: u64,
    finished: bool,
    body: Vec<u8>,
}

impl TraceReader<Box<dyn Read>> {
    /// Open a trace file, decompressing it on the fly if it is gzip'd
    ///
    /// # Errors
    /// Returns [`DecodeError::Open`] if the file cannot be opened or read
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DecodeError> {
        let path = path.as_ref();
        let open_err = |source| DecodeError::Open { path: path.to_path_buf(), source };

        let file = File::open(path).map_err(open_err)?;
        let mut buffered = BufReader::new(file);
        let compressed = buffered.fill_buf().map_err(open_err)?.starts_with(&GZIP_MAGIC);

        let inner: Box<dyn Read> = if compressed {
            debug!("{} is gzip compressed", path.display());
            Box::new(BufReader::new(MultiGzDecoder::new(buffered)))
        } else {
            Box::new(buffered)
        };
        Ok(Self::new(inner))
    }
}

impl<R: Read> TraceReader<R> {
    /// Decode records from an already-open byte stream
    pub fn new(inner: R) -> Self {
        Self { inner, offset: 0, finished: false, body: Vec::with_capacity(MAX_ENTRY_SIZE) }
    }

    /// Bytes consumed from the (decompressed) stream
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn next_entry(&mut self) -> Result<Option<TraceEntry>, DecodeError> {
        let start = self.offset;

        let mut raw = [0u8; HEADER_SIZE];
        let got = read_full(&mut self.inner, &mut raw)?;
        self.offset += got as u64;
        if got == 0 {
            return Ok(None);
        }
        if got < HEADER_SIZE {
            return Err(DecodeError::Truncated { offset: start });
        }

        let header = EntryHeader::parse(&raw)
            .map_err(|source| DecodeError::Malformed { offset: start, source })?;

        let size = usize::from(header.size);
        if size > MAX_ENTRY_SIZE {
            return Err(DecodeError::Oversized {
                offset: start,
                size: header.size,
                max: MAX_ENTRY_SIZE,
            });
        }
        let min = header.kind.record_size();
        if size < min {
            return Err(DecodeError::Undersized {
                offset: start,
                kind: header.kind.name(),
                size: header.size,
                min,
            });
        }

        self.body.resize(size - HEADER_SIZE, 0);
        let got = read_full(&mut self.inner, &mut self.body)?;
        self.offset += got as u64;
        if got < self.body.len() {
            return Err(DecodeError::Truncated { offset: start });
        }

        let payload = Payload::decode(header.kind, &self.body)
            .map_err(|source| DecodeError::Malformed { offset: start, source })?;
        Ok(Some(TraceEntry { header, payload }))
    }
}

impl<R: Read> Iterator for TraceReader<R> {
    type Item = Result<TraceEntry, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

impl<R: Read> FusedIterator for TraceReader<R> {}

/// Fill `buf` as far as the stream allows, returning the number of bytes read
///
/// Unlike `read_exact` this distinguishes a clean end of stream (0) from a
/// short read.
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
