//! Streaming transcoder: copy a source through a decompression filter into a sink.
//!
//! Memory use is bounded by the copy buffer regardless of container size.
//! Codec rejections are told apart from transport failures by probing the
//! raw source: if the source itself never failed, the error came from the
//! filter.

use crate::config::ConvertConfig;
use crate::error::{ConvertError, Result};
use std::cell::Cell;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::rc::Rc;
use tracing::{debug, instrument};

const PROGRESS_INTERVAL: u64 = 64 * 1024 * 1024;

/// Black-box decompression stream filter.
pub trait StreamFilter: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Wrap `source` so that reading yields decompressed bytes.
    fn wrap<'a>(&self, source: Box<dyn BufRead + 'a>) -> io::Result<Box<dyn Read + 'a>>;
}

/// Zstandard frame decoder (NSZ/XCZ payload codec).
#[derive(Debug, Clone, Copy)]
pub struct ZstdFilter {
    window_log_max: u32,
}

impl ZstdFilter {
    /// Decoder accepting windows up to `2^window_log_max` bytes.
    pub fn new(window_log_max: u32) -> Self {
        Self { window_log_max }
    }
}

impl Default for ZstdFilter {
    fn default() -> Self {
        Self::new(ConvertConfig::default().zstd_window_log_max)
    }
}

impl StreamFilter for ZstdFilter {
    fn name(&self) -> &'static str {
        "zstd"
    }

    fn wrap<'a>(&self, source: Box<dyn BufRead + 'a>) -> io::Result<Box<dyn Read + 'a>> {
        let mut decoder = zstd::stream::read::Decoder::with_buffer(source)?;
        decoder.window_log_max(self.window_log_max)?;
        Ok(Box::new(decoder))
    }
}

/// Identity filter for already-decompressed sources.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl StreamFilter for Passthrough {
    fn name(&self) -> &'static str {
        "none"
    }

    fn wrap<'a>(&self, source: Box<dyn BufRead + 'a>) -> io::Result<Box<dyn Read + 'a>> {
        Ok(Box::new(source))
    }
}

/// Records whether the raw source ever failed.
struct SourceTracker<'a> {
    inner: &'a mut dyn Read,
    failed: Rc<Cell<bool>>,
}

impl Read for SourceTracker<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let result = self.inner.read(buf);
        if let Err(e) = &result {
            if e.kind() != io::ErrorKind::Interrupted {
                self.failed.set(true);
            }
        }
        result
    }
}

/// Fixed-buffer streaming copier.
pub struct Transcoder {
    filter: Box<dyn StreamFilter>,
    buffer_size: usize,
}

impl Transcoder {
    /// Transcoder with an explicit filter and buffer size.
    pub fn new(filter: Box<dyn StreamFilter>, buffer_size: usize) -> Self {
        Self { filter, buffer_size: buffer_size.max(1) }
    }

    /// Zstd transcoder tuned from `config`.
    pub fn from_config(config: &ConvertConfig) -> Self {
        Self::new(
            Box::new(ZstdFilter::new(config.zstd_window_log_max)),
            config.effective_buffer_size(),
        )
    }

    /// Name of the wrapped filter.
    pub fn filter_name(&self) -> &'static str {
        self.filter.name()
    }

    /// Copy buffer size in bytes.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Decompress `source` into `sink` until the source is exhausted.
    ///
    /// Returns the number of decompressed bytes written. An empty source is a
    /// valid empty container and yields `Ok(0)`. Fails with
    /// [`ConvertError::Codec`] when the filter rejects the input and with
    /// [`ConvertError::Io`] when either stream fails.
    #[instrument(skip_all, fields(filter = self.filter.name(), buffer = self.buffer_size))]
    pub fn transcode(&self, source: &mut dyn Read, sink: &mut dyn Write) -> Result<u64> {
        let failed = Rc::new(Cell::new(false));
        let tracked = SourceTracker { inner: source, failed: Rc::clone(&failed) };
        let mut buffered = BufReader::with_capacity(self.buffer_size, tracked);
        if buffered.fill_buf()?.is_empty() {
            debug!("Empty source, nothing to decompress");
            return Ok(0);
        }

        let classify = |e: io::Error| -> ConvertError {
            if failed.get() {
                ConvertError::Io(e)
            } else {
                ConvertError::Codec(e.to_string())
            }
        };

        let mut filtered = self.filter.wrap(Box::new(buffered)).map_err(classify)?;
        let mut buf = vec![0u8; self.buffer_size];
        let mut copied: u64 = 0;
        let mut next_report = PROGRESS_INTERVAL;
        loop {
            let n = match filtered.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(classify(e)),
            };
            sink.write_all(&buf[..n])?;
            copied += n as u64;
            if copied >= next_report {
                debug!(copied, "Transcode progress");
                next_report += PROGRESS_INTERVAL;
            }
        }
        sink.flush()?;
        debug!(copied, "Transcode complete");
        Ok(copied)
    }
}
