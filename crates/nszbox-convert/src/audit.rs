//! Append-only per-run audit log.
//!
//! Every record is written as one line and flushed before `record` returns.
//! The logger never fails past its own boundary: open failures surface as
//! `None` and write failures degrade the log to a no-op, both reported
//! through `tracing` only.

use crate::error::ResolverError;
use crate::reference::{Reference, ReferenceResolver, MIME_TEXT_PLAIN};
use chrono::{SecondsFormat, Utc};
use std::fmt::Display;
use std::io::Write;
use tracing::{debug, warn};

/// First record of every log artifact.
pub const LOG_HEADER: &str = "=== NSZ Toolbox conversion log ===";

/// Handle to an open audit log.
pub struct AuditLog {
    sink: Option<Box<dyn Write + Send>>,
    location: Reference,
    records: u64,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("location", &self.location)
            .field("records", &self.records)
            .field("open", &self.sink.is_some())
            .finish()
    }
}

impl AuditLog {
    /// Create a fresh log named `name` in `folder` and write the header.
    pub fn open(
        resolver: &dyn ReferenceResolver,
        folder: &Reference,
        name: &str,
    ) -> Result<Self, ResolverError> {
        let location = resolver.create_child(folder, MIME_TEXT_PLAIN, name)?;
        let sink = match resolver.open_write(&location) {
            Ok(sink) => sink,
            Err(e) => {
                if let Err(cleanup) = resolver.delete(&location) {
                    debug!(error = %cleanup, log = %location, "Failed to remove unopened log");
                }
                return Err(e);
            }
        };
        let mut log = Self { sink: Some(sink), location, records: 0 };
        log.record(LOG_HEADER);
        Ok(log)
    }

    /// Open in `primary`, falling back to `fallback`. Never fails: returns
    /// `None` if neither location accepts the log.
    pub fn open_best_effort(
        resolver: &dyn ReferenceResolver,
        primary: &Reference,
        fallback: Option<&Reference>,
        name: &str,
    ) -> Option<Self> {
        let primary_err = match Self::open(resolver, primary, name) {
            Ok(log) => return Some(log),
            Err(e) => e,
        };
        warn!(folder = %primary, error = %primary_err, "Cannot open audit log in output folder");

        let fallback = fallback?;
        match Self::open(resolver, fallback, name) {
            Ok(log) => {
                debug!(log = %log.location, "Audit log opened in fallback folder");
                Some(log)
            }
            Err(e) => {
                warn!(folder = %fallback, error = %e, "Cannot open audit log in fallback folder");
                None
            }
        }
    }

    /// Where the log lives.
    pub fn location(&self) -> &Reference {
        &self.location
    }

    /// Records successfully written, header included.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// True until closed or degraded by a write failure.
    pub fn is_open(&self) -> bool {
        self.sink.is_some()
    }

    /// Append one timestamped line and flush it.
    pub fn record(&mut self, line: impl Display) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let text = format!("[{}] {}\n", stamp, line);
        match sink.write_all(text.as_bytes()).and_then(|()| sink.flush()) {
            Ok(()) => self.records += 1,
            Err(e) => {
                warn!(log = %self.location, error = %e, "Audit log write failed, disabling log");
                self.sink = None;
            }
        }
    }

    /// Flush and release the stream. Idempotent.
    pub fn close(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.flush() {
                warn!(log = %self.location, error = %e, "Audit log flush on close failed");
            }
        }
    }
}

impl Drop for AuditLog {
    fn drop(&mut self) {
        self.close();
    }
}

/// Strip the `[timestamp] ` prefix from each line of a log artifact.
pub fn record_texts(log: &str) -> Vec<&str> {
    log.lines()
        .map(|line| match line.split_once("] ") {
            Some((stamp, text)) if stamp.starts_with('[') => text,
            _ => line,
        })
        .collect()
}
