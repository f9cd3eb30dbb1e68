//! A single conversion run: resolve, name, log, create, transcode, clean up.
//!
//! The run body is synchronous and executes on the pipeline's blocking
//! worker. Every step is appended to the audit log in the order it happens
//! and the run always ends with exactly one terminal record.

use crate::audit::AuditLog;
use crate::authorization::OutputDestination;
use crate::config::{Backend, ConvertConfig};
use crate::error::{ConvertError, ErrorKind, Result};
use crate::external::ExternalConverter;
use crate::naming::OutputName;
use crate::reference::{Reference, ReferenceResolver, MIME_OCTET_STREAM};
use crate::transcode::Transcoder;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Unique identifier of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An inbound request to convert one source container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionRequest {
    /// Compressed input
    pub source: Reference,
    /// When the host delivered the request
    pub requested_at: DateTime<Utc>,
    /// Delete the source once the output is complete
    pub delete_source_on_success: bool,
}

impl ConversionRequest {
    /// Request stamped now.
    pub fn new(source: Reference, delete_source_on_success: bool) -> Self {
        Self { source, requested_at: Utc::now(), delete_source_on_success }
    }
}

/// Terminal status of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Output written completely.
    Success,
    /// Run aborted.
    Failure {
        /// What failed
        kind: ErrorKind,
        /// Human-readable cause
        reason: String,
    },
}

/// Problem that did not change the run's status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunWarning {
    /// What failed
    pub kind: ErrorKind,
    /// Human-readable cause
    pub reason: String,
}

impl From<ConvertError> for RunWarning {
    fn from(error: ConvertError) -> Self {
        Self { kind: error.kind(), reason: error.to_string() }
    }
}

impl std::fmt::Display for RunWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.reason, self.kind)
    }
}

/// Outcome of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionResult {
    /// Run identifier
    pub run_id: RunId,
    /// Converted source
    pub source: Reference,
    /// Output that exists after the run: the converted file, or a partial
    /// output whose cleanup failed
    pub output: Option<Reference>,
    /// Decompressed bytes written
    pub bytes_copied: u64,
    /// Success or failure with cause
    pub status: RunStatus,
    /// Audit log artifact, if one could be opened
    pub log: Option<Reference>,
    /// True if the source was deleted after success
    pub source_deleted: bool,
    /// Downgraded problems (deletion failures)
    pub warnings: Vec<RunWarning>,
}

impl ConversionResult {
    /// True for [`RunStatus::Success`].
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    /// Failure kind, if the run failed.
    pub fn failure_kind(&self) -> Option<ErrorKind> {
        match &self.status {
            RunStatus::Success => None,
            RunStatus::Failure { kind, .. } => Some(*kind),
        }
    }
}

/// Executes runs against a resolver.
pub struct Converter {
    resolver: Arc<dyn ReferenceResolver>,
    config: ConvertConfig,
    transcoder: Transcoder,
    external: Option<ExternalConverter>,
}

impl Converter {
    /// Converter using the backend selected in `config`.
    pub fn new(resolver: Arc<dyn ReferenceResolver>, config: ConvertConfig) -> Self {
        let transcoder = Transcoder::from_config(&config);
        Self::with_transcoder(resolver, config, transcoder)
    }

    /// Converter with an explicit transcoder for the streaming backend.
    pub fn with_transcoder(
        resolver: Arc<dyn ReferenceResolver>,
        config: ConvertConfig,
        transcoder: Transcoder,
    ) -> Self {
        let external = match &config.backend {
            Backend::Stream => None,
            Backend::External { program, args } => {
                Some(ExternalConverter::new(program.clone(), args.clone()))
            }
        };
        Self { resolver, config, transcoder, external }
    }

    /// Configuration in use.
    pub fn config(&self) -> &ConvertConfig {
        &self.config
    }

    /// Execute one run. Never panics on collaborator failures: every error
    /// ends up in the returned result and in the audit log.
    #[instrument(skip_all, fields(run_id = %run_id, source = %request.source))]
    pub fn run(
        &self,
        run_id: RunId,
        request: &ConversionRequest,
        destination: &OutputDestination,
    ) -> ConversionResult {
        let resolver = self.resolver.as_ref();
        let source_name = resolver.resolve_name(&request.source, &self.config.default_source_name);

        let log = AuditLog::open_best_effort(
            resolver,
            &destination.folder,
            self.config.fallback_log_folder.as_ref(),
            &self.config.log_file_name,
        );
        if log.is_none() {
            warn!("Proceeding without an audit log");
        }
        let mut journal = Journal::new(run_id, request.source.clone(), log);
        journal.record(format_args!(
            "request accepted: run={} source={} requested_at={} delete_source={} destination={}",
            run_id,
            request.source,
            request.requested_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            request.delete_source_on_success,
            destination.folder,
        ));

        let source_name = match source_name {
            Ok(name) => name,
            Err(e) => return journal.fail(e.into(), None),
        };
        let output_name = OutputName::derive(&source_name, &self.config.fallback_stem);
        journal.record(format_args!("name resolved: {} -> {}", source_name, output_name));

        let output = match resolver.create_child(&destination.folder, MIME_OCTET_STREAM, &output_name.name)
        {
            Ok(output) => output,
            Err(e) => return journal.fail(e.into(), None),
        };
        journal.record(format_args!("output created: {}", output));

        let bytes = match self.produce(&request.source, &output, &mut journal) {
            Ok(bytes) => bytes,
            Err(e) => {
                let leftover = match resolver.delete(&output) {
                    Ok(()) => {
                        journal.record(format_args!("partial output removed: {}", output));
                        None
                    }
                    Err(cleanup) => {
                        journal.warning(ConvertError::DeletionFailed(format!(
                            "partial output {} not removed: {}",
                            output, cleanup
                        )));
                        Some(output)
                    }
                };
                return journal.fail(e, leftover);
            }
        };
        journal.record(format_args!("bytes copied: {}", bytes));

        if request.delete_source_on_success {
            match resolver.delete(&request.source) {
                Ok(()) => {
                    journal.source_deleted = true;
                    journal.record(format_args!("source deleted: {}", request.source));
                }
                Err(e) => journal.warning(ConvertError::DeletionFailed(format!(
                    "source {} not removed: {}",
                    request.source, e
                ))),
            }
        }

        journal.succeed(output, bytes)
    }

    /// Steps 5 and 6: open both streams and fill the output. Streams are
    /// released when this returns, before any cleanup touches the output.
    fn produce(&self, source: &Reference, output: &Reference, journal: &mut Journal) -> Result<u64> {
        let resolver = self.resolver.as_ref();
        match &self.external {
            None => {
                let mut reader = resolver.open_read(source)?;
                let mut writer = resolver.open_write(output)?;
                journal.record(format_args!(
                    "transcode started: filter={} buffer={}",
                    self.transcoder.filter_name(),
                    self.transcoder.buffer_size()
                ));
                self.transcoder.transcode(&mut *reader, &mut *writer)
            }
            Some(external) => {
                let input = local_path(resolver, source)?;
                let target = local_path(resolver, output)?;
                journal.record(format_args!("external conversion started: {}", external.program()));
                external.convert(&input, &target)
            }
        }
    }
}

fn local_path(resolver: &dyn ReferenceResolver, reference: &Reference) -> Result<std::path::PathBuf> {
    resolver.local_path(reference).ok_or_else(|| {
        ConvertError::Io(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("{} has no local path for the external converter", reference),
        ))
    })
}

/// Accumulates the audit trail and result fields of one run.
struct Journal {
    run_id: RunId,
    source: Reference,
    log: Option<AuditLog>,
    warnings: Vec<RunWarning>,
    source_deleted: bool,
}

impl Journal {
    fn new(run_id: RunId, source: Reference, log: Option<AuditLog>) -> Self {
        Self { run_id, source, log, warnings: Vec::new(), source_deleted: false }
    }

    fn record(&mut self, line: impl std::fmt::Display) {
        if let Some(log) = self.log.as_mut() {
            log.record(line);
        }
    }

    fn warning(&mut self, error: ConvertError) {
        let warning = RunWarning::from(error);
        warn!(kind = %warning.kind, reason = %warning.reason, "Run warning");
        self.record(format_args!("warning ({}): {}", warning.kind, warning.reason));
        self.warnings.push(warning);
    }

    fn close_log(&mut self) -> Option<Reference> {
        self.log.as_mut().map(|log| {
            log.close();
            log.location().clone()
        })
    }

    fn fail(mut self, error: ConvertError, output: Option<Reference>) -> ConversionResult {
        let kind = error.kind();
        let reason = error.to_string();
        warn!(%kind, %reason, "Conversion failed");
        self.record(format_args!("FAILED ({}): {}", kind, reason));
        ConversionResult {
            run_id: self.run_id,
            source: self.source.clone(),
            output,
            bytes_copied: 0,
            status: RunStatus::Failure { kind, reason },
            log: self.close_log(),
            source_deleted: false,
            warnings: std::mem::take(&mut self.warnings),
        }
    }

    fn succeed(mut self, output: Reference, bytes: u64) -> ConversionResult {
        info!(%output, bytes, "Conversion succeeded");
        self.record(format_args!("SUCCESS: wrote {} bytes to {}", bytes, output));
        ConversionResult {
            run_id: self.run_id,
            source: self.source.clone(),
            output: Some(output),
            bytes_copied: bytes,
            status: RunStatus::Success,
            log: self.close_log(),
            source_deleted: self.source_deleted,
            warnings: std::mem::take(&mut self.warnings),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{record_texts, LOG_HEADER};
    use crate::memory::MemoryResolver;

    struct Fixture {
        store: MemoryResolver,
        converter: Converter,
        destination: OutputDestination,
    }

    fn fixture() -> Fixture {
        let store = MemoryResolver::new();
        let folder = store.add_folder("mem://out");
        let converter = Converter::new(Arc::new(store.clone()), ConvertConfig::default());
        Fixture { store, converter, destination: OutputDestination::for_folder(folder) }
    }

    fn log_texts(store: &MemoryResolver, result: &ConversionResult) -> Vec<String> {
        let bytes = store.contents(result.log.as_ref().unwrap()).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        record_texts(&text).into_iter().map(str::to_string).collect()
    }

    fn prefixes(lines: &[String]) -> Vec<&str> {
        lines
            .iter()
            .map(|l| l.split([':', ' ']).next().unwrap_or_default())
            .collect()
    }

    #[test]
    fn test_success_logs_every_step_in_order() {
        let f = fixture();
        let payload = b"decompressed container".repeat(1000);
        let source = f.store.insert_named_file(
            "mem://inbox/1",
            "game.nsz",
            zstd::encode_all(&payload[..], 3).unwrap(),
        );
        let request = ConversionRequest::new(source.clone(), true);

        let result = f.converter.run(RunId::new(), &request, &f.destination);

        assert!(result.is_success(), "{:?}", result.status);
        assert_eq!(result.output, Some(Reference::new("mem://out/game.nsp")));
        assert_eq!(result.bytes_copied, payload.len() as u64);
        assert_eq!(f.store.contents(&Reference::new("mem://out/game.nsp")).unwrap(), payload);
        assert!(result.source_deleted);
        assert!(!f.store.exists(&source));

        let lines = log_texts(&f.store, &result);
        assert_eq!(lines[0], LOG_HEADER);
        assert_eq!(
            prefixes(&lines[1..]),
            vec!["request", "name", "output", "transcode", "bytes", "source", "SUCCESS"]
        );
        assert_eq!(lines[2], "name resolved: game.nsz -> game.nsp");
        assert_eq!(
            lines.last().unwrap(),
            &format!("SUCCESS: wrote {} bytes to mem://out/game.nsp", payload.len())
        );
    }

    #[test]
    fn test_codec_failure_removes_partial_output_and_keeps_source() {
        let f = fixture();
        let source = f.store.insert_file("mem://inbox/demo", b"not zstd at all".to_vec());
        let request = ConversionRequest::new(source.clone(), true);

        let result = f.converter.run(RunId::new(), &request, &f.destination);

        assert_eq!(result.failure_kind(), Some(ErrorKind::Codec));
        assert_eq!(result.output, None);
        assert!(f.store.exists(&source));
        assert!(!f.store.exists(&Reference::new("mem://out/shared-file.nsp")));
        assert!(!f.store.deletions().contains(&source));

        let lines = log_texts(&f.store, &result);
        let failures: Vec<_> = lines.iter().filter(|l| l.starts_with("FAILED")).collect();
        assert_eq!(failures.len(), 1);
        assert!(lines.last().unwrap().starts_with("FAILED (codec): "));
        assert!(lines.contains(&"partial output removed: mem://out/shared-file.nsp".to_string()));
    }

    #[test]
    fn test_unresolvable_source_fails_before_creating_output() {
        let f = fixture();
        let request = ConversionRequest::new(Reference::new("mem://inbox/missing"), false);
        let result = f.converter.run(RunId::new(), &request, &f.destination);

        assert_eq!(result.failure_kind(), Some(ErrorKind::Resolve));
        let children = f.store.children(&f.destination.folder);
        assert_eq!(children, vec![result.log.clone().unwrap()]);

        let lines = log_texts(&f.store, &result);
        assert_eq!(prefixes(&lines[1..]), vec!["request", "FAILED"]);
    }

    #[test]
    fn test_create_failure() {
        let f = fixture();
        let source = f.store.insert_named_file("mem://inbox/1", "game.nsz", vec![]);
        let fallback = f.store.add_folder("mem://fallback");
        let config = ConvertConfig { fallback_log_folder: Some(fallback), ..Default::default() };
        let converter = Converter::new(Arc::new(f.store.clone()), config);
        f.store.remove_folder(&f.destination.folder);

        let result = converter.run(RunId::new(), &ConversionRequest::new(source, false), &f.destination);
        assert_eq!(result.failure_kind(), Some(ErrorKind::CreateFailed));
        assert!(result.log.unwrap().as_str().starts_with("mem://fallback/"));
    }

    #[test]
    fn test_source_read_failure_is_io() {
        let f = fixture();
        let compressed = zstd::encode_all(&vec![9u8; 1 << 20][..], 1).unwrap();
        let source = f.store.insert_named_file("mem://inbox/1", "game.nsz", compressed);
        f.store.fail_reads_after(&source, 4);

        let result = f.converter.run(RunId::new(), &ConversionRequest::new(source, false), &f.destination);
        assert_eq!(result.failure_kind(), Some(ErrorKind::Io));
        assert!(!f.store.exists(&Reference::new("mem://out/game.nsp")));
    }

    #[test]
    fn test_deletion_failure_does_not_downgrade_success() {
        let f = fixture();
        let source = f.store.insert_named_file(
            "mem://inbox/1",
            "game.nsz",
            zstd::encode_all(&b"abc"[..], 3).unwrap(),
        );
        f.store.fail_deletes(true);

        let result = f.converter.run(RunId::new(), &ConversionRequest::new(source.clone(), true), &f.destination);
        assert!(result.is_success());
        assert!(!result.source_deleted);
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].kind, ErrorKind::DeletionFailed);
        assert!(result.warnings[0].reason.contains("source mem://inbox/1"), "{}", result.warnings[0]);
        assert!(f.store.exists(&source));
        assert_eq!(f.store.deletions(), vec![source]);
    }

    #[test]
    fn test_partial_cleanup_failure_reports_leftover() {
        let f = fixture();
        let source = f.store.insert_named_file("mem://inbox/1", "game.nsz", b"garbage!".to_vec());
        f.store.fail_deletes(true);

        let result = f.converter.run(RunId::new(), &ConversionRequest::new(source, true), &f.destination);
        assert_eq!(result.failure_kind(), Some(ErrorKind::Codec));
        assert_eq!(result.output, Some(Reference::new("mem://out/game.nsp")));
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].kind, ErrorKind::DeletionFailed);
        let lines = log_texts(&f.store, &result);
        assert!(lines.iter().any(|l| l.starts_with("warning (deletion): ")), "{:?}", lines);
    }

    #[test]
    fn test_empty_container_is_success() {
        let f = fixture();
        let source = f.store.insert_named_file("mem://inbox/1", "empty.xcz", vec![]);
        let result = f.converter.run(RunId::new(), &ConversionRequest::new(source, false), &f.destination);
        assert!(result.is_success());
        assert_eq!(result.bytes_copied, 0);
        assert_eq!(result.output, Some(Reference::new("mem://out/empty.xci")));
    }

    #[test]
    fn test_log_write_failure_does_not_affect_run() {
        let f = fixture();
        f.store.fail_writes_after(&Reference::new("mem://out/nsz_debug.log.txt"), 0);
        let source = f.store.insert_named_file(
            "mem://inbox/1",
            "game.nsz",
            zstd::encode_all(&b"abc"[..], 3).unwrap(),
        );
        let result = f.converter.run(RunId::new(), &ConversionRequest::new(source, false), &f.destination);
        assert!(result.is_success());
        assert_eq!(result.bytes_copied, 3);
    }

    #[test]
    fn test_external_backend_needs_local_paths() {
        let f = fixture();
        let config = ConvertConfig {
            backend: Backend::External { program: "nsz".into(), args: vec![] },
            ..Default::default()
        };
        let converter = Converter::new(Arc::new(f.store.clone()), config);
        let source = f.store.insert_named_file("mem://inbox/1", "game.nsz", vec![1]);

        let result = converter.run(RunId::new(), &ConversionRequest::new(source, false), &f.destination);
        assert_eq!(result.failure_kind(), Some(ErrorKind::Io));
        assert_eq!(result.output, None);
    }
}
