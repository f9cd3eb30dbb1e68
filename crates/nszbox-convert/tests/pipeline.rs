//! End-to-end pipeline behavior: authorization deferral, serialization of
//! runs, byte-exact output and the audit trail.

mod common;

use common::{compress, payload, start_pipeline, Gate, RecordingNotifier, TestHost};
use nszbox_convert::audit::{record_texts, LOG_HEADER};
use nszbox_convert::{
    Collaborators, ConvertConfig, ErrorKind, FileAuthorizationStore, LocalResolver, MemoryResolver,
    Notice, OutputDestination, PipelineService, PipelineState, Reference, ReferenceResolver,
    ResolverError, StaticSettings,
};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

fn read_log(path: &std::path::Path) -> Vec<String> {
    let text = std::fs::read_to_string(path).unwrap();
    record_texts(&text).into_iter().map(str::to_string).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_large_container_is_byte_exact() {
    let inbox = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let data = payload(104_857_600);
    let source = inbox.path().join("game.nsz");
    std::fs::write(&source, compress(&data)).unwrap();

    let folder = LocalResolver::reference_for(out.path());
    let p = start_pipeline(
        Arc::new(LocalResolver::new()),
        Some(OutputDestination::for_folder(folder)),
        false,
    );
    p.handle.submit(LocalResolver::reference_for(&source)).await.unwrap();
    let status = p.handle.wait_until(|s| s.runs_completed == 1).await.unwrap();

    let result = status.last_result.unwrap();
    assert!(result.is_success(), "{:?}", result.status);
    assert_eq!(result.bytes_copied, 104_857_600);
    let output = out.path().join("game.nsp");
    assert_eq!(result.output, Some(LocalResolver::reference_for(&output)));
    assert!(std::fs::read(&output).unwrap() == data);

    let lines = read_log(&out.path().join("nsz_debug.log.txt"));
    assert_eq!(lines[0], LOG_HEADER);
    let last = lines.last().unwrap();
    assert!(last.starts_with("SUCCESS: wrote 104857600 bytes to "), "{}", last);
    assert!(last.ends_with("game.nsp"), "{}", last);
    assert!(source.exists());
}

#[tokio::test]
async fn test_malformed_container_without_extension() {
    let inbox = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let source = inbox.path().join("demo");
    std::fs::write(&source, b"\x00\x01\x02\x03 not a zstd frame").unwrap();

    let p = start_pipeline(
        Arc::new(LocalResolver::new()),
        Some(OutputDestination::for_folder(LocalResolver::reference_for(out.path()))),
        true,
    );
    p.handle.submit(LocalResolver::reference_for(&source)).await.unwrap();
    let status = p
        .handle
        .wait_until(|s| s.runs_completed == 1 && s.state == PipelineState::Idle)
        .await
        .unwrap();

    let result = status.last_result.unwrap();
    assert_eq!(result.failure_kind(), Some(ErrorKind::Codec));
    assert_eq!(result.output, None);
    assert!(!out.path().join("shared-file.nsp").exists());
    assert!(source.exists());

    let entries: Vec<_> = std::fs::read_dir(out.path()).unwrap().map(|e| e.unwrap().file_name()).collect();
    assert_eq!(entries, vec![std::ffi::OsString::from("nsz_debug.log.txt")]);

    let lines = read_log(&out.path().join("nsz_debug.log.txt"));
    let failures: Vec<_> = lines.iter().filter(|l| l.starts_with("FAILED")).collect();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].starts_with("FAILED (codec): "), "{}", failures[0]);
    assert_eq!(lines.last(), Some(failures[0]));

    let notices = p.notifier.notices();
    assert_eq!(
        notices.iter().filter(|n| matches!(n, Notice::ConversionFailed { .. })).count(),
        1
    );
}

#[tokio::test]
async fn test_denied_authorization_leaves_no_trace() {
    let files = MemoryResolver::new();
    let folder = files.add_folder("mem://out");
    let source = files.insert_named_file("mem://inbox/1", "game.nsz", compress(b"abc"));
    let p = start_pipeline(Arc::new(files.clone()), None, true);

    p.handle.submit(source.clone()).await.unwrap();
    p.handle
        .wait_until(|s| s.state == PipelineState::AwaitingAuthorization)
        .await
        .unwrap();
    p.handle.authorization_denied().await.unwrap();
    p.handle.wait_until(|s| s.state == PipelineState::Idle).await.unwrap();

    // A later grant does not resurrect the dropped request.
    p.handle
        .grant_authorization(OutputDestination::for_folder(folder.clone()))
        .await
        .unwrap();
    let status = p
        .handle
        .wait_until(|s| s.state == PipelineState::Idle && s.pending.is_none())
        .await
        .unwrap();
    p.handle.shutdown().await.unwrap();

    assert_eq!(status.runs_started, 0);
    assert!(files.children(&folder).is_empty());
    assert!(files.exists(&source));
    assert!(files.deletions().is_empty());
    assert_eq!(p.host.requests.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_successful_run_deletes_source_once() {
    let files = MemoryResolver::new();
    let folder = files.add_folder("mem://out");
    let source = files.insert_named_file("mem://inbox/1", "cart.xcz", compress(b"xci image"));
    let p = start_pipeline(Arc::new(files.clone()), Some(OutputDestination::for_folder(folder)), true);

    p.handle.submit(source.clone()).await.unwrap();
    let status = p.handle.wait_until(|s| s.runs_completed == 1).await.unwrap();

    let result = status.last_result.unwrap();
    assert!(result.source_deleted);
    assert_eq!(result.output, Some(Reference::new("mem://out/cart.xci")));
    assert_eq!(files.deletions(), vec![source]);
}

/// Resolver that holds every source read at a gate and tracks how many
/// sources are open at once.
struct GatedResolver {
    inner: MemoryResolver,
    gate: Arc<Gate>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    opened: Mutex<Vec<Reference>>,
}

struct TrackedReader {
    inner: Box<dyn Read + Send>,
    active: Arc<AtomicUsize>,
}

impl Read for TrackedReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Drop for TrackedReader {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ReferenceResolver for GatedResolver {
    fn display_name(&self, reference: &Reference) -> Result<Option<String>, ResolverError> {
        self.inner.display_name(reference)
    }

    fn open_read(&self, reference: &Reference) -> Result<Box<dyn Read + Send>, ResolverError> {
        let reader = self.inner.open_read(reference)?;
        self.opened.lock().unwrap().push(reference.clone());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.gate.wait();
        Ok(Box::new(TrackedReader { inner: reader, active: self.active.clone() }))
    }

    fn open_write(&self, reference: &Reference) -> Result<Box<dyn Write + Send>, ResolverError> {
        self.inner.open_write(reference)
    }

    fn create_child(&self, folder: &Reference, mime_hint: &str, name: &str) -> Result<Reference, ResolverError> {
        self.inner.create_child(folder, mime_hint, name)
    }

    fn delete(&self, reference: &Reference) -> Result<(), ResolverError> {
        self.inner.delete(reference)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_requests_during_a_run_are_serialized_last_wins() {
    let files = MemoryResolver::new();
    let folder = files.add_folder("mem://out");
    let names = ["one", "two", "three", "four", "five"];
    let sources: Vec<_> = names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            files.insert_named_file(
                format!("mem://inbox/{}", i),
                &format!("{}.nsz", name),
                compress(name.as_bytes()),
            )
        })
        .collect();

    let gate = Arc::new(Gate::default());
    let peak = Arc::new(AtomicUsize::new(0));
    let resolver = Arc::new(GatedResolver {
        inner: files.clone(),
        gate: gate.clone(),
        active: Arc::new(AtomicUsize::new(0)),
        peak: peak.clone(),
        opened: Mutex::new(Vec::new()),
    });
    let p = start_pipeline(resolver.clone(), Some(OutputDestination::for_folder(folder.clone())), false);

    p.handle.submit(sources[0].clone()).await.unwrap();
    p.handle.wait_until(|s| s.state == PipelineState::Running).await.unwrap();
    for source in &sources[1..] {
        p.handle.submit(source.clone()).await.unwrap();
    }
    let last = sources[4].clone();
    p.handle.wait_until(|s| s.pending.as_ref() == Some(&last)).await.unwrap();

    gate.open();
    let status = p
        .handle
        .wait_until(|s| s.runs_completed == 2 && s.state == PipelineState::Idle)
        .await
        .unwrap();

    assert_eq!(status.runs_started, 2);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(*resolver.opened.lock().unwrap(), vec![sources[0].clone(), sources[4].clone()]);
    assert!(files.exists(&Reference::new("mem://out/one.nsp")));
    assert!(files.exists(&Reference::new("mem://out/five.nsp")));
    assert!(!files.exists(&Reference::new("mem://out/two.nsp")));
    // One log artifact per run.
    let logs = files
        .children(&folder)
        .into_iter()
        .filter(|r| r.as_str().contains("nsz_debug.log"))
        .count();
    assert_eq!(logs, 2);
}

#[tokio::test]
async fn test_grant_survives_restart() {
    let state = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let inbox = TempDir::new().unwrap();
    let auth_path = state.path().join("authorization.json");

    let collaborators = |host: Arc<TestHost>| Collaborators {
        resolver: Arc::new(LocalResolver::new()),
        store: Arc::new(FileAuthorizationStore::new(&auth_path)),
        host,
        notifier: Arc::new(RecordingNotifier::default()),
        settings: Arc::new(StaticSettings::default()),
    };

    let first = PipelineService::start(ConvertConfig::default(), collaborators(Arc::default()));
    first
        .grant_authorization(OutputDestination::for_folder(LocalResolver::reference_for(out.path())))
        .await
        .unwrap();
    first.shutdown().await.unwrap();

    let source = inbox.path().join("game.nsz");
    std::fs::write(&source, compress(b"after restart")).unwrap();

    let host = Arc::new(TestHost::default());
    let second = PipelineService::start(ConvertConfig::default(), collaborators(host.clone()));
    second.submit(LocalResolver::reference_for(&source)).await.unwrap();
    let status = second.wait_until(|s| s.runs_completed == 1).await.unwrap();

    assert!(status.last_result.unwrap().is_success());
    assert_eq!(host.requests.load(Ordering::SeqCst), 0);
    assert_eq!(std::fs::read(out.path().join("game.nsp")).unwrap(), b"after restart");
}
