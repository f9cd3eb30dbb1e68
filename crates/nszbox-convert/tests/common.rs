//! Shared fixtures for pipeline integration tests.
#![allow(dead_code)]

use nszbox_convert::{
    AuthorizationHost, Collaborators, ConvertConfig, MemoryAuthorizationStore, Notice, Notifier,
    OutputDestination, PipelineHandle, PipelineService, ReferenceResolver, StaticSettings,
};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// Host that counts folder-picker requests; grants stay valid until revoked.
#[derive(Default)]
pub struct TestHost {
    pub requests: AtomicUsize,
    pub revoked: AtomicBool,
}

impl AuthorizationHost for TestHost {
    fn request_authorization(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
    }

    fn is_valid(&self, _destination: &OutputDestination) -> bool {
        !self.revoked.load(Ordering::SeqCst)
    }
}

/// Notifier that keeps every notice.
#[derive(Default)]
pub struct RecordingNotifier(Mutex<Vec<Notice>>);

impl RecordingNotifier {
    pub fn notices(&self) -> Vec<Notice> {
        self.0.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notice: Notice) {
        self.0.lock().unwrap().push(notice);
    }
}

/// A started pipeline plus handles on its collaborators.
pub struct Pipeline {
    pub handle: PipelineHandle,
    pub host: Arc<TestHost>,
    pub notifier: Arc<RecordingNotifier>,
}

/// Start a pipeline over `resolver`, optionally pre-authorized for `folder`.
pub fn start_pipeline(
    resolver: Arc<dyn ReferenceResolver>,
    destination: Option<OutputDestination>,
    delete_source: bool,
) -> Pipeline {
    let store = match destination {
        Some(destination) => MemoryAuthorizationStore::with_destination(destination),
        None => MemoryAuthorizationStore::new(),
    };
    let host = Arc::new(TestHost::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let handle = PipelineService::start(
        ConvertConfig::default(),
        Collaborators {
            resolver,
            store: Arc::new(store),
            host: host.clone(),
            notifier: notifier.clone(),
            settings: Arc::new(StaticSettings {
                delete_source_on_success: delete_source,
                cached_destination: None,
            }),
        },
    );
    Pipeline { handle, host, notifier }
}

/// Deterministic, moderately compressible payload.
pub fn payload(len: usize) -> Vec<u8> {
    let mut rng = SmallRng::seed_from_u64(0x2545_f491);
    // Low entropy per byte keeps the ratio near 2:1.
    (0..len).map(|_| rng.gen::<u8>() & 0x0f).collect()
}

pub fn compress(data: &[u8]) -> Vec<u8> {
    zstd::encode_all(data, 1).unwrap()
}

/// One-shot latch a blocking reader can wait on.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    pub fn wait(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cv.wait(open).unwrap();
        }
    }

    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.cv.notify_all();
    }
}
