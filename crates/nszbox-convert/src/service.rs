//! Async pipeline service.
//!
//! A single actor task owns the [`StateMachine`] and serializes every event:
//! inbound requests, authorization answers and run completions. Runs execute
//! on tokio's blocking pool, at most one at a time. Status snapshots are
//! published through a `watch` channel.

use crate::authorization::{current_authorization, AuthorizationHost, AuthorizationStore, OutputDestination};
use crate::config::{ConvertConfig, Settings};
use crate::error::{ConvertError, ErrorKind, Result};
use crate::notify::{Notice, Notifier};
use crate::reference::{Reference, ReferenceResolver};
use crate::run::{ConversionRequest, ConversionResult, Converter, RunId, RunStatus};
use crate::state::{Command, PipelineState, StateMachine};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

/// An event for the pipeline actor.
#[derive(Debug)]
pub enum PipelineEvent {
    /// A host delivered a source to convert.
    Inbound(ConversionRequest),
    /// The user granted an output folder; the grant is already persisted.
    AuthorizationGranted,
    /// The user declined to pick an output folder.
    AuthorizationDenied,
    /// Finish the in-flight run, drop the pending request and stop.
    Shutdown,
}

/// Snapshot of the pipeline published after every event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineStatus {
    /// Current state.
    pub state: PipelineState,
    /// Source parked in the pending slot.
    pub pending: Option<Reference>,
    /// Runs started since the service came up.
    pub runs_started: u64,
    /// Runs finished (success or failure).
    pub runs_completed: u64,
    /// Pending requests dropped because authorization was not granted.
    pub canceled: u64,
    /// Outcome of the most recent run.
    pub last_result: Option<ConversionResult>,
}

/// Host-provided collaborators.
#[derive(Clone)]
pub struct Collaborators {
    /// Reference to stream mapping.
    pub resolver: Arc<dyn ReferenceResolver>,
    /// Persisted output-folder grant.
    pub store: Arc<dyn AuthorizationStore>,
    /// Folder picker and grant liveness.
    pub host: Arc<dyn AuthorizationHost>,
    /// User-visible notices.
    pub notifier: Arc<dyn Notifier>,
    /// User preferences.
    pub settings: Arc<dyn Settings>,
}

/// Cloneable handle for talking to a running pipeline.
#[derive(Clone)]
pub struct PipelineHandle {
    sender: mpsc::Sender<PipelineEvent>,
    status: watch::Receiver<PipelineStatus>,
    store: Arc<dyn AuthorizationStore>,
    settings: Arc<dyn Settings>,
}

fn shut_down() -> ConvertError {
    ConvertError::Io(std::io::Error::other("conversion pipeline shut down"))
}

impl PipelineHandle {
    /// Submit a source. The delete-source preference is read now, at acceptance.
    pub async fn submit(&self, source: Reference) -> Result<()> {
        let request = ConversionRequest::new(source, self.settings.delete_source_on_success());
        self.submit_request(request).await
    }

    /// Submit a fully formed request.
    pub async fn submit_request(&self, request: ConversionRequest) -> Result<()> {
        self.send(PipelineEvent::Inbound(request)).await
    }

    /// Persist a grant chosen by the user and resume any pending request.
    pub async fn grant_authorization(&self, destination: OutputDestination) -> Result<()> {
        self.store.save(&destination)?;
        self.send(PipelineEvent::AuthorizationGranted).await
    }

    /// The user dismissed the folder picker.
    pub async fn authorization_denied(&self) -> Result<()> {
        self.send(PipelineEvent::AuthorizationDenied).await
    }

    /// Stop the service and wait until the in-flight run, if any, is finished.
    pub async fn shutdown(&self) -> Result<()> {
        if self.send(PipelineEvent::Shutdown).await.is_err() {
            debug!("Pipeline already stopped");
        }
        let mut status = self.status.clone();
        while status.changed().await.is_ok() {}
        Ok(())
    }

    /// Latest status snapshot.
    pub fn status(&self) -> PipelineStatus {
        self.status.borrow().clone()
    }

    /// Subscribe to status updates.
    pub fn status_receiver(&self) -> watch::Receiver<PipelineStatus> {
        self.status.clone()
    }

    /// Wait for the first status satisfying `predicate`.
    pub async fn wait_until<F>(&self, predicate: F) -> Result<PipelineStatus>
    where
        F: FnMut(&PipelineStatus) -> bool,
    {
        let mut status = self.status.clone();
        let matched = status.wait_for(predicate).await.map_err(|_| shut_down())?;
        Ok(matched.clone())
    }

    /// True while the actor accepts events.
    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }

    async fn send(&self, event: PipelineEvent) -> Result<()> {
        self.sender.send(event).await.map_err(|_| shut_down())
    }
}

struct InFlight {
    run_id: RunId,
    source: Reference,
    task: JoinHandle<ConversionResult>,
}

/// The pipeline actor.
pub struct PipelineService {
    machine: StateMachine,
    converter: Arc<Converter>,
    store: Arc<dyn AuthorizationStore>,
    host: Arc<dyn AuthorizationHost>,
    notifier: Arc<dyn Notifier>,
    settings: Arc<dyn Settings>,
    status_tx: watch::Sender<PipelineStatus>,
    status: PipelineStatus,
    in_flight: Option<InFlight>,
}

impl PipelineService {
    /// Start the actor on the current tokio runtime.
    pub fn start(config: ConvertConfig, collaborators: Collaborators) -> PipelineHandle {
        let converter = Converter::new(Arc::clone(&collaborators.resolver), config);
        Self::start_with_converter(converter, collaborators)
    }

    /// Start the actor with a preconfigured converter.
    pub fn start_with_converter(converter: Converter, collaborators: Collaborators) -> PipelineHandle {
        let capacity = converter.config().channel_capacity.max(1);
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let (status_tx, status_rx) = watch::channel(PipelineStatus::default());

        let service = PipelineService {
            machine: StateMachine::new(),
            converter: Arc::new(converter),
            store: Arc::clone(&collaborators.store),
            host: collaborators.host,
            notifier: collaborators.notifier,
            settings: Arc::clone(&collaborators.settings),
            status_tx,
            status: PipelineStatus::default(),
            in_flight: None,
        };

        tokio::spawn(service.run(event_rx));

        PipelineHandle {
            sender: event_tx,
            status: status_rx,
            store: collaborators.store,
            settings: collaborators.settings,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<PipelineEvent>) {
        info!("Conversion pipeline started");
        loop {
            tokio::select! {
                finished = wait_run(&mut self.in_flight) => {
                    self.finish_run(finished);
                }
                event = rx.recv() => match event {
                    Some(PipelineEvent::Shutdown) | None => break,
                    Some(event) => self.handle(event),
                },
            }
            self.publish();
        }

        if let Some(dropped) = self.machine.discard_pending() {
            info!(source = %dropped.source, "Pending request discarded on shutdown");
        }
        if self.in_flight.is_some() {
            let finished = wait_run(&mut self.in_flight).await;
            self.finish_run(finished);
        }
        self.publish();
        info!("Conversion pipeline stopped");
    }

    fn handle(&mut self, event: PipelineEvent) {
        let store = self.store.as_ref();
        let host = self.host.as_ref();
        let commands = match event {
            PipelineEvent::Inbound(request) => {
                info!(source = %request.source, delete_source = request.delete_source_on_success, "Conversion requested");
                self.machine.on_request(request, || current_authorization(store, host))
            }
            PipelineEvent::AuthorizationGranted => {
                self.machine.on_granted(|| current_authorization(store, host))
            }
            PipelineEvent::AuthorizationDenied => self.machine.on_denied(),
            PipelineEvent::Shutdown => Vec::new(),
        };
        self.execute(commands);
    }

    fn execute(&mut self, commands: Vec<Command>) {
        for command in commands {
            match command {
                Command::RequestAuthorization => {
                    self.notifier.notify(Notice::AuthorizationRequested);
                    self.host.request_authorization();
                }
                Command::NotifyCanceled => {
                    let denied = ConvertError::AuthorizationDenied;
                    info!(kind = %denied.kind(), "{}; pending request dropped", denied);
                    self.status.canceled += 1;
                    self.notifier.notify(Notice::AuthorizationCanceled);
                }
                Command::AnnounceFolder(folder) => {
                    self.notifier.notify(Notice::OutputFolderSet { folder })
                }
                Command::StartRun { request, destination } => self.start_run(request, destination),
            }
        }
    }

    fn start_run(&mut self, request: ConversionRequest, destination: OutputDestination) {
        if let Some(cached) = self.settings.cached_destination() {
            if cached != destination.folder.as_str() {
                debug!(%cached, folder = %destination.folder, "Cached destination differs from the live grant");
            }
        }

        let run_id = RunId::new();
        let source = request.source.clone();
        info!(%run_id, %source, folder = %destination.folder, "Starting conversion run");
        self.status.runs_started += 1;

        let converter = Arc::clone(&self.converter);
        let task = tokio::task::spawn_blocking(move || converter.run(run_id, &request, &destination));
        self.in_flight = Some(InFlight { run_id, source, task });
    }

    fn finish_run(&mut self, finished: Option<(InFlight, std::result::Result<ConversionResult, JoinError>)>) {
        let Some((flight, joined)) = finished else {
            return;
        };
        let result = joined.unwrap_or_else(|e| {
            warn!(run_id = %flight.run_id, error = %e, "Conversion worker did not complete");
            ConversionResult {
                run_id: flight.run_id,
                source: flight.source.clone(),
                output: None,
                bytes_copied: 0,
                status: RunStatus::Failure {
                    kind: ErrorKind::Io,
                    reason: format!("conversion worker aborted: {}", e),
                },
                log: None,
                source_deleted: false,
                warnings: Vec::new(),
            }
        });

        match (&result.status, &result.output) {
            (RunStatus::Success, Some(output)) => self.notifier.notify(Notice::ConversionSucceeded {
                output: output.clone(),
                bytes: result.bytes_copied,
            }),
            (RunStatus::Failure { kind, reason }, _) => self.notifier.notify(Notice::ConversionFailed {
                kind: *kind,
                cause: reason.clone(),
            }),
            (RunStatus::Success, None) => warn!(run_id = %result.run_id, "Successful run without output"),
        }

        self.status.runs_completed += 1;
        self.status.last_result = Some(result);
        self.status.state = PipelineState::Done;
        self.status_tx.send_replace(self.status.clone());

        let store = self.store.as_ref();
        let host = self.host.as_ref();
        let commands = self.machine.on_run_finished(|| current_authorization(store, host));
        self.execute(commands);
    }

    fn publish(&mut self) {
        self.status.state = self.machine.state();
        self.status.pending = self.machine.pending().map(|r| r.source.clone());
        self.status_tx.send_replace(self.status.clone());
    }
}

/// Resolves when the in-flight run finishes; never resolves when idle.
async fn wait_run(
    in_flight: &mut Option<InFlight>,
) -> Option<(InFlight, std::result::Result<ConversionResult, JoinError>)> {
    let joined = match in_flight.as_mut() {
        Some(flight) => (&mut flight.task).await,
        None => std::future::pending().await,
    };
    in_flight.take().map(|flight| (flight, joined))
}
