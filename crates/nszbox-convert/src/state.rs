//! Deferred-conversion state machine.
//!
//! Pure transition table: events go in, commands for the service come out.
//! Authorization snapshots are supplied lazily by the caller so they are
//! read (and re-validated) exactly at the moment a transition needs them.
//!
//! | state                 | event            | next                  | commands                      |
//! |-----------------------|------------------|-----------------------|-------------------------------|
//! | Idle                  | request, auth ok | Running               | StartRun                      |
//! | Idle                  | request, no auth | AwaitingAuthorization | RequestAuthorization          |
//! | AwaitingAuthorization | request          | AwaitingAuthorization | (pending replaced)            |
//! | AwaitingAuthorization | granted, auth ok | Running / Idle        | AnnounceFolder, StartRun      |
//! | AwaitingAuthorization | granted, no auth | Idle                  | NotifyCanceled                |
//! | AwaitingAuthorization | denied           | Idle                  | NotifyCanceled                |
//! | Running               | request          | Running               | (queued, last wins)           |
//! | Running               | run finished     | Done → Idle → ...     | pending re-admitted           |

use crate::authorization::OutputDestination;
use crate::reference::Reference;
use crate::run::ConversionRequest;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Externally visible pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PipelineState {
    /// Nothing running, nothing waiting.
    #[default]
    Idle,
    /// A request is parked until the user authorizes an output folder.
    AwaitingAuthorization,
    /// A conversion run is in flight.
    Running,
    /// A run just completed; transient.
    Done,
}

/// Side effects the service must carry out.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Open the host's folder picker.
    RequestAuthorization,
    /// Tell the user the pending request was dropped.
    NotifyCanceled,
    /// Tell the user an output folder is now authorized.
    AnnounceFolder(Reference),
    /// Execute a run against a destination validated at transition time.
    StartRun {
        /// Request to convert
        request: ConversionRequest,
        /// Authorized destination
        destination: OutputDestination,
    },
}

/// Single-slot deferred conversion state machine.
#[derive(Debug, Default)]
pub struct StateMachine {
    state: PipelineState,
    pending: Option<ConversionRequest>,
}

impl StateMachine {
    /// Machine in `Idle` with an empty pending slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Request parked in the pending slot.
    pub fn pending(&self) -> Option<&ConversionRequest> {
        self.pending.as_ref()
    }

    /// Drop the pending request, if any.
    pub fn discard_pending(&mut self) -> Option<ConversionRequest> {
        if self.state == PipelineState::AwaitingAuthorization {
            self.state = PipelineState::Idle;
        }
        self.pending.take()
    }

    /// Inbound conversion request.
    pub fn on_request<F>(&mut self, request: ConversionRequest, authorization: F) -> Vec<Command>
    where
        F: FnOnce() -> Option<OutputDestination>,
    {
        match self.state {
            PipelineState::Idle | PipelineState::Done => self.admit(request, authorization),
            PipelineState::AwaitingAuthorization | PipelineState::Running => {
                if let Some(previous) = self.pending.replace(request) {
                    debug!(replaced = %previous.source, "Pending request replaced");
                }
                Vec::new()
            }
        }
    }

    /// The user granted an output folder (already persisted by the host).
    pub fn on_granted<F>(&mut self, authorization: F) -> Vec<Command>
    where
        F: FnOnce() -> Option<OutputDestination>,
    {
        let Some(destination) = authorization() else {
            debug!(state = ?self.state, "Grant did not validate");
            return match self.state {
                PipelineState::AwaitingAuthorization => self.on_denied(),
                _ => Vec::new(),
            };
        };

        let mut commands = vec![Command::AnnounceFolder(destination.folder.clone())];
        if self.state == PipelineState::AwaitingAuthorization {
            match self.pending.take() {
                Some(request) => {
                    self.state = PipelineState::Running;
                    commands.push(Command::StartRun { request, destination });
                }
                None => self.state = PipelineState::Idle,
            }
        }
        commands
    }

    /// The user declined to pick a folder.
    pub fn on_denied(&mut self) -> Vec<Command> {
        if self.state != PipelineState::AwaitingAuthorization {
            debug!(state = ?self.state, "Ignoring denial outside of an authorization wait");
            return Vec::new();
        }
        self.state = PipelineState::Idle;
        if let Some(dropped) = self.pending.take() {
            debug!(source = %dropped.source, "Pending request discarded");
        }
        vec![Command::NotifyCanceled]
    }

    /// The in-flight run completed (success or failure).
    pub fn on_run_finished<F>(&mut self, authorization: F) -> Vec<Command>
    where
        F: FnOnce() -> Option<OutputDestination>,
    {
        if self.state != PipelineState::Running {
            debug!(state = ?self.state, "Run completion without a running request");
            return Vec::new();
        }
        // Done is left immediately; the pending slot is considered only now.
        self.state = PipelineState::Idle;
        match self.pending.take() {
            Some(next) => self.admit(next, authorization),
            None => Vec::new(),
        }
    }

    fn admit<F>(&mut self, request: ConversionRequest, authorization: F) -> Vec<Command>
    where
        F: FnOnce() -> Option<OutputDestination>,
    {
        match authorization() {
            Some(destination) => {
                self.state = PipelineState::Running;
                vec![Command::StartRun { request, destination }]
            }
            None => {
                self.state = PipelineState::AwaitingAuthorization;
                self.pending = Some(request);
                vec![Command::RequestAuthorization]
            }
        }
    }
}
