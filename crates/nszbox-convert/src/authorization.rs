//! Persisted output-folder authorization.
//!
//! The store keeps a single slot: the output destination the user granted
//! write access to. It survives restarts. The pipeline only reads it, and
//! re-validates liveness through the [`AuthorizationHost`] before each use
//! since the environment can revoke a grant silently.

use crate::config::{read_json, write_json_atomic};
use crate::error::{ConvertError, Result};
use crate::reference::Reference;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, warn};

/// Opaque durable write grant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthorizationToken(String);

impl AuthorizationToken {
    /// Wrap a raw token.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A granted output destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDestination {
    /// Folder converted outputs and logs are created in
    pub folder: Reference,
    /// Write grant for the folder
    pub token: AuthorizationToken,
    /// When the user granted access
    pub granted_at: DateTime<Utc>,
}

impl OutputDestination {
    /// Destination granted now.
    pub fn granted(folder: Reference, token: AuthorizationToken) -> Self {
        Self { folder, token, granted_at: Utc::now() }
    }

    /// Destination whose token is the folder reference itself, as hosts
    /// without a separate grant handle (plain filesystems) issue them.
    pub fn for_folder(folder: Reference) -> Self {
        let token = AuthorizationToken::new(folder.as_str());
        Self::granted(folder, token)
    }
}

/// Process-wide persisted authorization slot.
pub trait AuthorizationStore: Send + Sync {
    /// Current grant, if any.
    fn load(&self) -> Result<Option<OutputDestination>>;

    /// Persist a grant, replacing any previous one.
    fn save(&self, destination: &OutputDestination) -> Result<()>;

    /// Forget the current grant.
    fn revoke(&self) -> Result<()>;
}

/// Host-side authorization UI and liveness check.
pub trait AuthorizationHost: Send + Sync {
    /// Ask the user to pick and authorize an output folder.
    ///
    /// Fire-and-forget: the answer arrives later as a granted or denied event.
    fn request_authorization(&self);

    /// True if the grant is still usable right now.
    fn is_valid(&self, destination: &OutputDestination) -> bool;
}

/// Read the store and re-validate the grant. Store failures count as "no grant".
pub fn current_authorization(
    store: &dyn AuthorizationStore,
    host: &dyn AuthorizationHost,
) -> Option<OutputDestination> {
    match store.load() {
        Ok(Some(destination)) if host.is_valid(&destination) => Some(destination),
        Ok(Some(destination)) => {
            warn!(folder = %destination.folder, "Stored authorization is no longer valid");
            None
        }
        Ok(None) => None,
        Err(e) => {
            warn!(error = %e, "Failed to read authorization store");
            None
        }
    }
}

/// In-memory store, for tests and hosts that keep their own persistence.
#[derive(Debug, Default)]
pub struct MemoryAuthorizationStore {
    slot: RwLock<Option<OutputDestination>>,
}

impl MemoryAuthorizationStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding `destination`.
    pub fn with_destination(destination: OutputDestination) -> Self {
        Self { slot: RwLock::new(Some(destination)) }
    }
}

impl AuthorizationStore for MemoryAuthorizationStore {
    fn load(&self) -> Result<Option<OutputDestination>> {
        Ok(self.slot.read().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn save(&self, destination: &OutputDestination) -> Result<()> {
        *self.slot.write().unwrap_or_else(|e| e.into_inner()) = Some(destination.clone());
        Ok(())
    }

    fn revoke(&self) -> Result<()> {
        *self.slot.write().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}

/// JSON file store that survives process restarts.
#[derive(Debug, Clone)]
pub struct FileAuthorizationStore {
    path: PathBuf,
}

impl FileAuthorizationStore {
    /// Store backed by the JSON file at `path` (created on first save).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuthorizationStore for FileAuthorizationStore {
    fn load(&self) -> Result<Option<OutputDestination>> {
        read_json(&self.path).map_err(|e| ConvertError::Store(format!("{}: {}", self.path.display(), e)))
    }

    fn save(&self, destination: &OutputDestination) -> Result<()> {
        write_json_atomic(&self.path, destination)
            .map_err(|e| ConvertError::Store(format!("{}: {}", self.path.display(), e)))?;
        debug!(folder = %destination.folder, "Persisted output authorization");
        Ok(())
    }

    fn revoke(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ConvertError::Store(format!("{}: {}", self.path.display(), e))),
        }
    }
}
