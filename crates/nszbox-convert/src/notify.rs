//! User-visible notices emitted by the pipeline.

use crate::error::ErrorKind;
use crate::reference::Reference;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Something the user should be told about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notice {
    /// The output folder picker was opened on behalf of a pending request.
    AuthorizationRequested,
    /// The user declined to pick an output folder; the pending request was dropped.
    AuthorizationCanceled,
    /// An output folder was authorized.
    OutputFolderSet {
        /// Authorized folder
        folder: Reference,
    },
    /// A run finished successfully.
    ConversionSucceeded {
        /// Converted container
        output: Reference,
        /// Decompressed bytes written
        bytes: u64,
    },
    /// A run failed.
    ConversionFailed {
        /// What failed
        kind: ErrorKind,
        /// Human-readable cause
        cause: String,
    },
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Notice::AuthorizationRequested => write!(f, "Choose an output folder to continue."),
            Notice::AuthorizationCanceled => write!(f, "Folder not selected."),
            Notice::OutputFolderSet { .. } => write!(f, "Output folder set."),
            Notice::ConversionSucceeded { output, bytes } => {
                write!(f, "Done! Wrote {} bytes to {}", bytes, output)
            }
            Notice::ConversionFailed { kind, cause } => write!(f, "Error ({}): {}", kind, cause),
        }
    }
}

/// Host-side sink for notices (toast, status line, ...).
pub trait Notifier: Send + Sync {
    /// Show a notice to the user.
    fn notify(&self, notice: Notice);
}

/// Notifier that forwards notices to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notice: Notice) {
        match &notice {
            Notice::ConversionFailed { kind, .. } => warn!(%kind, "{}", notice),
            Notice::AuthorizationCanceled => warn!("{}", notice),
            _ => info!("{}", notice),
        }
    }
}
