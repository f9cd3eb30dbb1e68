#![warn(missing_docs)]

//! NSZ Toolbox conversion core: deferred NSZ/XCZ to NSP/XCI conversion with
//! output-folder authorization, streaming Zstandard decompression, a per-run
//! audit log and optional source deletion.

pub mod audit;
pub mod authorization;
pub mod cli;
pub mod config;
pub mod error;
pub mod external;
pub mod local_fs;
pub mod memory;
pub mod naming;
pub mod notify;
pub mod reference;
pub mod run;
pub mod service;
pub mod state;
pub mod transcode;

pub use audit::AuditLog;
pub use authorization::{
    AuthorizationHost, AuthorizationStore, AuthorizationToken, FileAuthorizationStore,
    MemoryAuthorizationStore, OutputDestination,
};
pub use config::{Backend, ConvertConfig, FileSettings, Settings, StaticSettings};
pub use error::{ConvertError, ErrorKind, ResolverError, Result};
pub use local_fs::LocalResolver;
pub use memory::MemoryResolver;
pub use naming::{ContainerKind, OutputName};
pub use notify::{Notice, Notifier, TracingNotifier};
pub use reference::{Reference, ReferenceResolver};
pub use run::{ConversionRequest, ConversionResult, Converter, RunId, RunStatus, RunWarning};
pub use service::{Collaborators, PipelineEvent, PipelineHandle, PipelineService, PipelineStatus};
pub use state::{PipelineState, StateMachine};
pub use transcode::{Passthrough, StreamFilter, Transcoder, ZstdFilter};
