//! Opaque resource references and the resolver contract that maps them to streams.

use crate::error::ResolverError;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::PathBuf;

/// MIME hint for converted containers.
pub const MIME_OCTET_STREAM: &str = "application/octet-stream";
/// MIME hint for audit logs.
pub const MIME_TEXT_PLAIN: &str = "text/plain";

/// Opaque handle identifying a readable or writable resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Reference(String);

impl Reference {
    /// Wrap a raw reference string.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The raw reference string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last path segment of the reference, percent-decoded.
    ///
    /// Document-provider style references encode the path inside a single
    /// segment (`primary%3ADownload%2Fgame.nsz`), so decoding happens before
    /// splitting. A storage volume prefix (`primary:`) is dropped only when
    /// the segment encodes one; colons that are part of a file name stay.
    pub fn trailing_segment(&self) -> Option<String> {
        let raw = self.0.split(['?', '#']).next().unwrap_or_default();
        let last = raw.rsplit('/').next().unwrap_or_default();
        let decoded = String::from_utf8_lossy(&urlencoding::decode_binary(last.as_bytes())).into_owned();
        let name = decoded.rsplit(['/', '\\']).next().unwrap_or_default();
        let name = if name.len() == decoded.len() && encodes_colon(last) {
            strip_volume_prefix(name)
        } else {
            name
        };
        Some(name.trim()).filter(|s| !s.is_empty()).map(str::to_string)
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Reference {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for Reference {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

fn encodes_colon(segment: &str) -> bool {
    segment.contains("%3A") || segment.contains("%3a")
}

/// `primary:game.nsz` -> `game.nsz`. A volume id is a run of alphanumerics
/// or `-` directly followed by the path.
fn strip_volume_prefix(name: &str) -> &str {
    match name.split_once(':') {
        Some((volume, rest))
            if !volume.is_empty()
                && volume.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
                && rest.chars().next().is_some_and(|c| !c.is_whitespace()) =>
        {
            rest
        }
        _ => name,
    }
}

/// Maps opaque references to display names and byte streams.
///
/// Implemented by the host environment. Object-safe and sync: the pipeline
/// calls it from its blocking worker thread. Every stream handed out is a
/// scoped resource released when dropped.
pub trait ReferenceResolver: Send + Sync {
    /// Metadata lookup of the display name.
    ///
    /// `Ok(None)` means the resource exists but carries no name metadata;
    /// `Err(ReferenceUnavailable)` means the resource itself cannot be reached.
    fn display_name(&self, reference: &Reference) -> Result<Option<String>, ResolverError>;

    /// Open the resource for reading.
    fn open_read(&self, reference: &Reference) -> Result<Box<dyn Read + Send>, ResolverError>;

    /// Open the resource for writing, truncating existing content.
    fn open_write(&self, reference: &Reference) -> Result<Box<dyn Write + Send>, ResolverError>;

    /// Create a new child of `folder`. Collisions the backing store can resolve
    /// (e.g. by suffixing) are resolved; the returned reference names the child
    /// that was actually created.
    fn create_child(
        &self,
        folder: &Reference,
        mime_hint: &str,
        name: &str,
    ) -> Result<Reference, ResolverError>;

    /// Delete the resource.
    fn delete(&self, reference: &Reference) -> Result<(), ResolverError>;

    /// Local filesystem path backing the reference, if there is one.
    fn local_path(&self, _reference: &Reference) -> Option<PathBuf> {
        None
    }

    /// Best-effort display name: metadata, else the trailing path segment,
    /// else `default`.
    fn resolve_name(&self, reference: &Reference, default: &str) -> Result<String, ResolverError> {
        let name = self
            .display_name(reference)?
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .or_else(|| reference.trailing_segment())
            .unwrap_or_else(|| default.to_string());
        Ok(name)
    }
}
