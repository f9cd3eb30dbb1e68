//! Filesystem-backed reference resolver.
//!
//! References are plain paths or `file://` URIs. Folders are directories;
//! child creation never overwrites: a colliding name is retried as
//! `stem (n).ext`, the way document providers resolve collisions.

use crate::error::ResolverError;
use crate::reference::{Reference, ReferenceResolver};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const FILE_SCHEME: &str = "file://";
const MAX_COLLISION_SUFFIX: u32 = 64;

/// Resolver over the local filesystem.
#[derive(Debug, Clone, Default)]
pub struct LocalResolver;

impl LocalResolver {
    /// Create a new local resolver.
    pub fn new() -> Self {
        Self
    }

    /// Filesystem path a reference points at.
    pub fn path_of(reference: &Reference) -> PathBuf {
        let raw = reference.as_str();
        PathBuf::from(raw.strip_prefix(FILE_SCHEME).unwrap_or(raw))
    }

    /// Reference for a filesystem path.
    pub fn reference_for(path: &Path) -> Reference {
        Reference::new(path.to_string_lossy().into_owned())
    }

    /// True if `path` is an existing directory whose permissions allow writing.
    pub fn is_writable_dir(path: &Path) -> bool {
        match fs::metadata(path) {
            Ok(meta) => meta.is_dir() && !meta.permissions().readonly(),
            Err(_) => false,
        }
    }
}

fn unavailable(reference: &Reference, e: io::Error) -> ResolverError {
    ResolverError::ReferenceUnavailable(format!("{}: {}", reference, e))
}

fn valid_child_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\', '\0'])
}

fn suffixed_name(name: &str, n: u32) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{} ({}).{}", stem, n, ext),
        _ => format!("{} ({})", name, n),
    }
}

impl ReferenceResolver for LocalResolver {
    fn display_name(&self, reference: &Reference) -> Result<Option<String>, ResolverError> {
        let path = Self::path_of(reference);
        fs::metadata(&path).map_err(|e| unavailable(reference, e))?;
        Ok(path.file_name().map(|n| n.to_string_lossy().into_owned()))
    }

    fn open_read(&self, reference: &Reference) -> Result<Box<dyn Read + Send>, ResolverError> {
        let file = File::open(Self::path_of(reference)).map_err(|e| unavailable(reference, e))?;
        Ok(Box::new(file))
    }

    fn open_write(&self, reference: &Reference) -> Result<Box<dyn Write + Send>, ResolverError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(Self::path_of(reference))
            .map_err(|e| unavailable(reference, e))?;
        Ok(Box::new(file))
    }

    fn create_child(
        &self,
        folder: &Reference,
        _mime_hint: &str,
        name: &str,
    ) -> Result<Reference, ResolverError> {
        if !valid_child_name(name) {
            return Err(ResolverError::CreateFailed(format!("invalid child name {:?}", name)));
        }
        let dir = Self::path_of(folder);
        if !dir.is_dir() {
            return Err(ResolverError::CreateFailed(format!(
                "folder {} is not an accessible directory",
                folder
            )));
        }

        let mut candidate = name.to_string();
        for n in 1..=MAX_COLLISION_SUFFIX + 1 {
            let path = dir.join(&candidate);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => {
                    debug!(path = %path.display(), "Created child");
                    return Ok(Self::reference_for(&path));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    candidate = suffixed_name(name, n);
                }
                Err(e) => {
                    return Err(ResolverError::CreateFailed(format!("{}: {}", path.display(), e)));
                }
            }
        }
        Err(ResolverError::CreateFailed(format!(
            "{} collides with {} existing children in {}",
            name, MAX_COLLISION_SUFFIX, folder
        )))
    }

    fn delete(&self, reference: &Reference) -> Result<(), ResolverError> {
        fs::remove_file(Self::path_of(reference))
            .map_err(|e| ResolverError::DeletionFailed(format!("{}: {}", reference, e)))
    }

    fn local_path(&self, reference: &Reference) -> Option<PathBuf> {
        Some(Self::path_of(reference))
    }
}
