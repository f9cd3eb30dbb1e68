//! Conversion configuration and persisted host settings.

use crate::error::{ConvertError, Result};
use crate::reference::Reference;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Smallest copy buffer the transcoder will use.
pub const MIN_BUFFER_SIZE: usize = 8 * 1024;
/// Largest copy buffer the transcoder will use.
pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// How the decompressed output is produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backend {
    /// Stream the source through the Zstd filter.
    #[default]
    Stream,
    /// Delegate to an external full-format converter.
    External {
        /// Program to run
        program: String,
        /// Arguments; `{input}` and `{output}` are replaced by local paths
        args: Vec<String>,
    },
}

/// Tuning and naming knobs for the conversion pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvertConfig {
    /// Intermediate copy buffer size in bytes
    pub buffer_size: usize,
    /// Name of the per-run audit log created in the output folder
    pub log_file_name: String,
    /// Where the audit log goes when the output folder refuses it
    pub fallback_log_folder: Option<Reference>,
    /// Output stem used when the source name has no recognized extension
    pub fallback_stem: String,
    /// Source display name used when the reference yields none
    pub default_source_name: String,
    /// Largest Zstd window (log2) the decoder accepts
    pub zstd_window_log_max: u32,
    /// Capacity of the pipeline event channel
    pub channel_capacity: usize,
    /// Output producer
    pub backend: Backend,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            buffer_size: 64 * 1024,
            log_file_name: String::from("nsz_debug.log.txt"),
            fallback_log_folder: None,
            fallback_stem: String::from("shared-file"),
            default_source_name: String::from("shared-file.nsz"),
            zstd_window_log_max: 31,
            channel_capacity: 64,
            backend: Backend::Stream,
        }
    }
}

impl ConvertConfig {
    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConvertError::Config(format!("{}: {}", path.display(), e)))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| ConvertError::Config(e.to_string())),
            "json" => {
                serde_json::from_str(&contents).map_err(|e| ConvertError::Config(e.to_string()))
            }
            _ => Err(ConvertError::Config(format!(
                "Unsupported config file extension: {}",
                ext
            ))),
        }
    }

    /// Copy buffer size clamped to the supported range.
    pub fn effective_buffer_size(&self) -> usize {
        self.buffer_size.clamp(MIN_BUFFER_SIZE, MAX_BUFFER_SIZE)
    }
}

/// Persisted toggles the core reads but never writes.
pub trait Settings: Send + Sync {
    /// Delete the source after a successful conversion.
    fn delete_source_on_success(&self) -> bool;

    /// Identifier of the last granted destination. Advisory only: the
    /// authorization store is authoritative.
    fn cached_destination(&self) -> Option<String>;
}

/// Settings snapshot held in memory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticSettings {
    /// Delete the source after a successful conversion
    pub delete_source_on_success: bool,
    /// Identifier of the last granted destination
    pub cached_destination: Option<String>,
}

impl Settings for StaticSettings {
    fn delete_source_on_success(&self) -> bool {
        self.delete_source_on_success
    }

    fn cached_destination(&self) -> Option<String> {
        self.cached_destination.clone()
    }
}

/// Settings persisted as JSON, re-read on every query.
#[derive(Debug, Clone)]
pub struct FileSettings {
    path: PathBuf,
}

impl FileSettings {
    /// Settings backed by the JSON file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Current snapshot; a missing file yields defaults.
    pub fn load(&self) -> Result<StaticSettings> {
        read_json(&self.path)
            .map(Option::unwrap_or_default)
            .map_err(|e| ConvertError::Store(format!("{}: {}", self.path.display(), e)))
    }

    /// Persist a snapshot.
    pub fn save(&self, settings: &StaticSettings) -> Result<()> {
        write_json_atomic(&self.path, settings)
            .map_err(|e| ConvertError::Store(format!("{}: {}", self.path.display(), e)))
    }

    fn snapshot(&self) -> StaticSettings {
        self.load().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to read settings, using defaults");
            StaticSettings::default()
        })
    }
}

impl Settings for FileSettings {
    fn delete_source_on_success(&self) -> bool {
        self.snapshot().delete_source_on_success
    }

    fn cached_destination(&self) -> Option<String> {
        self.snapshot().cached_destination
    }
}

/// Read a JSON document; a missing file is `Ok(None)`.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Write a JSON document via a uniquely named sibling temp file and rename, so
/// readers never observe a torn file and concurrent writers never share a
/// temp file.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => {
            std::fs::create_dir_all(parent)?;
            parent
        }
        None => Path::new("."),
    };
    let json = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&json)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
