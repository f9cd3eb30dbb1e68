//! Output file naming for compressed Switch containers.

use serde::{Deserialize, Serialize};

/// Extension used when the source kind cannot be recognized.
pub const CANONICAL_OUTPUT_EXTENSION: &str = "nsp";

/// Compressed container kinds and their decompressed siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerKind {
    /// Compressed NSP
    Nsz,
    /// Compressed XCI
    Xcz,
}

impl ContainerKind {
    /// Recognize a source extension, case-insensitively.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "nsz" => Some(ContainerKind::Nsz),
            "xcz" => Some(ContainerKind::Xcz),
            _ => None,
        }
    }

    /// Extension of the compressed container.
    pub fn source_extension(self) -> &'static str {
        match self {
            ContainerKind::Nsz => "nsz",
            ContainerKind::Xcz => "xcz",
        }
    }

    /// Extension of the decompressed container.
    pub fn output_extension(self) -> &'static str {
        match self {
            ContainerKind::Nsz => "nsp",
            ContainerKind::Xcz => "xci",
        }
    }
}

/// Name of the converted output, derived from the source display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputName {
    /// File name to create in the output folder
    pub name: String,
    /// Recognized source kind; `None` when the fallback name was used
    pub kind: Option<ContainerKind>,
}

impl OutputName {
    /// Strip a recognized source extension and append its output extension.
    /// Anything else becomes `<fallback_stem>.nsp`.
    pub fn derive(source_name: &str, fallback_stem: &str) -> Self {
        let recognized = source_name.trim().rsplit_once('.').and_then(|(stem, ext)| {
            let stem = stem.trim();
            let kind = ContainerKind::from_extension(ext)?;
            (!stem.is_empty()).then(|| (stem, kind))
        });

        match recognized {
            Some((stem, kind)) => Self {
                name: format!("{}.{}", stem, kind.output_extension()),
                kind: Some(kind),
            },
            None => Self {
                name: format!("{}.{}", fallback_stem, CANONICAL_OUTPUT_EXTENSION),
                kind: None,
            },
        }
    }
}

impl std::fmt::Display for OutputName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}
