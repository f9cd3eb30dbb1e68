//! Delegation to an external full-format converter.
//!
//! Used for containers whose layout the streaming path cannot handle. The
//! tool is a black box: it receives local input and output paths through
//! `{input}` / `{output}` placeholders and signals success by exit status.

use crate::error::{ConvertError, Result};
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{debug, instrument};

const INPUT_PLACEHOLDER: &str = "{input}";
const OUTPUT_PLACEHOLDER: &str = "{output}";
const STDERR_TAIL: usize = 512;

/// External converter invocation template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalConverter {
    program: String,
    args: Vec<String>,
}

impl ExternalConverter {
    /// Converter running `program` with `args`.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self { program: program.into(), args }
    }

    /// Program name.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments with placeholders substituted.
    pub fn arguments(&self, input: &Path, output: &Path) -> Vec<String> {
        let input = input.to_string_lossy();
        let output = output.to_string_lossy();
        self.args
            .iter()
            .map(|a| a.replace(INPUT_PLACEHOLDER, &input).replace(OUTPUT_PLACEHOLDER, &output))
            .collect()
    }

    /// Run the tool and return the size of the produced output.
    ///
    /// A non-zero exit is reported as [`ConvertError::Codec`] (the tool
    /// rejected the container); failing to start it, or to stat its output,
    /// as [`ConvertError::Io`].
    #[instrument(skip(self), fields(program = %self.program))]
    pub fn convert(&self, input: &Path, output: &Path) -> Result<u64> {
        let args = self.arguments(input, output);
        debug!(?args, "Running external converter");
        let result = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let trimmed = stderr.trim();
            let tail = match trimmed.char_indices().rev().nth(STDERR_TAIL) {
                Some((idx, _)) => &trimmed[idx..],
                None => trimmed,
            };
            return Err(ConvertError::Codec(format!(
                "{} exited with {}: {}",
                self.program, result.status, tail
            )));
        }

        let bytes = std::fs::metadata(output)?.len();
        debug!(bytes, "External converter finished");
        Ok(bytes)
    }
}
