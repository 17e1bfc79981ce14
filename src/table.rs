//! Table identifiers and compiled table artifacts.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::PipelineError;

/// Extension of disassembled table sources.
pub const SOURCE_EXT: &str = "dsl";
/// Extension of compiled tables.
pub const COMPILED_EXT: &str = "aml";

/// Filename stem naming one table inside a workspace (`dsdt`, `ssdt1`, ...).
///
/// Always lowercase and safe to use as a single path segment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableId(String);

impl TableId {
    pub fn new(raw: &str) -> Result<Self, PipelineError> {
        let id = raw.trim().to_ascii_lowercase();
        validate_id(&id)?;
        Ok(Self(id))
    }

    /// Identifier for a file, derived from its stem.
    pub fn from_path(path: &Path) -> Result<Self, PipelineError> {
        let stem = path
            .file_stem()
            .and_then(|part| part.to_str())
            .ok_or_else(|| {
                PipelineError::Validation(format!(
                    "'{}' has no usable file stem",
                    path.display()
                ))
            })?;
        Self::new(stem)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn source_file_name(&self) -> String {
        format!("{}.{SOURCE_EXT}", self.0)
    }

    pub fn compiled_file_name(&self) -> String {
        format!("{}.{COMPILED_EXT}", self.0)
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TableId {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for TableId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn validate_id(id: &str) -> Result<(), PipelineError> {
    if id.is_empty() {
        return Err(PipelineError::Validation(
            "table identifier must not be empty".into(),
        ));
    }
    if id.contains('/') || id.contains('\\') || id.contains("..") {
        return Err(PipelineError::Validation(format!(
            "table identifier must be a safe filename segment: '{id}'"
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(PipelineError::Validation(format!(
            "table identifier contains unsupported characters: '{id}'"
        )));
    }
    Ok(())
}

/// Binary table produced by reassembling one modified source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledTable {
    pub id: TableId,
    pub bytes: Vec<u8>,
    /// Where the assembler left the output.
    pub path: PathBuf,
}
