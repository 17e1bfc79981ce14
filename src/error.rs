//! Error taxonomy for the table-override pipeline.
//!
//! Errors that affect a single table ([`TableFailure`]) are collected next to
//! the successful results. Errors that affect a whole stage are
//! [`PipelineError`]s and abort the remaining stages of an apply attempt.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

use crate::table::TableId;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Failure of one external helper process.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("'{program}' exited with {status}: {diagnostic}")]
    Failed {
        program: String,
        status: ExitStatus,
        diagnostic: String,
    },

    #[error("'{program}' did not finish within {}s", timeout.as_secs())]
    TimedOut { program: String, timeout: Duration },

    #[error("'{program}' was cancelled")]
    Cancelled { program: String },

    #[error("i/o error while driving '{program}': {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
}

impl ToolError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ToolError::Cancelled { .. })
    }

    /// Text suitable for showing the operator what the tool complained about.
    pub fn diagnostic(&self) -> String {
        match self {
            ToolError::Failed { diagnostic, .. } => diagnostic.clone(),
            other => other.to_string(),
        }
    }
}

/// Errors from the boot loader configuration store.
#[derive(Debug, Error)]
pub enum BootStoreError {
    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("unparseable boot entry: {0}")]
    Parse(String),
}

/// Stage-wide pipeline error.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// The filesystem ran out of space; stale override images should be pruned.
    #[error("no space left while writing '{}'; remove stale override images and retry", path.display())]
    DiskFull { path: PathBuf },

    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("table '{0}' not found in workspace")]
    NotFound(TableId),

    #[error("invalid input: {0}")]
    Validation(String),

    /// Every selected table failed to compile.
    #[error("compile failed: {0}")]
    Compile(String),

    #[error("cannot compose override image: {0}")]
    Compose(String),

    #[error("boot entry update failed: {0}")]
    BootUpdate(String),

    #[error("workspace is in use by another process (lock '{}')", lock.display())]
    Busy { lock: PathBuf },

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Tool(ToolError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Wrap an I/O error, classifying `ENOSPC` as [`PipelineError::DiskFull`].
    pub fn io(context: impl Into<String>, path: impl Into<PathBuf>, source: io::Error) -> Self {
        if source.raw_os_error() == Some(libc::ENOSPC) {
            return PipelineError::DiskFull { path: path.into() };
        }
        PipelineError::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<ToolError> for PipelineError {
    fn from(err: ToolError) -> Self {
        if err.is_cancelled() {
            PipelineError::Cancelled
        } else {
            PipelineError::Tool(err)
        }
    }
}

/// Attach path context to `std::io` results.
pub(crate) trait IoContext<T> {
    fn io_context<F, S>(self, path: &std::path::Path, context: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn io_context<F, S>(self, path: &std::path::Path, context: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|source| PipelineError::io(context(), path, source))
    }
}

/// Why a single table was left out of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableFailureKind {
    NotFound,
    Compile { diagnostic: String },
}

/// Per-table, non-fatal failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableFailure {
    pub id: TableId,
    pub kind: TableFailureKind,
}

impl fmt::Display for TableFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            TableFailureKind::NotFound => write!(f, "{}: no modified source found", self.id),
            TableFailureKind::Compile { diagnostic } => {
                write!(f, "{}: compile error: {}", self.id, diagnostic)
            }
        }
    }
}

/// States of one apply attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyStage {
    Idle,
    Extracting,
    Editable,
    Reassembling,
    Composing,
    Updating,
    Applied,
}

impl ApplyStage {
    pub fn as_str(self) -> &'static str {
        match self {
            ApplyStage::Idle => "idle",
            ApplyStage::Extracting => "extracting",
            ApplyStage::Editable => "editable",
            ApplyStage::Reassembling => "reassembling",
            ApplyStage::Composing => "composing",
            ApplyStage::Updating => "updating",
            ApplyStage::Applied => "applied",
        }
    }
}

impl fmt::Display for ApplyStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure of an apply attempt.
///
/// The operator re-enters at the editable state after fixing the cause.
#[derive(Debug, Error)]
#[error("{stage} failed: {cause}")]
pub struct ApplyFailure {
    pub stage: ApplyStage,
    #[source]
    pub cause: PipelineError,
    pub table_failures: Vec<TableFailure>,
}

impl ApplyFailure {
    pub fn new(stage: ApplyStage, cause: PipelineError) -> Self {
        Self {
            stage,
            cause,
            table_failures: Vec::new(),
        }
    }

    pub fn with_table_failures(mut self, failures: Vec<TableFailure>) -> Self {
        self.table_failures = failures;
        self
    }
}
