//! The on-disk scratch tree the pipeline works in.
//!
//! ```text
//! <root>/
//!   raw/        firmware dump + per-table binary extracts
//!   origin/     disassembled sources, never touched after extraction
//!   modified/   editable copies, one per origin file
//! <root>.lock   advisory lock serialising operators
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{IoContext, PipelineError, Result};
use crate::table::{TableId, SOURCE_EXT};

const RAW_DIR: &str = "raw";
const ORIGIN_DIR: &str = "origin";
const MODIFIED_DIR: &str = "modified";
const RAW_BLOB: &str = "acpidump.out";
const SPLIT_DIR: &str = "tables";

/// Handle on one workspace tree. Construction does no I/O.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.root.join(RAW_DIR)
    }

    pub fn origin_dir(&self) -> PathBuf {
        self.root.join(ORIGIN_DIR)
    }

    pub fn modified_dir(&self) -> PathBuf {
        self.root.join(MODIFIED_DIR)
    }

    /// Where the firmware dump is written.
    pub fn raw_blob(&self) -> PathBuf {
        self.raw_dir().join(RAW_BLOB)
    }

    /// Where the splitter leaves per-table binaries.
    pub fn split_dir(&self) -> PathBuf {
        self.raw_dir().join(SPLIT_DIR)
    }

    pub fn origin_source(&self, id: &TableId) -> PathBuf {
        self.origin_dir().join(id.source_file_name())
    }

    pub fn modified_source(&self, id: &TableId) -> PathBuf {
        self.modified_dir().join(id.source_file_name())
    }

    pub fn lock_path(&self) -> PathBuf {
        let mut name = self.root.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Destroy any previous tree and recreate the empty regions.
    pub fn reset(&self) -> Result<()> {
        if let Ok(md) = fs::symlink_metadata(&self.root) {
            if !md.is_dir() {
                return Err(PipelineError::Io {
                    context: format!(
                        "workspace root '{}' is occupied by a non-directory",
                        self.root.display()
                    ),
                    source: io::Error::from(io::ErrorKind::AlreadyExists),
                });
            }
            fs::remove_dir_all(&self.root).io_context(&self.root, || {
                format!("removing previous workspace '{}'", self.root.display())
            })?;
        }

        for dir in [self.raw_dir(), self.origin_dir(), self.modified_dir()] {
            fs::create_dir_all(&dir).io_context(&dir, || {
                format!("recreating workspace region '{}'", dir.display())
            })?;
        }
        Ok(())
    }

    /// Editable tables, sorted. Files without an origin counterpart are skipped.
    pub fn list_tables(&self) -> Result<Vec<TableId>> {
        let dir = self.modified_dir();
        let entries =
            fs::read_dir(&dir).io_context(&dir, || format!("reading '{}'", dir.display()))?;

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.io_context(&dir, || format!("iterating '{}'", dir.display()))?;
            let path = entry.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(SOURCE_EXT) {
                continue;
            }
            let id = match TableId::from_path(&path) {
                Ok(id) => id,
                Err(err) => {
                    log::warn!("skipping '{}': {err}", path.display());
                    continue;
                }
            };
            if !self.origin_source(&id).is_file() {
                log::warn!("skipping '{}': no origin source", path.display());
                continue;
            }
            ids.push(id);
        }
        ids.sort();
        Ok(ids)
    }

    pub fn read_modified(&self, id: &TableId) -> Result<String> {
        let path = self.modified_source(id);
        if !path.is_file() {
            return Err(PipelineError::NotFound(id.clone()));
        }
        fs::read_to_string(&path).io_context(&path, || format!("reading '{}'", path.display()))
    }

    /// Replace the editable source. Syntax is only checked at reassembly.
    pub fn write_modified(&self, id: &TableId, text: &str) -> Result<()> {
        validate_source_text(id, text)?;
        if !self.origin_source(id).is_file() {
            return Err(PipelineError::Validation(format!(
                "'{id}' is not an extracted table"
            )));
        }
        write_atomic(&self.modified_source(id), text.as_bytes())
    }

    /// True when the editable copy differs from the extracted source.
    pub fn is_modified(&self, id: &TableId) -> Result<bool> {
        let modified = self.modified_source(id);
        if !modified.is_file() {
            return Err(PipelineError::NotFound(id.clone()));
        }
        let origin = self.origin_source(id);
        let a = fs::read(&modified)
            .io_context(&modified, || format!("reading '{}'", modified.display()))?;
        let b = fs::read(&origin).io_context(&origin, || format!("reading '{}'", origin.display()))?;
        Ok(a != b)
    }

    pub fn modified_tables(&self) -> Result<Vec<TableId>> {
        let mut out = Vec::new();
        for id in self.list_tables()? {
            if self.is_modified(&id)? {
                out.push(id);
            }
        }
        Ok(out)
    }

    /// Block until this process owns the workspace.
    pub fn lock(&self) -> Result<WorkspaceLock> {
        let (file, path) = self.open_lock_file()?;
        file.lock_exclusive()
            .io_context(&path, || format!("locking '{}'", path.display()))?;
        Ok(WorkspaceLock { file, path })
    }

    /// Take the lock or fail with [`PipelineError::Busy`].
    pub fn try_lock(&self) -> Result<WorkspaceLock> {
        let (file, path) = self.open_lock_file()?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(WorkspaceLock { file, path }),
            Err(err) if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                Err(PipelineError::Busy { lock: path })
            }
            Err(err) => Err(PipelineError::io(
                format!("locking '{}'", path.display()),
                &path,
                err,
            )),
        }
    }

    fn open_lock_file(&self) -> Result<(File, PathBuf)> {
        let path = self.lock_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .io_context(parent, || format!("creating '{}'", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .io_context(&path, || format!("opening lock '{}'", path.display()))?;
        Ok((file, path))
    }
}

/// Exclusive workspace lock; released on drop.
#[derive(Debug)]
pub struct WorkspaceLock {
    file: File,
    path: PathBuf,
}

impl WorkspaceLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn validate_source_text(id: &TableId, text: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Err(PipelineError::Validation(format!(
            "refusing to write empty source for '{id}'"
        )));
    }
    let disallowed = |c: &char| c.is_control() && !matches!(c, '\n' | '\r' | '\t');
    for (n, line) in text.split('\n').enumerate() {
        if let Some(c) = line.chars().find(disallowed) {
            return Err(PipelineError::Validation(format!(
                "source for '{id}' contains control character {c:?} on line {}",
                n + 1
            )));
        }
    }
    Ok(())
}

/// Write via a sibling temp file and rename, so readers never see a torn file.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::Builder::new()
        .prefix(".acpied-")
        .tempfile_in(dir)
        .io_context(dir, || format!("creating temp file in '{}'", dir.display()))?;
    tmp.write_all(bytes)
        .io_context(path, || format!("writing '{}'", path.display()))?;
    tmp.persist(path)
        .map_err(|err| PipelineError::io(format!("replacing '{}'", path.display()), path, err.error))?;
    Ok(())
}
