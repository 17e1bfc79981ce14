//! ACPICA host tools: `acpidump`, `acpixtract` and `iasl`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ToolError;
use crate::process::{CancelToken, ToolCommand};
use crate::table::TableId;

use super::{Disassembler, FirmwareDump, TableSplitter};

/// `acpidump -o <blob>`.
#[derive(Debug, Clone)]
pub struct Acpidump {
    program: PathBuf,
    timeout: Duration,
}

impl Acpidump {
    pub fn new(program: &Path, timeout: Duration) -> Self {
        Self {
            program: program.to_path_buf(),
            timeout,
        }
    }
}

impl FirmwareDump for Acpidump {
    fn dump(&self, blob: &Path, cancel: &CancelToken) -> Result<(), ToolError> {
        ToolCommand::new(&self.program)
            .arg("-o")
            .arg(blob)
            .timeout(self.timeout)
            .run(cancel)?;
        Ok(())
    }
}

/// `acpixtract -a <blob>`, run inside the destination directory.
///
/// acpixtract writes `<signature>[n].dat` into its working directory.
#[derive(Debug, Clone)]
pub struct Acpixtract {
    program: PathBuf,
    timeout: Duration,
}

impl Acpixtract {
    pub fn new(program: &Path, timeout: Duration) -> Self {
        Self {
            program: program.to_path_buf(),
            timeout,
        }
    }
}

impl TableSplitter for Acpixtract {
    fn split(&self, blob: &Path, dest_dir: &Path, cancel: &CancelToken) -> Result<(), ToolError> {
        let blob = absolute(blob).map_err(|source| ToolError::Io {
            program: self.program.display().to_string(),
            source,
        })?;
        ToolCommand::new(&self.program)
            .arg("-a")
            .arg(blob)
            .current_dir(dest_dir)
            .timeout(self.timeout)
            .run(cancel)?;
        Ok(())
    }
}

/// `iasl` in both directions, using `-p` to pin the output name to the table id.
#[derive(Debug, Clone)]
pub struct Iasl {
    program: PathBuf,
    timeout: Duration,
}

impl Iasl {
    pub fn new(program: &Path, timeout: Duration) -> Self {
        Self {
            program: program.to_path_buf(),
            timeout,
        }
    }

    fn command(&self, id: &TableId, out_dir: &Path) -> ToolCommand {
        ToolCommand::new(&self.program)
            .arg("-p")
            .arg(out_dir.join(id.as_str()))
            .timeout(self.timeout)
    }
}

impl Disassembler for Iasl {
    fn disassemble(
        &self,
        table: &Path,
        id: &TableId,
        out_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<PathBuf, ToolError> {
        self.command(id, out_dir).arg("-d").arg(table).run(cancel)?;
        Ok(out_dir.join(id.source_file_name()))
    }

    fn assemble(
        &self,
        source: &Path,
        id: &TableId,
        out_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<PathBuf, ToolError> {
        self.command(id, out_dir).arg(source).run(cancel)?;
        Ok(out_dir.join(id.compiled_file_name()))
    }
}

fn absolute(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
