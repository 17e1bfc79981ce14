//! External collaborators consumed by the pipeline.
//!
//! Each helper sits behind a small trait so the stages can be driven by the
//! real host tools or by in-process fakes:
//! - [`FirmwareDump`] - raw dump of every loaded ACPI table (`acpidump`)
//! - [`TableSplitter`] - one binary extract per table (`acpixtract`)
//! - [`Disassembler`] - binary table <-> editable source (`iasl`)
//! - [`Archiver`] - newc archive of the override tree (`cpio` or built-in)

pub mod acpica;
pub mod cpio;

use std::path::{Path, PathBuf};

use crate::boot::{BootConfigStore, Grubby};
use crate::config::{ArchiveFormat, Settings};
use crate::error::ToolError;
use crate::process::CancelToken;
use crate::table::TableId;

/// Produces a single blob holding all currently loaded ACPI tables.
pub trait FirmwareDump {
    fn dump(&self, blob: &Path, cancel: &CancelToken) -> Result<(), ToolError>;
}

/// Splits a firmware blob into one binary file per table inside `dest_dir`.
///
/// File names must be stable and collision-free per table; the stem becomes
/// the table identifier.
pub trait TableSplitter {
    fn split(&self, blob: &Path, dest_dir: &Path, cancel: &CancelToken) -> Result<(), ToolError>;
}

/// Round-trip capable table disassembler.
pub trait Disassembler {
    /// Disassemble `table` into `out_dir/<id>.dsl`, returning that path.
    fn disassemble(
        &self,
        table: &Path,
        id: &TableId,
        out_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<PathBuf, ToolError>;

    /// Compile `source` into `out_dir/<id>.aml`, returning that path.
    fn assemble(
        &self,
        source: &Path,
        id: &TableId,
        out_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<PathBuf, ToolError>;
}

/// Archives a directory tree into the kernel's override format (newc cpio).
pub trait Archiver {
    fn archive(&self, root: &Path, cancel: &CancelToken) -> Result<Vec<u8>, ToolError>;
}

/// Every collaborator the pipeline needs.
pub struct Toolset {
    pub dump: Box<dyn FirmwareDump>,
    pub splitter: Box<dyn TableSplitter>,
    pub disassembler: Box<dyn Disassembler>,
    pub archiver: Box<dyn Archiver>,
    pub boot_store: Box<dyn BootConfigStore>,
}

impl Toolset {
    /// Host tools as configured in `settings`.
    pub fn system(settings: &Settings) -> Self {
        let tools = &settings.tools;
        let timeout = settings.tool_timeout;
        let archiver: Box<dyn Archiver> = match settings.archive_format {
            ArchiveFormat::Cpio => Box::new(cpio::CpioArchiver::new(&tools.cpio, timeout)),
            ArchiveFormat::Native => Box::new(cpio::NewcArchiver),
        };
        Self {
            dump: Box::new(acpica::Acpidump::new(&tools.acpidump, timeout)),
            splitter: Box::new(acpica::Acpixtract::new(&tools.acpixtract, timeout)),
            disassembler: Box::new(acpica::Iasl::new(&tools.iasl, timeout)),
            archiver,
            boot_store: Box::new(Grubby::new(&tools.grubby, timeout)),
        }
    }
}
