//! Preflight checks for the host.
//!
//! Validates that the ACPI and boot loader tools are installed, and that the
//! process runs as root, before anything touches the workspace or `/boot`.
//!
//! # Example
//!
//! ```rust,no_run
//! use acpi_override::config::Settings;
//! use acpi_override::preflight::{check_required_tools, check_root, required_tools};
//!
//! let settings = Settings::default();
//! if let Err(e) = check_required_tools(&required_tools(&settings)) {
//!     eprintln!("{}", e);
//! }
//! check_root()?;
//! # Ok::<(), anyhow::Error>(())
//! ```

use anyhow::{bail, Result};
use std::path::Path;

use crate::config::{ArchiveFormat, Settings};

/// Check if a command exists on the host system.
///
/// Absolute or relative paths are checked directly; bare names are searched
/// in `PATH`.
pub fn command_exists(cmd: impl AsRef<Path>) -> bool {
    which::which(cmd.as_ref()).is_ok()
}

/// Tools the configured pipeline will run.
///
/// Each tuple is (command, package).
pub fn required_tools(settings: &Settings) -> Vec<(String, &'static str)> {
    let tools = &settings.tools;
    let mut required = vec![
        (tools.acpidump.display().to_string(), "acpica-tools"),
        (tools.acpixtract.display().to_string(), "acpica-tools"),
        (tools.iasl.display().to_string(), "acpica-tools"),
        (tools.grubby.display().to_string(), "grubby"),
    ];
    if settings.archive_format == ArchiveFormat::Cpio {
        required.push((tools.cpio.display().to_string(), "cpio"));
    }
    required
}

/// Check that specific tools are available.
///
/// Returns an error listing every missing tool with the package that ships it.
pub fn check_required_tools<S: AsRef<str>>(tools: &[(S, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool.as_ref()))
        .map(|(tool, package)| format!("  {} (install: {})", tool.as_ref(), package))
        .collect();

    if !missing.is_empty() {
        bail!("Missing required host tools:\n{}", missing.join("\n"));
    }

    Ok(())
}

/// Dumping firmware tables and rewriting boot entries both need root.
pub fn check_root() -> Result<()> {
    // SAFETY: geteuid has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        bail!("acpied must run as root (effective uid is {euid})");
    }
    Ok(())
}
