//! Boot loader configuration: discover the default entry's initrd and repoint it.
//!
//! This is the only part of the pipeline with a persistent, externally visible
//! effect. The store's own update call is treated as atomic; on failure the
//! previous entry is left as the boot loader had it and the composed image is
//! kept for a manual retry.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BootStoreError, PipelineError, Result};
use crate::process::{CancelToken, ToolCommand};

/// The boot loader's record of the default entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootEntry {
    pub index: Option<u32>,
    pub kernel: PathBuf,
    pub initrd: PathBuf,
}

/// Read/write access to the boot loader configuration.
pub trait BootConfigStore {
    fn default_entry(&self, cancel: &CancelToken) -> std::result::Result<BootEntry, BootStoreError>;

    /// Persist `initrd` for `entry`, effective on next boot.
    fn set_initrd(
        &self,
        entry: &BootEntry,
        initrd: &Path,
        cancel: &CancelToken,
    ) -> std::result::Result<(), BootStoreError>;
}

/// `grubby`-backed store (Fedora/RHEL BLS and legacy GRUB configs).
#[derive(Debug, Clone)]
pub struct Grubby {
    program: PathBuf,
    timeout: Duration,
}

impl Grubby {
    pub fn new(program: &Path, timeout: Duration) -> Self {
        Self {
            program: program.to_path_buf(),
            timeout,
        }
    }
}

impl BootConfigStore for Grubby {
    fn default_entry(&self, cancel: &CancelToken) -> std::result::Result<BootEntry, BootStoreError> {
        let output = ToolCommand::new(&self.program)
            .arg("--info=DEFAULT")
            .timeout(self.timeout)
            .run(cancel)?;
        parse_grubby_info(&output.stdout_lossy())
    }

    fn set_initrd(
        &self,
        entry: &BootEntry,
        initrd: &Path,
        cancel: &CancelToken,
    ) -> std::result::Result<(), BootStoreError> {
        let mut update_kernel = std::ffi::OsString::from("--update-kernel=");
        update_kernel.push(&entry.kernel);
        let mut new_initrd = std::ffi::OsString::from("--initrd=");
        new_initrd.push(initrd);
        ToolCommand::new(&self.program)
            .arg(update_kernel)
            .arg(new_initrd)
            .timeout(self.timeout)
            .run(cancel)?;
        Ok(())
    }
}

/// Parse the first entry of `grubby --info` output.
pub fn parse_grubby_info(text: &str) -> std::result::Result<BootEntry, BootStoreError> {
    let mut index = None;
    let mut kernel = None;
    let mut initrd = None;

    for line in text.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');
        match key {
            "index" => {
                if index.is_some() {
                    break;
                }
                index = value.parse::<u32>().ok();
            }
            "kernel" if kernel.is_none() => kernel = Some(PathBuf::from(value)),
            "initrd" if initrd.is_none() => {
                // BLS entries may append grub variables such as `$tuned_initrd`.
                let mut images = value.split_whitespace().filter(|part| !part.starts_with('$'));
                if let Some(first) = images.next() {
                    initrd = Some(PathBuf::from(first));
                }
                let extra: Vec<_> = images.collect();
                if !extra.is_empty() {
                    log::warn!("default entry lists extra initrds {extra:?}; only the first is replaced");
                }
            }
            _ => {}
        }
    }

    let kernel = kernel.ok_or_else(|| BootStoreError::Parse("no kernel= line".into()))?;
    let initrd = initrd.ok_or_else(|| {
        BootStoreError::Parse(format!(
            "default entry for '{}' has no initrd",
            kernel.display()
        ))
    })?;
    Ok(BootEntry {
        index,
        kernel,
        initrd,
    })
}

/// Repoints the default boot entry at a composed override image.
pub struct BootEntryUpdater<'a> {
    store: &'a dyn BootConfigStore,
    cancel: &'a CancelToken,
}

impl<'a> BootEntryUpdater<'a> {
    pub fn new(store: &'a dyn BootConfigStore, cancel: &'a CancelToken) -> Self {
        Self { store, cancel }
    }

    pub fn current_entry(&self) -> std::result::Result<BootEntry, BootStoreError> {
        self.store.default_entry(self.cancel)
    }

    /// Initrd the default entry boots today.
    pub fn current_initrd(&self) -> std::result::Result<PathBuf, BootStoreError> {
        self.current_entry().map(|entry| entry.initrd)
    }

    /// Point the default entry's initrd at `image` and confirm the store recorded it.
    pub fn apply(&self, image: &Path) -> Result<BootEntry> {
        if !image.is_file() {
            return Err(PipelineError::BootUpdate(format!(
                "override image '{}' does not exist",
                image.display()
            )));
        }
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let entry = self.current_entry().map_err(boot_update_error)?;
        log::info!(
            "repointing '{}' initrd: {} -> {}",
            entry.kernel.display(),
            entry.initrd.display(),
            image.display()
        );
        self.store
            .set_initrd(&entry, image, self.cancel)
            .map_err(boot_update_error)?;

        let updated = self.current_entry().map_err(boot_update_error)?;
        if updated.initrd != image {
            return Err(PipelineError::BootUpdate(format!(
                "boot loader did not record the new initrd (default entry still uses '{}')",
                updated.initrd.display()
            )));
        }
        Ok(updated)
    }
}

fn boot_update_error(err: BootStoreError) -> PipelineError {
    match err {
        BootStoreError::Tool(tool) if tool.is_cancelled() => PipelineError::Cancelled,
        other => PipelineError::BootUpdate(other.to_string()),
    }
}
