//! In-process stand-ins for the host tools, used by the unit tests.
//!
//! The fake firmware emits a line-oriented blob (`SIG:hex`), the fake splitter
//! turns each line into `<sig>.dat`, and the hex "disassembler" renders a table
//! as a commented hex listing that it can compile back byte-for-byte.

use std::cell::RefCell;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::rc::Rc;

use crate::boot::{BootConfigStore, BootEntry};
use crate::error::{BootStoreError, ToolError};
use crate::process::CancelToken;
use crate::table::TableId;
use crate::tools::cpio::NewcArchiver;
use crate::tools::{Disassembler, FirmwareDump, TableSplitter, Toolset};

fn failed(program: &str, diagnostic: impl Into<String>) -> ToolError {
    ToolError::Failed {
        program: program.to_string(),
        status: ExitStatus::from_raw(1 << 8),
        diagnostic: diagnostic.into(),
    }
}

fn io(program: &str, source: std::io::Error) -> ToolError {
    ToolError::Io {
        program: program.to_string(),
        source,
    }
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub(crate) fn unhex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(text.get(i..i + 2)?, 16).ok())
        .collect()
}

/// Firmware with a fixed table set.
pub(crate) struct FakeFirmware {
    pub tables: Vec<(String, Vec<u8>)>,
}

impl FakeFirmware {
    pub fn with_tables(tables: &[(&str, &[u8])]) -> Self {
        Self {
            tables: tables
                .iter()
                .map(|(sig, bytes)| (sig.to_string(), bytes.to_vec()))
                .collect(),
        }
    }
}

impl FirmwareDump for FakeFirmware {
    fn dump(&self, blob: &Path, cancel: &CancelToken) -> Result<(), ToolError> {
        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled {
                program: "fake-acpidump".into(),
            });
        }
        let text: String = self
            .tables
            .iter()
            .map(|(sig, bytes)| format!("{sig}:{}\n", hex(bytes)))
            .collect();
        fs::write(blob, text).map_err(|e| io("fake-acpidump", e))
    }
}

pub(crate) struct FakeSplitter;

impl TableSplitter for FakeSplitter {
    fn split(&self, blob: &Path, dest_dir: &Path, _cancel: &CancelToken) -> Result<(), ToolError> {
        let text = fs::read_to_string(blob).map_err(|e| io("fake-acpixtract", e))?;
        for line in text.lines() {
            let (sig, body) = line
                .split_once(':')
                .ok_or_else(|| failed("fake-acpixtract", format!("bad line '{line}'")))?;
            let bytes = unhex(body)
                .ok_or_else(|| failed("fake-acpixtract", format!("bad hex for {sig}")))?;
            fs::write(dest_dir.join(format!("{}.dat", sig.to_lowercase())), bytes)
                .map_err(|e| io("fake-acpixtract", e))?;
        }
        Ok(())
    }
}

/// Renders tables as hex listings; compiling rejects any non-hex body text.
#[derive(Default)]
pub(crate) struct HexDisassembler {
    pub fail_disassembly_of: Vec<String>,
}

impl Disassembler for HexDisassembler {
    fn disassemble(
        &self,
        table: &Path,
        id: &TableId,
        out_dir: &Path,
        _cancel: &CancelToken,
    ) -> Result<PathBuf, ToolError> {
        if self.fail_disassembly_of.iter().any(|s| s == id.as_str()) {
            return Err(failed("fake-iasl", format!("{}: unsupported table", id)));
        }
        let bytes = fs::read(table).map_err(|e| io("fake-iasl", e))?;
        let mut text = format!("/* {} disassembly */\n", id.as_str().to_uppercase());
        for chunk in bytes.chunks(16) {
            text.push_str(&hex(chunk));
            text.push('\n');
        }
        let out = out_dir.join(id.source_file_name());
        fs::write(&out, text).map_err(|e| io("fake-iasl", e))?;
        Ok(out)
    }

    fn assemble(
        &self,
        source: &Path,
        id: &TableId,
        out_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<PathBuf, ToolError> {
        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled {
                program: "fake-iasl".into(),
            });
        }
        let text = fs::read_to_string(source).map_err(|e| io("fake-iasl", e))?;
        let mut bytes = Vec::new();
        for (n, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with("/*") {
                continue;
            }
            let chunk = unhex(line).ok_or_else(|| {
                failed(
                    "fake-iasl",
                    format!("{}.dsl {}: syntax error, unexpected '{line}'", id, n + 1),
                )
            })?;
            bytes.extend(chunk);
        }
        let out = out_dir.join(id.compiled_file_name());
        fs::write(&out, bytes).map_err(|e| io("fake-iasl", e))?;
        Ok(out)
    }
}

#[derive(Debug)]
struct BootState {
    entry: BootEntry,
    fail_updates: bool,
    ignore_updates: bool,
    fail_reads: bool,
    update_calls: usize,
}

/// Boot configuration held in memory; clones share state.
#[derive(Debug, Clone)]
pub(crate) struct MemoryBootStore {
    state: Rc<RefCell<BootState>>,
}

impl MemoryBootStore {
    pub fn new(kernel: &str, initrd: impl Into<PathBuf>) -> Self {
        Self {
            state: Rc::new(RefCell::new(BootState {
                entry: BootEntry {
                    index: Some(0),
                    kernel: kernel.into(),
                    initrd: initrd.into(),
                },
                fail_updates: false,
                ignore_updates: false,
                fail_reads: false,
                update_calls: 0,
            })),
        }
    }

    pub fn initrd(&self) -> PathBuf {
        self.state.borrow().entry.initrd.clone()
    }

    pub fn fail_updates(&self, fail: bool) {
        self.state.borrow_mut().fail_updates = fail;
    }

    pub fn ignore_updates(&self, ignore: bool) {
        self.state.borrow_mut().ignore_updates = ignore;
    }

    pub fn fail_reads(&self, fail: bool) {
        self.state.borrow_mut().fail_reads = fail;
    }

    pub fn update_calls(&self) -> usize {
        self.state.borrow().update_calls
    }
}

impl BootConfigStore for MemoryBootStore {
    fn default_entry(&self, _cancel: &CancelToken) -> Result<BootEntry, BootStoreError> {
        let state = self.state.borrow();
        if state.fail_reads {
            return Err(failed("fake-grubby", "cannot read boot configuration").into());
        }
        Ok(state.entry.clone())
    }

    fn set_initrd(
        &self,
        _entry: &BootEntry,
        initrd: &Path,
        _cancel: &CancelToken,
    ) -> Result<(), BootStoreError> {
        let mut state = self.state.borrow_mut();
        state.update_calls += 1;
        if state.fail_updates {
            return Err(failed("fake-grubby", "grubby: error updating entry").into());
        }
        if !state.ignore_updates {
            state.entry.initrd = initrd.to_path_buf();
        }
        Ok(())
    }
}

/// Shell stand-in for a host tool: records its argv one per line and prints
/// a canned stdout.
pub(crate) struct RecordingTool {
    pub program: PathBuf,
    argv_file: PathBuf,
}

impl RecordingTool {
    pub fn new(dir: &Path, name: &str, stdout: &str) -> Self {
        let program = dir.join(name);
        let argv_file = dir.join(format!("{name}.argv"));
        let stdout_file = dir.join(format!("{name}.stdout"));
        fs::write(&stdout_file, stdout).unwrap();
        let script = format!(
            "#!/bin/sh\nprintf '%s\\n' \"$@\" > '{}'\ncat '{}'\n",
            argv_file.display(),
            stdout_file.display()
        );
        fs::write(&program, script).unwrap();
        fs::set_permissions(&program, fs::Permissions::from_mode(0o755)).unwrap();
        Self { program, argv_file }
    }

    /// Arguments of the last invocation.
    pub fn argv(&self) -> Vec<String> {
        fs::read_to_string(&self.argv_file)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

/// Firmware with `DSDT` and `SSDT1`.
pub(crate) fn scenario_firmware() -> FakeFirmware {
    FakeFirmware::with_tables(&[
        ("DSDT", b"DSDT\x00\x01\x02\x03dsdt-body"),
        ("SSDT1", b"SSDT\x10\x11ssdt-body"),
    ])
}

pub(crate) fn fake_toolset(firmware: FakeFirmware, boot: &MemoryBootStore) -> Toolset {
    Toolset {
        dump: Box::new(firmware),
        splitter: Box::new(FakeSplitter),
        disassembler: Box::new(HexDisassembler::default()),
        archiver: Box::new(NewcArchiver),
        boot_store: Box::new(boot.clone()),
    }
}
