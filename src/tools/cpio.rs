//! CPIO (newc) archives for the table override fragment.
//!
//! The kernel only scans an *uncompressed* newc archive placed at the very
//! start of the initrd for `kernel/firmware/acpi/*.aml`, so no compression is
//! applied here.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use walkdir::WalkDir;

use crate::error::ToolError;
use crate::process::{CancelToken, ToolCommand};

use super::Archiver;

const NEWC_MAGIC: &[u8; 6] = b"070701";
const NEWC_HEADER_LEN: usize = 110;
const TRAILER: &str = "TRAILER!!!";

/// External `cpio -o -H newc`, fed a NUL-separated path list on stdin.
#[derive(Debug, Clone)]
pub struct CpioArchiver {
    program: PathBuf,
    timeout: Duration,
}

impl CpioArchiver {
    pub fn new(program: &Path, timeout: Duration) -> Self {
        Self {
            program: program.to_path_buf(),
            timeout,
        }
    }
}

impl Archiver for CpioArchiver {
    fn archive(&self, root: &Path, cancel: &CancelToken) -> Result<Vec<u8>, ToolError> {
        let program = self.program.display().to_string();
        let entries = sorted_entries(root).map_err(|source| ToolError::Io {
            program: program.clone(),
            source,
        })?;

        let mut list = Vec::new();
        for rel in &entries {
            list.extend_from_slice(rel.as_bytes());
            list.push(0);
        }

        // --null -o -H newc: NUL-separated names in, newc archive (required by Linux) out
        let output = ToolCommand::new(&self.program)
            .args(["--quiet", "--null", "-o", "-H", "newc", "-R", "0:0"])
            .current_dir(root)
            .stdin(list)
            .timeout(self.timeout)
            .run(cancel)?;
        Ok(output.stdout)
    }
}

/// Built-in newc writer; no external tool needed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NewcArchiver;

impl Archiver for NewcArchiver {
    fn archive(&self, root: &Path, cancel: &CancelToken) -> Result<Vec<u8>, ToolError> {
        let io_err = |source: std::io::Error| ToolError::Io {
            program: "newc".to_string(),
            source,
        };
        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled {
                program: "newc".to_string(),
            });
        }

        let mut out = Vec::new();
        let mut ino = 1u32;
        for rel in sorted_entries(root).map_err(io_err)? {
            let path = root.join(&rel);
            let md = fs::symlink_metadata(&path).map_err(io_err)?;
            if md.is_dir() {
                write_entry(&mut out, ino, &rel, 0o040755, 2, &[]);
            } else if md.is_file() {
                let data = fs::read(&path).map_err(io_err)?;
                write_entry(&mut out, ino, &rel, 0o100644, 1, &data);
            } else {
                continue;
            }
            ino += 1;
        }
        write_entry(&mut out, 0, TRAILER, 0, 1, &[]);
        Ok(out)
    }
}

/// Paths under `root`, relative and `/`-separated, in deterministic order.
fn sorted_entries(root: &Path) -> std::io::Result<Vec<String>> {
    let mut entries = Vec::new();
    for ent in WalkDir::new(root).min_depth(1).follow_links(false) {
        let ent = ent.map_err(std::io::Error::other)?;
        let rel = ent
            .path()
            .strip_prefix(root)
            .unwrap_or(ent.path())
            .to_string_lossy()
            .replace('\\', "/");
        entries.push(rel);
    }
    entries.sort();
    Ok(entries)
}

fn write_entry(out: &mut Vec<u8>, ino: u32, name: &str, mode: u32, nlink: u32, data: &[u8]) {
    let namesize = name.len() + 1;
    let fields = [
        ino,
        mode,
        0, // uid
        0, // gid
        nlink,
        0, // mtime
        data.len() as u32,
        0, // devmajor
        0, // devminor
        0, // rdevmajor
        0, // rdevminor
        namesize as u32,
        0, // check
    ];
    out.extend_from_slice(NEWC_MAGIC);
    for field in fields {
        out.extend_from_slice(format!("{field:08X}").as_bytes());
    }
    out.extend_from_slice(name.as_bytes());
    out.push(0);
    pad4(out);
    out.extend_from_slice(data);
    pad4(out);
}

fn pad4(out: &mut Vec<u8>) {
    while out.len() % 4 != 0 {
        out.push(0);
    }
}

/// One member of a newc archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewcEntry {
    pub name: String,
    pub mode: u32,
    pub data: Vec<u8>,
}

/// Parsed leading newc archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewcArchive {
    pub entries: Vec<NewcEntry>,
    /// Bytes consumed up to and including the trailer's padding.
    pub len: usize,
}

/// Parse the newc archive at the start of `bytes`, stopping at its trailer.
///
/// Anything after the trailer (the original initrd, in an override image)
/// is left alone.
pub fn read_newc(bytes: &[u8]) -> Result<NewcArchive, String> {
    let mut entries = Vec::new();
    let mut off = 0usize;
    loop {
        let header = bytes
            .get(off..off + NEWC_HEADER_LEN)
            .ok_or_else(|| format!("truncated newc header at offset {off}"))?;
        if &header[..6] != NEWC_MAGIC {
            return Err(format!("bad newc magic at offset {off}"));
        }
        let field = |idx: usize| -> Result<u32, String> {
            let start = 6 + idx * 8;
            let text = std::str::from_utf8(&header[start..start + 8])
                .map_err(|_| format!("non-ascii newc field at offset {off}"))?;
            u32::from_str_radix(text, 16)
                .map_err(|_| format!("invalid newc field '{text}' at offset {off}"))
        };
        let mode = field(1)?;
        let filesize = field(6)? as usize;
        let namesize = field(11)? as usize;

        let name_start = off + NEWC_HEADER_LEN;
        let name_bytes = bytes
            .get(name_start..name_start + namesize)
            .ok_or_else(|| format!("truncated newc name at offset {name_start}"))?;
        let name = String::from_utf8_lossy(name_bytes.strip_suffix(&[0]).unwrap_or(name_bytes))
            .into_owned();

        let data_start = align4(name_start + namesize);
        let data = bytes
            .get(data_start..data_start + filesize)
            .ok_or_else(|| format!("truncated newc data for '{name}'"))?;
        off = align4(data_start + filesize);

        if name == TRAILER {
            return Ok(NewcArchive { entries, len: off });
        }
        entries.push(NewcEntry {
            name,
            mode,
            data: data.to_vec(),
        });
    }
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::InitrdComposer;
    use crate::preflight::command_exists;
    use crate::table::{CompiledTable, TableId};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn override_tree(temp: &TempDir) -> PathBuf {
        let root = temp.path().join("root");
        let acpi = root.join("kernel/firmware/acpi");
        fs::create_dir_all(&acpi).unwrap();
        fs::write(acpi.join("dsdt.aml"), b"DSDT-bytes").unwrap();
        fs::write(acpi.join("ssdt1.aml"), b"SSDT").unwrap();
        root
    }

    #[test]
    fn native_archive_lists_override_tree() {
        let temp = TempDir::new().unwrap();
        let root = override_tree(&temp);

        let bytes = NewcArchiver.archive(&root, &CancelToken::new()).unwrap();
        assert_eq!(bytes.len() % 4, 0);

        let archive = read_newc(&bytes).unwrap();
        assert_eq!(archive.len, bytes.len());
        let names: Vec<_> = archive.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "kernel",
                "kernel/firmware",
                "kernel/firmware/acpi",
                "kernel/firmware/acpi/dsdt.aml",
                "kernel/firmware/acpi/ssdt1.aml",
            ]
        );
        assert_eq!(archive.entries[3].data, b"DSDT-bytes");
        assert_eq!(archive.entries[3].mode, 0o100644);
        assert_eq!(archive.entries[0].mode, 0o040755);
    }

    #[test]
    fn reader_stops_at_trailer() {
        let temp = TempDir::new().unwrap();
        let root = override_tree(&temp);
        let mut bytes = NewcArchiver.archive(&root, &CancelToken::new()).unwrap();
        let fragment_len = bytes.len();
        bytes.extend_from_slice(b"\x1f\x8b original initrd");

        let archive = read_newc(&bytes).unwrap();
        assert_eq!(archive.len, fragment_len);
    }

    #[test]
    fn reader_rejects_garbage() {
        assert!(read_newc(b"not an archive").is_err());
    }

    #[test]
    fn external_cpio_matches_layout() {
        if !command_exists("cpio") {
            return;
        }
        let temp = TempDir::new().unwrap();
        let root = override_tree(&temp);
        let archiver = CpioArchiver::new(Path::new("cpio"), Duration::from_secs(30));
        let bytes = archiver.archive(&root, &CancelToken::new()).unwrap();

        let archive = read_newc(&bytes).unwrap();
        let table = archive
            .entries
            .iter()
            .find(|e| e.name == "kernel/firmware/acpi/ssdt1.aml")
            .unwrap();
        assert_eq!(table.data, b"SSDT");
    }

    #[test]
    fn external_cpio_output_composes() {
        if !command_exists("cpio") {
            return;
        }
        let temp = TempDir::new().unwrap();
        let base = temp.path().join("initramfs.img");
        fs::write(&base, b"base initramfs").unwrap();
        let id = TableId::new("dsdt").unwrap();
        let artifacts = BTreeMap::from([(
            id.clone(),
            CompiledTable {
                id,
                bytes: b"DSDT-bytes".to_vec(),
                path: temp.path().join("dsdt.aml"),
            },
        )]);
        let archiver = CpioArchiver::new(Path::new("cpio"), Duration::from_secs(30));
        let cancel = CancelToken::new();
        let out_dir = temp.path().join("boot");

        let image = InitrdComposer::new(&archiver, &out_dir, &cancel)
            .compose(&artifacts, &base, None)
            .unwrap();

        let bytes = fs::read(&image.path).unwrap();
        let fragment_len = image.manifest.fragment_len as usize;
        let archive = read_newc(&bytes).unwrap();
        assert!(archive
            .entries
            .iter()
            .any(|e| e.name == "kernel/firmware/acpi/dsdt.aml" && e.data == b"DSDT-bytes"));
        assert_eq!(&bytes[fragment_len..], b"base initramfs");
    }
}
