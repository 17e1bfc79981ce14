//! Initrd Composer: compiled tables -> override image.
//!
//! The image is an uncompressed newc fragment holding
//! `kernel/firmware/acpi/<id>.aml`, followed byte-for-byte by the base initrd.
//! The kernel scans only that leading fragment for replacement tables and then
//! unpacks the rest of the file as the normal initramfs, so the order is
//! load-bearing.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::boot::BootEntry;
use crate::error::{IoContext, PipelineError, Result};
use crate::process::CancelToken;
use crate::table::{CompiledTable, TableId};
use crate::tools::cpio::read_newc;
use crate::tools::Archiver;
use crate::workspace::write_atomic;

/// Path prefix the kernel scans for override tables.
pub const ACPI_OVERRIDE_PREFIX: &str = "kernel/firmware/acpi";
pub const IMAGE_PREFIX: &str = "initrd-acpi-override-";
pub const IMAGE_EXT: &str = "img";

const MAX_NAME_ATTEMPTS: usize = 32;

/// One table recorded in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestTable {
    pub id: String,
    pub size_bytes: u64,
    pub sha256: String,
}

/// JSON sidecar describing an override image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideManifest {
    pub image: PathBuf,
    /// The untouched initrd the fragment was layered onto.
    pub base_initrd: PathBuf,
    #[serde(default)]
    pub kernel: Option<PathBuf>,
    pub created_at_utc: String,
    pub fragment_len: u64,
    pub tables: Vec<ManifestTable>,
}

/// A composed image on disk.
#[derive(Debug, Clone)]
pub struct OverrideImage {
    pub path: PathBuf,
    pub manifest: OverrideManifest,
}

pub fn manifest_path(image: &Path) -> PathBuf {
    let mut name = image.as_os_str().to_owned();
    name.push(".json");
    PathBuf::from(name)
}

pub fn read_manifest(image: &Path) -> Result<OverrideManifest> {
    let path = manifest_path(image);
    let bytes = fs::read(&path).io_context(&path, || format!("reading manifest '{}'", path.display()))?;
    serde_json::from_slice(&bytes).map_err(|err| {
        PipelineError::Validation(format!("parsing manifest '{}': {err}", path.display()))
    })
}

/// The initrd an override should be layered on for `entry`.
///
/// When the entry already boots an earlier override image, its recorded base
/// is used instead so fragments never stack.
pub fn resolve_base_initrd(entry: &BootEntry) -> Result<PathBuf> {
    let current = &entry.initrd;
    let base = if manifest_path(current).is_file() {
        let manifest = read_manifest(current)
            .map_err(|err| PipelineError::Compose(format!("active override image: {err}")))?;
        log::info!(
            "default entry boots override '{}'; layering onto its base '{}'",
            current.display(),
            manifest.base_initrd.display()
        );
        manifest.base_initrd
    } else {
        current.clone()
    };

    if !base.is_file() {
        return Err(PipelineError::Compose(format!(
            "active initrd '{}' is missing or not a regular file",
            base.display()
        )));
    }
    Ok(base)
}

/// Override images in `dir`, oldest first, with their manifests when readable.
pub fn list_images(dir: &Path) -> Result<Vec<(PathBuf, Option<OverrideManifest>)>> {
    let entries = fs::read_dir(dir).io_context(dir, || format!("reading '{}'", dir.display()))?;
    let mut images = Vec::new();
    for entry in entries {
        let entry = entry.io_context(dir, || format!("iterating '{}'", dir.display()))?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with(IMAGE_PREFIX) && name.ends_with(&format!(".{IMAGE_EXT}")) {
            images.push(path);
        }
    }
    images.sort();
    Ok(images
        .into_iter()
        .map(|path| {
            let manifest = read_manifest(&path).ok();
            (path, manifest)
        })
        .collect())
}

pub struct InitrdComposer<'a> {
    archiver: &'a dyn Archiver,
    out_dir: &'a Path,
    cancel: &'a CancelToken,
}

impl<'a> InitrdComposer<'a> {
    pub fn new(archiver: &'a dyn Archiver, out_dir: &'a Path, cancel: &'a CancelToken) -> Self {
        Self {
            archiver,
            out_dir,
            cancel,
        }
    }

    /// Build the fragment for `artifacts` and prepend it to `base_initrd`.
    pub fn compose(
        &self,
        artifacts: &BTreeMap<TableId, CompiledTable>,
        base_initrd: &Path,
        kernel: Option<&Path>,
    ) -> Result<OverrideImage> {
        if artifacts.is_empty() {
            return Err(PipelineError::Compose("no tables to compose".into()));
        }
        let mut base = File::open(base_initrd).map_err(|err| {
            PipelineError::Compose(format!(
                "cannot read active initrd '{}': {err}",
                base_initrd.display()
            ))
        })?;
        if !base
            .metadata()
            .map(|md| md.is_file())
            .unwrap_or(false)
        {
            return Err(PipelineError::Compose(format!(
                "active initrd '{}' is not a regular file",
                base_initrd.display()
            )));
        }

        fs::create_dir_all(self.out_dir)
            .io_context(self.out_dir, || format!("creating '{}'", self.out_dir.display()))?;
        let fragment = self.build_fragment(artifacts)?;

        let (path, partial) = allocate_image_name(self.out_dir)?;
        let manifest = OverrideManifest {
            image: path.clone(),
            base_initrd: base_initrd.to_path_buf(),
            kernel: kernel.map(Path::to_path_buf),
            created_at_utc: now_utc_readable(),
            fragment_len: fragment.len() as u64,
            tables: artifacts
                .values()
                .map(|table| ManifestTable {
                    id: table.id.to_string(),
                    size_bytes: table.bytes.len() as u64,
                    sha256: format!("{:x}", Sha256::digest(&table.bytes)),
                })
                .collect(),
        };
        let json = serde_json::to_vec_pretty(&manifest).map_err(|err| {
            PipelineError::Compose(format!("serializing manifest: {err}"))
        })?;

        let written = write_image(&partial, &fragment, &mut base, self.cancel)
            .and_then(|()| publish(&partial, &path, &json));
        if let Err(err) = written {
            let _ = fs::remove_file(&partial);
            return Err(err);
        }

        log::info!(
            "composed '{}' ({} table(s), {} byte fragment)",
            path.display(),
            manifest.tables.len(),
            fragment.len()
        );
        Ok(OverrideImage { path, manifest })
    }

    fn build_fragment(&self, artifacts: &BTreeMap<TableId, CompiledTable>) -> Result<Vec<u8>> {
        let staging = tempfile::Builder::new()
            .prefix(".acpied-stage-")
            .tempdir_in(self.out_dir)
            .io_context(self.out_dir, || {
                format!("creating staging directory in '{}'", self.out_dir.display())
            })?;
        let acpi_dir = staging.path().join(ACPI_OVERRIDE_PREFIX);
        fs::create_dir_all(&acpi_dir)
            .io_context(&acpi_dir, || format!("creating '{}'", acpi_dir.display()))?;
        for table in artifacts.values() {
            let dest = acpi_dir.join(table.id.compiled_file_name());
            fs::write(&dest, &table.bytes)
                .io_context(&dest, || format!("staging '{}'", dest.display()))?;
        }

        let fragment = self
            .archiver
            .archive(staging.path(), self.cancel)
            .map_err(|err| match err {
                err if err.is_cancelled() => PipelineError::Cancelled,
                err => PipelineError::Compose(format!("archiving override tables: {err}")),
            })?;

        let archive = read_newc(&fragment).map_err(|err| {
            PipelineError::Compose(format!("archiver output is not a newc archive: {err}"))
        })?;
        // GNU cpio pads to its 512-byte block size; the kernel skips zero padding.
        if fragment[archive.len..].iter().any(|&b| b != 0) {
            return Err(PipelineError::Compose(format!(
                "archiver output has {} non-padding bytes after the archive",
                fragment.len() - archive.len
            )));
        }
        for id in artifacts.keys() {
            let member = format!("{ACPI_OVERRIDE_PREFIX}/{}", id.compiled_file_name());
            if !archive.entries.iter().any(|entry| entry.name == member) {
                return Err(PipelineError::Compose(format!(
                    "archiver output lacks '{member}'"
                )));
            }
        }
        Ok(fragment)
    }
}

fn write_image(
    partial: &Path,
    fragment: &[u8],
    base: &mut File,
    cancel: &CancelToken,
) -> Result<()> {
    let mut out = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(partial)
        .io_context(partial, || format!("creating '{}'", partial.display()))?;
    out.write_all(fragment)
        .io_context(partial, || format!("writing fragment to '{}'", partial.display()))?;
    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }
    io::copy(base, &mut out)
        .io_context(partial, || format!("appending base initrd to '{}'", partial.display()))?;
    out.sync_all()
        .io_context(partial, || format!("syncing '{}'", partial.display()))?;
    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }
    Ok(())
}

/// Write the manifest, then move the finished image to its final name.
///
/// An image never appears under its final name without a manifest.
fn publish(partial: &Path, path: &Path, manifest_json: &[u8]) -> Result<()> {
    let manifest = manifest_path(path);
    write_atomic(&manifest, manifest_json)?;
    let renamed = fs::rename(partial, path).io_context(path, || {
        format!("renaming '{}' -> '{}'", partial.display(), path.display())
    });
    if renamed.is_err() {
        let _ = fs::remove_file(&manifest);
    }
    renamed
}

/// Timestamped image path plus the dot-prefixed scratch name it is written under.
fn allocate_image_name(dir: &Path) -> Result<(PathBuf, PathBuf)> {
    for _ in 0..MAX_NAME_ATTEMPTS {
        let name = format!("{IMAGE_PREFIX}{}.{IMAGE_EXT}", now_utc_sortable());
        let path = dir.join(&name);
        let partial = dir.join(format!(".{name}.partial"));
        if path.exists() || partial.exists() {
            continue;
        }
        return Ok((path, partial));
    }
    Err(PipelineError::Compose(format!(
        "failed allocating a unique override image name under '{}'",
        dir.display()
    )))
}

fn now_utc_sortable() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}.{:09}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second(),
        now.nanosecond()
    )
}

fn now_utc_readable() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ToolError;
    use crate::tools::cpio::NewcArchiver;
    use tempfile::TempDir;

    fn tables(specs: &[(&str, &[u8])]) -> BTreeMap<TableId, CompiledTable> {
        specs
            .iter()
            .map(|(name, bytes)| {
                let id = TableId::new(name).unwrap();
                let table = CompiledTable {
                    id: id.clone(),
                    bytes: bytes.to_vec(),
                    path: PathBuf::from(format!("/unused/{name}.aml")),
                };
                (id, table)
            })
            .collect()
    }

    fn base_initrd(temp: &TempDir) -> PathBuf {
        let path = temp.path().join("initramfs-6.5.6.img");
        let bytes: Vec<u8> = (0..70_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn fragment_precedes_original_initrd() {
        let temp = TempDir::new().unwrap();
        let base = base_initrd(&temp);
        let out_dir = temp.path().join("boot");
        let cancel = CancelToken::new();

        let image = InitrdComposer::new(&NewcArchiver, &out_dir, &cancel)
            .compose(
                &tables(&[("dsdt", b"DSDT-new"), ("ssdt1", b"SSDT-1")]),
                &base,
                Some(Path::new("/boot/vmlinuz")),
            )
            .unwrap();

        let bytes = fs::read(&image.path).unwrap();
        let archive = read_newc(&bytes).unwrap();
        assert_eq!(archive.len as u64, image.manifest.fragment_len);
        assert_eq!(&bytes[archive.len..], fs::read(&base).unwrap().as_slice());

        let names: Vec<_> = archive
            .entries
            .iter()
            .filter(|e| e.name.ends_with(".aml"))
            .map(|e| e.name.as_str())
            .collect();
        assert_eq!(
            names,
            [
                "kernel/firmware/acpi/dsdt.aml",
                "kernel/firmware/acpi/ssdt1.aml"
            ]
        );
    }

    /// Newc output followed by a fixed tail, like GNU cpio's block padding.
    struct TailedArchiver {
        block: usize,
        fill: u8,
    }

    impl Archiver for TailedArchiver {
        fn archive(&self, root: &Path, cancel: &CancelToken) -> std::result::Result<Vec<u8>, ToolError> {
            let mut bytes = NewcArchiver.archive(root, cancel)?;
            // always at least one tail byte, ending on a block boundary
            let padded = (bytes.len() / self.block + 1) * self.block;
            bytes.resize(padded, self.fill);
            Ok(bytes)
        }
    }

    #[test]
    fn block_padded_fragment_is_accepted() {
        let temp = TempDir::new().unwrap();
        let base = base_initrd(&temp);
        let out_dir = temp.path().join("boot");
        let cancel = CancelToken::new();
        let archiver = TailedArchiver { block: 512, fill: 0 };

        let image = InitrdComposer::new(&archiver, &out_dir, &cancel)
            .compose(&tables(&[("dsdt", b"DSDT-new")]), &base, None)
            .unwrap();

        let bytes = fs::read(&image.path).unwrap();
        let fragment_len = image.manifest.fragment_len as usize;
        assert_eq!(fragment_len % 512, 0);
        let archive = read_newc(&bytes).unwrap();
        assert!(bytes[archive.len..fragment_len].iter().all(|&b| b == 0));
        assert_eq!(&bytes[fragment_len..], fs::read(&base).unwrap().as_slice());
    }

    #[test]
    fn non_zero_tail_after_trailer_is_rejected() {
        let temp = TempDir::new().unwrap();
        let base = base_initrd(&temp);
        let out_dir = temp.path().join("boot");
        let cancel = CancelToken::new();
        let archiver = TailedArchiver { block: 512, fill: 0x5a };

        let err = InitrdComposer::new(&archiver, &out_dir, &cancel)
            .compose(&tables(&[("dsdt", b"DSDT-new")]), &base, None)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Compose(_)), "{err}");
        assert!(list_images(&out_dir).unwrap().is_empty());
    }

    #[test]
    fn failed_manifest_write_keeps_final_name_free() {
        let temp = TempDir::new().unwrap();
        let partial = temp.path().join(".initrd-acpi-override-x.img.partial");
        let path = temp.path().join("initrd-acpi-override-x.img");
        fs::write(&partial, b"image").unwrap();
        // a directory where the manifest should go makes the write fail
        fs::create_dir(manifest_path(&path)).unwrap();

        assert!(publish(&partial, &path, b"{}").is_err());
        assert!(!path.exists());
        assert!(list_images(temp.path()).unwrap().is_empty());
    }

    #[test]
    fn published_image_has_manifest() {
        let temp = TempDir::new().unwrap();
        let partial = temp.path().join(".initrd-acpi-override-x.img.partial");
        let path = temp.path().join("initrd-acpi-override-x.img");
        fs::write(&partial, b"image").unwrap();

        publish(&partial, &path, b"{}").unwrap();
        assert!(!partial.exists());
        assert_eq!(fs::read(&path).unwrap(), b"image");
        assert_eq!(fs::read(manifest_path(&path)).unwrap(), b"{}");
    }

    #[test]
    fn image_is_named_and_described() {
        let temp = TempDir::new().unwrap();
        let base = base_initrd(&temp);
        let out_dir = temp.path().join("boot");
        let cancel = CancelToken::new();

        let image = InitrdComposer::new(&NewcArchiver, &out_dir, &cancel)
            .compose(&tables(&[("dsdt", b"DSDT-new")]), &base, None)
            .unwrap();

        let name = image.path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with(IMAGE_PREFIX) && name.ends_with(".img"), "{name}");
        let manifest = read_manifest(&image.path).unwrap();
        assert_eq!(manifest, image.manifest);
        assert_eq!(manifest.base_initrd, base);
        assert_eq!(manifest.tables[0].id, "dsdt");
        assert_eq!(manifest.tables[0].size_bytes, 8);
        assert_eq!(manifest.tables[0].sha256.len(), 64);

        // no scratch files are left behind
        let leftovers: Vec<_> = fs::read_dir(&out_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with('.'))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[test]
    fn repeated_composes_never_collide() {
        let temp = TempDir::new().unwrap();
        let base = base_initrd(&temp);
        let out_dir = temp.path().join("boot");
        let cancel = CancelToken::new();
        let composer = InitrdComposer::new(&NewcArchiver, &out_dir, &cancel);
        let artifacts = tables(&[("dsdt", b"DSDT-new")]);

        let mut paths: Vec<_> = (0..5)
            .map(|_| composer.compose(&artifacts, &base, None).unwrap().path)
            .collect();
        let listed: Vec<_> = list_images(&out_dir)
            .unwrap()
            .into_iter()
            .map(|(p, m)| {
                assert!(m.is_some());
                p
            })
            .collect();
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), 5);
        assert_eq!(listed, paths);
    }

    #[test]
    fn missing_base_initrd_fails_loudly() {
        let temp = TempDir::new().unwrap();
        let out_dir = temp.path().join("boot");
        let cancel = CancelToken::new();
        let err = InitrdComposer::new(&NewcArchiver, &out_dir, &cancel)
            .compose(
                &tables(&[("dsdt", b"DSDT-new")]),
                &temp.path().join("missing.img"),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::Compose(_)), "{err}");
        assert!(!out_dir.exists() || fs::read_dir(&out_dir).unwrap().next().is_none());
    }

    #[test]
    fn empty_artifacts_are_rejected() {
        let temp = TempDir::new().unwrap();
        let base = base_initrd(&temp);
        let cancel = CancelToken::new();
        let err = InitrdComposer::new(&NewcArchiver, temp.path(), &cancel)
            .compose(&BTreeMap::new(), &base, None)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Compose(_)));
    }

    #[test]
    fn cancelled_compose_leaves_no_image() {
        let temp = TempDir::new().unwrap();
        let base = base_initrd(&temp);
        let out_dir = temp.path().join("boot");
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = InitrdComposer::new(&NewcArchiver, &out_dir, &cancel)
            .compose(&tables(&[("dsdt", b"DSDT-new")]), &base, None)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert!(list_images(&out_dir).unwrap().is_empty());
    }

    #[test]
    fn base_resolution_follows_manifest() {
        let temp = TempDir::new().unwrap();
        let base = base_initrd(&temp);
        let out_dir = temp.path().join("boot");
        let cancel = CancelToken::new();
        let image = InitrdComposer::new(&NewcArchiver, &out_dir, &cancel)
            .compose(&tables(&[("dsdt", b"DSDT-new")]), &base, None)
            .unwrap();

        let entry = |initrd: &Path| BootEntry {
            index: Some(0),
            kernel: "/boot/vmlinuz".into(),
            initrd: initrd.to_path_buf(),
        };
        assert_eq!(resolve_base_initrd(&entry(&base)).unwrap(), base);
        assert_eq!(resolve_base_initrd(&entry(&image.path)).unwrap(), base);
        assert!(matches!(
            resolve_base_initrd(&entry(&temp.path().join("gone.img"))),
            Err(PipelineError::Compose(_))
        ));
    }
}
