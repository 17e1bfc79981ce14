//! Runtime configuration (`/etc/acpied.toml`).
//!
//! Every key is optional; anything left out falls back to the defaults that
//! match a stock Fedora/RHEL host with acpica-tools and grubby installed.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{PipelineError, Result};
use crate::process::DEFAULT_TOOL_TIMEOUT;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/acpied.toml";
pub const CONFIG_ENV: &str = "ACPIED_CONFIG";
pub const DEFAULT_WORKSPACE_ROOT: &str = "/tmp/acpidump";
pub const DEFAULT_ARTIFACTS_DIR: &str = "/boot";
pub const DEFAULT_JOURNAL_PATH: &str = "/var/log/acpied.log";

/// How the table fragment is archived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// External `cpio -H newc`.
    Cpio,
    /// Built-in newc writer.
    Native,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub acpidump: PathBuf,
    pub acpixtract: PathBuf,
    pub iasl: PathBuf,
    pub cpio: PathBuf,
    pub grubby: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            acpidump: "acpidump".into(),
            acpixtract: "acpixtract".into(),
            iasl: "iasl".into(),
            cpio: "cpio".into(),
            grubby: "grubby".into(),
        }
    }
}

/// Resolved settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub workspace_root: PathBuf,
    /// Where override images and their manifests are written.
    pub artifacts_dir: PathBuf,
    pub tools: ToolPaths,
    pub tool_timeout: Duration,
    pub archive_format: ArchiveFormat,
    /// `None` disables the journal.
    pub journal_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workspace_root: DEFAULT_WORKSPACE_ROOT.into(),
            artifacts_dir: DEFAULT_ARTIFACTS_DIR.into(),
            tools: ToolPaths::default(),
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            archive_format: ArchiveFormat::Cpio,
            journal_path: Some(DEFAULT_JOURNAL_PATH.into()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsToml {
    workspace: Option<WorkspaceToml>,
    boot: Option<BootToml>,
    tools: Option<ToolsToml>,
    archive: Option<ArchiveToml>,
    journal: Option<JournalToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WorkspaceToml {
    root: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BootToml {
    artifacts_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ToolsToml {
    acpidump: Option<PathBuf>,
    acpixtract: Option<PathBuf>,
    iasl: Option<PathBuf>,
    cpio: Option<PathBuf>,
    grubby: Option<PathBuf>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ArchiveToml {
    format: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct JournalToml {
    path: Option<String>,
}

impl Settings {
    /// Load from `$ACPIED_CONFIG`, else `/etc/acpied.toml` if present, else defaults.
    pub fn discover() -> Result<Self> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Self::load(Path::new(&path));
        }
        let default_path = Path::new(DEFAULT_CONFIG_PATH);
        if default_path.is_file() {
            return Self::load(default_path);
        }
        Ok(Self::default())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|source| PipelineError::Io {
            context: format!("reading config '{}'", path.display()),
            source,
        })?;
        Self::parse(&text)
            .map_err(|err| PipelineError::Config(format!("'{}': {err}", path.display())))
    }

    pub fn parse(text: &str) -> std::result::Result<Self, String> {
        let parsed: SettingsToml = toml::from_str(text).map_err(|e| e.to_string())?;
        let mut settings = Settings::default();

        if let Some(root) = parsed.workspace.and_then(|w| w.root) {
            settings.workspace_root = require_absolute(root, "workspace.root")?;
        }
        if let Some(dir) = parsed.boot.and_then(|b| b.artifacts_dir) {
            settings.artifacts_dir = require_absolute(dir, "boot.artifacts_dir")?;
        }
        if let Some(tools) = parsed.tools {
            let paths = &mut settings.tools;
            for (slot, value) in [
                (&mut paths.acpidump, tools.acpidump),
                (&mut paths.acpixtract, tools.acpixtract),
                (&mut paths.iasl, tools.iasl),
                (&mut paths.cpio, tools.cpio),
                (&mut paths.grubby, tools.grubby),
            ] {
                if let Some(value) = value {
                    *slot = value;
                }
            }
            if let Some(secs) = tools.timeout_secs {
                if secs == 0 {
                    return Err("tools.timeout_secs must be greater than zero".into());
                }
                settings.tool_timeout = Duration::from_secs(secs);
            }
        }
        if let Some(format) = parsed.archive.and_then(|a| a.format) {
            settings.archive_format = match format.trim().to_ascii_lowercase().as_str() {
                "cpio" => ArchiveFormat::Cpio,
                "native" => ArchiveFormat::Native,
                other => {
                    return Err(format!(
                        "unsupported archive.format '{other}' (expected 'cpio' or 'native')"
                    ))
                }
            };
        }
        if let Some(path) = parsed.journal.and_then(|j| j.path) {
            settings.journal_path = match path.trim() {
                "" => None,
                p => Some(require_absolute(PathBuf::from(p), "journal.path")?),
            };
        }

        Ok(settings)
    }
}

fn require_absolute(path: PathBuf, field: &str) -> std::result::Result<PathBuf, String> {
    if path.is_absolute() {
        Ok(path)
    } else {
        Err(format!(
            "{field} must be an absolute path, got '{}'",
            path.display()
        ))
    }
}
