//! The operations the presentation layer drives.
//!
//! ```text
//! Idle -> Extracting -> Editable -> Reassembling -> Composing -> Updating -> Applied
//!                           ^                                                   |
//!                           +------------------ Failed{stage} <-----------------+
//! ```
//!
//! Every mutating operation holds the workspace lock for its whole duration.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::boot::{BootEntry, BootEntryUpdater};
use crate::compose::{read_manifest, resolve_base_initrd, InitrdComposer};
use crate::config::Settings;
use crate::error::{
    ApplyFailure, ApplyStage, BootStoreError, IoContext, PipelineError, Result, TableFailure,
    TableFailureKind,
};
use crate::extract::TableExtractor;
use crate::journal::Journal;
use crate::process::CancelToken;
use crate::reassemble::{ReassemblyReport, Reassembler};
use crate::table::TableId;
use crate::tools::Toolset;
use crate::workspace::Workspace;

/// Result of a successful apply.
#[derive(Debug)]
pub struct ApplyOutcome {
    /// The override image the default entry now boots.
    pub image: PathBuf,
    pub entry: BootEntry,
    pub applied: Vec<TableId>,
    /// Selected tables left out of the image.
    pub table_failures: Vec<TableFailure>,
}

pub struct Pipeline<'a> {
    workspace: Workspace,
    tools: &'a Toolset,
    settings: &'a Settings,
    cancel: &'a CancelToken,
    journal: Option<Journal>,
}

impl<'a> Pipeline<'a> {
    pub fn new(settings: &'a Settings, tools: &'a Toolset, cancel: &'a CancelToken) -> Self {
        Self {
            workspace: Workspace::new(&settings.workspace_root),
            tools,
            settings,
            cancel,
            journal: settings.journal_path.as_ref().map(Journal::new),
        }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Dump, split and disassemble the firmware tables into a fresh workspace.
    ///
    /// Any edits from a previous session are discarded.
    pub fn extract(&self) -> Result<Vec<TableId>> {
        let _lock = self.workspace.lock()?;
        self.enter(ApplyStage::Extracting, "dumping firmware tables");
        let result = self
            .workspace
            .reset()
            .and_then(|()| TableExtractor::new(self.tools, self.cancel).extract(&self.workspace));
        match &result {
            Ok(ids) => self.enter(ApplyStage::Editable, &format!("tables: {}", join_ids(ids))),
            Err(err) => self.record(&format!("extracting failed: {err}")),
        }
        result
    }

    pub fn list_editable_tables(&self) -> Result<Vec<TableId>> {
        self.workspace.list_tables()
    }

    pub fn read_modified_source(&self, id: &TableId) -> Result<String> {
        self.workspace.read_modified(id)
    }

    pub fn write_modified_source(&self, id: &TableId, text: &str) -> Result<()> {
        let _lock = self.workspace.lock()?;
        self.workspace.write_modified(id, text)?;
        log::info!("updated modified source of '{id}'");
        Ok(())
    }

    pub fn modified_tables(&self) -> Result<Vec<TableId>> {
        self.workspace.modified_tables()
    }

    /// Compile `ids`, compose an override image and boot it by default.
    ///
    /// Tables that fail individually are reported in the outcome; the attempt
    /// fails only when none of them compiled or a later stage fails.
    pub fn apply_selected(
        &self,
        ids: &BTreeSet<TableId>,
    ) -> std::result::Result<ApplyOutcome, ApplyFailure> {
        let _lock = self
            .workspace
            .lock()
            .map_err(|err| self.fail(ApplyFailure::new(ApplyStage::Reassembling, err)))?;
        if ids.is_empty() {
            return Err(self.fail(ApplyFailure::new(
                ApplyStage::Reassembling,
                PipelineError::Validation("no tables selected".into()),
            )));
        }

        self.enter(
            ApplyStage::Reassembling,
            &format!("compiling {}", join_ids(ids.iter())),
        );
        let artifacts_dir = &self.settings.artifacts_dir;
        let scratch = fs::create_dir_all(artifacts_dir)
            .and_then(|()| {
                tempfile::Builder::new()
                    .prefix(".acpied-aml-")
                    .tempdir_in(artifacts_dir)
            })
            .io_context(artifacts_dir, || {
                format!("creating scratch directory in '{}'", artifacts_dir.display())
            })
            .map_err(|err| self.fail(ApplyFailure::new(ApplyStage::Reassembling, err)))?;
        let report = Reassembler::new(self.tools.disassembler.as_ref(), self.cancel)
            .reassemble(&self.workspace, ids, scratch.path())
            .map_err(|err| self.fail(ApplyFailure::new(ApplyStage::Reassembling, err)))?;
        for failure in &report.failures {
            self.record(&failure.to_string());
        }
        if report.artifacts.is_empty() {
            let cause = nothing_compiled(&report.failures);
            return Err(self.fail(
                ApplyFailure::new(ApplyStage::Reassembling, cause)
                    .with_table_failures(report.failures),
            ));
        }

        let applied: Vec<TableId> = report.artifacts.keys().cloned().collect();
        self.enter(
            ApplyStage::Composing,
            &format!("composing override for {}", join_ids(&applied)),
        );
        let updater = BootEntryUpdater::new(self.tools.boot_store.as_ref(), self.cancel);
        let entry = updater
            .current_entry()
            .map_err(|err| self.fail_after(ApplyStage::Composing, &report, locate_error(err)))?;
        let base = resolve_base_initrd(&entry)
            .map_err(|err| self.fail_after(ApplyStage::Composing, &report, err))?;
        let image = InitrdComposer::new(self.tools.archiver.as_ref(), artifacts_dir, self.cancel)
            .compose(&report.artifacts, &base, Some(&entry.kernel))
            .map_err(|err| self.fail_after(ApplyStage::Composing, &report, err))?;
        drop(scratch);

        self.enter(
            ApplyStage::Updating,
            &format!("booting '{}'", image.path.display()),
        );
        if self.cancel.is_cancelled() {
            return Err(self.fail_after(ApplyStage::Updating, &report, PipelineError::Cancelled));
        }
        let entry = updater
            .apply(&image.path)
            .map_err(|err| self.fail_after(ApplyStage::Updating, &report, err))?;

        self.enter(
            ApplyStage::Applied,
            &format!(
                "'{}' boots '{}'",
                entry.kernel.display(),
                entry.initrd.display()
            ),
        );
        Ok(ApplyOutcome {
            image: image.path,
            entry,
            applied,
            table_failures: report.failures,
        })
    }

    /// Boot the base initrd recorded in `image`'s manifest again.
    pub fn restore(&self, image: &Path) -> std::result::Result<PathBuf, ApplyFailure> {
        let _lock = self
            .workspace
            .lock()
            .map_err(|err| self.fail(ApplyFailure::new(ApplyStage::Updating, err)))?;
        let manifest = read_manifest(image)
            .map_err(|err| self.fail(ApplyFailure::new(ApplyStage::Updating, err)))?;
        self.enter(
            ApplyStage::Updating,
            &format!(
                "restoring '{}' (base of '{}')",
                manifest.base_initrd.display(),
                image.display()
            ),
        );
        let entry = BootEntryUpdater::new(self.tools.boot_store.as_ref(), self.cancel)
            .apply(&manifest.base_initrd)
            .map_err(|err| self.fail(ApplyFailure::new(ApplyStage::Updating, err)))?;
        self.enter(
            ApplyStage::Applied,
            &format!("'{}' boots '{}'", entry.kernel.display(), entry.initrd.display()),
        );
        Ok(entry.initrd)
    }

    fn enter(&self, stage: ApplyStage, detail: &str) {
        log::info!("[{stage}] {detail}");
        self.record(&format!("{stage}: {detail}"));
    }

    fn fail(&self, failure: ApplyFailure) -> ApplyFailure {
        log::error!("{failure}");
        self.record(&failure.to_string());
        for table in &failure.table_failures {
            self.record(&format!("  {table}"));
        }
        failure
    }

    /// Failure past reassembly, carrying the tables that were left out.
    fn fail_after(
        &self,
        stage: ApplyStage,
        report: &ReassemblyReport,
        cause: PipelineError,
    ) -> ApplyFailure {
        self.fail(ApplyFailure::new(stage, cause).with_table_failures(report.failures.clone()))
    }

    fn record(&self, line: &str) {
        if let Some(journal) = &self.journal {
            journal.note(line);
        }
    }
}

fn join_ids<'i>(ids: impl IntoIterator<Item = &'i TableId>) -> String {
    ids.into_iter()
        .map(TableId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

fn nothing_compiled(failures: &[TableFailure]) -> PipelineError {
    match failures {
        [TableFailure {
            id,
            kind: TableFailureKind::NotFound,
        }] => PipelineError::NotFound(id.clone()),
        _ => PipelineError::Compile(format!(
            "none of the selected tables compiled ({})",
            join_ids(failures.iter().map(|f| &f.id))
        )),
    }
}

fn locate_error(err: BootStoreError) -> PipelineError {
    match err {
        BootStoreError::Tool(tool) if tool.is_cancelled() => PipelineError::Cancelled,
        other => PipelineError::Compose(format!("cannot locate the active initrd: {other}")),
    }
}
