//! Table Extractor: firmware dump -> per-table sources in `origin` and `modified`.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use crate::error::{IoContext, PipelineError, Result, ToolError};
use crate::process::CancelToken;
use crate::table::TableId;
use crate::tools::{Disassembler, FirmwareDump, TableSplitter, Toolset};
use crate::workspace::Workspace;

pub struct TableExtractor<'a> {
    dump: &'a dyn FirmwareDump,
    splitter: &'a dyn TableSplitter,
    disassembler: &'a dyn Disassembler,
    cancel: &'a CancelToken,
}

impl<'a> TableExtractor<'a> {
    pub fn new(tools: &'a Toolset, cancel: &'a CancelToken) -> Self {
        Self {
            dump: tools.dump.as_ref(),
            splitter: tools.splitter.as_ref(),
            disassembler: tools.disassembler.as_ref(),
            cancel,
        }
    }

    /// Populate a freshly reset workspace and return the discovered tables.
    ///
    /// Tables that fail to disassemble are logged and left out; only when none
    /// survive is the run an [`PipelineError::Extraction`] error.
    pub fn extract(&self, ws: &Workspace) -> Result<Vec<TableId>> {
        let blob = ws.raw_blob();
        self.dump
            .dump(&blob, self.cancel)
            .map_err(|err| stage_error("firmware dump", err))?;
        let size = fs::metadata(&blob).map(|md| md.len()).unwrap_or(0);
        if size == 0 {
            return Err(PipelineError::Extraction(format!(
                "firmware dump produced no data at '{}'",
                blob.display()
            )));
        }
        log::info!("dumped {size} bytes of ACPI tables to '{}'", blob.display());

        let split_dir = ws.split_dir();
        fs::create_dir_all(&split_dir)
            .io_context(&split_dir, || format!("creating '{}'", split_dir.display()))?;
        self.splitter
            .split(&blob, &split_dir, self.cancel)
            .map_err(|err| stage_error("table split", err))?;

        let extracts = collect_extracts(&split_dir)?;
        if extracts.is_empty() {
            return Err(PipelineError::Extraction(
                "no tables found in firmware dump".into(),
            ));
        }

        let origin_dir = ws.origin_dir();
        let mut tables = Vec::new();
        let mut failures = Vec::new();
        for (id, extract) in &extracts {
            match self
                .disassembler
                .disassemble(extract, id, &origin_dir, self.cancel)
            {
                Ok(source) if source.is_file() && source == ws.origin_source(id) => {
                    tables.push(id.clone())
                }
                Ok(source) => {
                    log::warn!(
                        "disassembling '{}' did not produce '{}'",
                        extract.display(),
                        ws.origin_source(id).display()
                    );
                    failures.push(format!("{id}: missing output '{}'", source.display()));
                }
                Err(err) if err.is_cancelled() => return Err(PipelineError::Cancelled),
                Err(err) => {
                    log::warn!("skipping table '{id}': {err}");
                    failures.push(format!("{id}: {}", err.diagnostic()));
                }
            }
        }
        if tables.is_empty() {
            return Err(PipelineError::Extraction(format!(
                "no table could be disassembled:\n  {}",
                failures.join("\n  ")
            )));
        }

        for id in &tables {
            let from = ws.origin_source(id);
            let to = ws.modified_source(id);
            fs::copy(&from, &to).io_context(&to, || {
                format!("seeding '{}' from '{}'", to.display(), from.display())
            })?;
        }

        log::info!("extracted {} table(s)", tables.len());
        Ok(tables)
    }
}

fn stage_error(stage: &str, err: ToolError) -> PipelineError {
    if err.is_cancelled() {
        PipelineError::Cancelled
    } else {
        PipelineError::Extraction(format!("{stage} failed: {err}"))
    }
}

/// Binary extracts keyed by identifier; the first file wins on a stem collision.
fn collect_extracts(dir: &std::path::Path) -> Result<BTreeMap<TableId, PathBuf>> {
    let entries = fs::read_dir(dir).io_context(dir, || format!("reading '{}'", dir.display()))?;
    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.io_context(dir, || format!("iterating '{}'", dir.display()))?;
        let path = entry.path();
        if path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();

    let mut extracts = BTreeMap::new();
    for path in paths {
        let id = match TableId::from_path(&path) {
            Ok(id) => id,
            Err(err) => {
                log::warn!("ignoring extract '{}': {err}", path.display());
                continue;
            }
        };
        if extracts.contains_key(&id) {
            log::warn!("ignoring '{}': table '{id}' already extracted", path.display());
            continue;
        }
        extracts.insert(id, path);
    }
    Ok(extracts)
}
