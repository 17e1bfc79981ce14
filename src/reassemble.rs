//! Reassembler: modified sources -> compiled tables.
//!
//! Failures are per table. A missing source or a compile error keeps that one
//! table out of the result and never stops its siblings from compiling.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use crate::error::{IoContext, PipelineError, Result, TableFailure, TableFailureKind};
use crate::process::CancelToken;
use crate::table::{CompiledTable, TableId};
use crate::tools::Disassembler;
use crate::workspace::Workspace;

/// Successes and per-table failures of one batch.
#[derive(Debug, Default)]
pub struct ReassemblyReport {
    pub artifacts: BTreeMap<TableId, CompiledTable>,
    pub failures: Vec<TableFailure>,
}

pub struct Reassembler<'a> {
    disassembler: &'a dyn Disassembler,
    cancel: &'a CancelToken,
}

impl<'a> Reassembler<'a> {
    pub fn new(disassembler: &'a dyn Disassembler, cancel: &'a CancelToken) -> Self {
        Self {
            disassembler,
            cancel,
        }
    }

    /// Compile each selected table into `out_dir/<id>.aml`.
    pub fn reassemble(
        &self,
        ws: &Workspace,
        ids: &BTreeSet<TableId>,
        out_dir: &Path,
    ) -> Result<ReassemblyReport> {
        fs::create_dir_all(out_dir)
            .io_context(out_dir, || format!("creating '{}'", out_dir.display()))?;

        let mut report = ReassemblyReport::default();
        for id in ids {
            if self.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            match self.compile_one(ws, id, out_dir) {
                Ok(table) => {
                    log::info!("compiled '{id}' ({} bytes)", table.bytes.len());
                    report.artifacts.insert(id.clone(), table);
                }
                Err(Outcome::Failed(kind)) => {
                    let failure = TableFailure {
                        id: id.clone(),
                        kind,
                    };
                    log::warn!("{failure}");
                    report.failures.push(failure);
                }
                Err(Outcome::Cancelled) => return Err(PipelineError::Cancelled),
            }
        }
        Ok(report)
    }

    fn compile_one(
        &self,
        ws: &Workspace,
        id: &TableId,
        out_dir: &Path,
    ) -> std::result::Result<CompiledTable, Outcome> {
        let source = ws.modified_source(id);
        if !source.is_file() {
            return Err(Outcome::Failed(TableFailureKind::NotFound));
        }

        let path = match self.disassembler.assemble(&source, id, out_dir, self.cancel) {
            Ok(path) => path,
            Err(err) if err.is_cancelled() => return Err(Outcome::Cancelled),
            Err(err) => return Err(compile_failure(err.diagnostic())),
        };

        match fs::read(&path) {
            Ok(bytes) if !bytes.is_empty() => Ok(CompiledTable {
                id: id.clone(),
                bytes,
                path,
            }),
            Ok(_) => Err(compile_failure(format!(
                "assembler produced an empty table at '{}'",
                path.display()
            ))),
            Err(err) => Err(compile_failure(format!(
                "assembler output '{}' unreadable: {err}",
                path.display()
            ))),
        }
    }
}

enum Outcome {
    Failed(TableFailureKind),
    Cancelled,
}

fn compile_failure(diagnostic: String) -> Outcome {
    Outcome::Failed(TableFailureKind::Compile { diagnostic })
}
