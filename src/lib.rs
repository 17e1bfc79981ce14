//! Edit the firmware's ACPI tables and boot them through an initrd override.
//!
//! The crate drives the host ACPICA tools and the boot loader to turn edited
//! table sources into a kernel-loadable override:
//!
//! - **Workspace** - `origin` and `modified` sources per table, plus raw dumps
//! - **Extraction** - `acpidump`, `acpixtract` and `iasl -d` into the workspace
//! - **Reassembly** - `iasl` per selected table, failures isolated per table
//! - **Composition** - newc fragment at `kernel/firmware/acpi/`, then the base initrd
//! - **Boot update** - `grubby` repoints the default entry and is re-read to verify
//!
//! # Architecture
//!
//! ```text
//! acpied (binary)
//!     │
//!     └── pipeline::Pipeline ── extract ──> workspace
//!             │
//!             ├── reassemble ──> tools::Disassembler (iasl)
//!             ├── compose ─────> tools::Archiver (cpio | native newc)
//!             └── boot ────────> boot::BootConfigStore (grubby)
//! ```
//!
//! Every external program runs through [`process::ToolCommand`] with a timeout
//! and a [`process::CancelToken`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::collections::BTreeSet;
//! use acpi_override::{CancelToken, Pipeline, Settings, TableId, Toolset};
//!
//! let settings = Settings::discover()?;
//! let tools = Toolset::system(&settings);
//! let cancel = CancelToken::new();
//! let pipeline = Pipeline::new(&settings, &tools, &cancel);
//!
//! pipeline.extract()?;
//! let dsdt: TableId = "dsdt".parse()?;
//! let source = pipeline.read_modified_source(&dsdt)?;
//! pipeline.write_modified_source(&dsdt, &source.replace("Zero", "One"))?;
//!
//! let outcome = pipeline.apply_selected(&BTreeSet::from([dsdt]))?;
//! println!("next boot uses {}", outcome.image.display());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod boot;
pub mod compose;
pub mod config;
pub mod error;
pub mod extract;
pub mod journal;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod reassemble;
pub mod table;
pub mod tools;
pub mod workspace;

#[cfg(test)]
mod testing;

pub use config::Settings;
pub use error::{ApplyFailure, ApplyStage, PipelineError, Result, TableFailure};
pub use pipeline::{ApplyOutcome, Pipeline};
pub use process::CancelToken;
pub use table::TableId;
pub use tools::Toolset;
