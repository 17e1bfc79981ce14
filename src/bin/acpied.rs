use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use acpi_override::compose::list_images;
use acpi_override::preflight::{check_required_tools, check_root, required_tools};
use acpi_override::{ApplyFailure, CancelToken, Pipeline, Settings, TableId, Toolset};
use anyhow::{bail, Context, Result};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

fn usage() -> &'static str {
    "Usage:\n  acpied extract\n  acpied list\n  acpied show <table>\n  acpied edit <table> <file>\n  acpied status\n  acpied apply [<table>[,<table>...]...]\n  acpied images\n  acpied restore <image>\n  acpied preflight"
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args: Vec<String> = std::env::args().skip(1).collect();

    // SAFETY: the handler only stores to an atomic.
    unsafe {
        libc::signal(
            libc::SIGINT,
            on_sigint as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
    }

    let settings = Settings::discover().context("loading acpied configuration")?;
    let tools = Toolset::system(&settings);
    let cancel = CancelToken::linked(&INTERRUPTED);
    let pipeline = Pipeline::new(&settings, &tools, &cancel);

    match args.as_slice() {
        [cmd] if cmd == "extract" => {
            preflight(&settings)?;
            extract(&pipeline)
        }
        [cmd] if cmd == "list" => list(&pipeline),
        [cmd, id] if cmd == "show" => show(&pipeline, &parse_id(id)?),
        [cmd, id, file] if cmd == "edit" => edit(&pipeline, &parse_id(id)?, Path::new(file)),
        [cmd] if cmd == "status" => status(&pipeline),
        [cmd, ids @ ..] if cmd == "apply" => {
            preflight(&settings)?;
            apply(&pipeline, ids)
        }
        [cmd] if cmd == "images" => images(&settings),
        [cmd, image] if cmd == "restore" => {
            preflight(&settings)?;
            restore(&pipeline, Path::new(image))
        }
        [cmd] if cmd == "preflight" => {
            preflight(&settings)?;
            println!("[acpied:preflight] host is ready");
            Ok(())
        }
        _ => bail!(usage()),
    }
}

fn preflight(settings: &Settings) -> Result<()> {
    check_root()?;
    check_required_tools(&required_tools(settings))
}

fn parse_id(raw: &str) -> Result<TableId> {
    raw.parse()
        .with_context(|| format!("'{raw}' is not a table identifier"))
}

fn extract(pipeline: &Pipeline) -> Result<()> {
    println!(
        "[acpied:extract] dumping firmware tables into '{}'...",
        pipeline.workspace().root().display()
    );
    let ids = pipeline.extract().context("extracting ACPI tables")?;
    for id in &ids {
        println!("{id}");
    }
    println!("[acpied:extract] {} table(s) ready to edit", ids.len());
    Ok(())
}

fn list(pipeline: &Pipeline) -> Result<()> {
    let modified: BTreeSet<TableId> = pipeline.modified_tables()?.into_iter().collect();
    for id in pipeline.list_editable_tables()? {
        let mark = if modified.contains(&id) { "*" } else { " " };
        println!("{mark} {id}");
    }
    Ok(())
}

fn show(pipeline: &Pipeline, id: &TableId) -> Result<()> {
    let text = pipeline.read_modified_source(id)?;
    print!("{text}");
    Ok(())
}

fn edit(pipeline: &Pipeline, id: &TableId, file: &Path) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("reading '{}'", file.display()))?;
    pipeline
        .write_modified_source(id, &text)
        .with_context(|| format!("saving modified source of '{id}'"))?;
    println!("[acpied:edit] saved '{id}'");
    Ok(())
}

fn status(pipeline: &Pipeline) -> Result<()> {
    let modified = pipeline.modified_tables()?;
    if modified.is_empty() {
        println!("[acpied:status] no modified tables");
    }
    for id in modified {
        println!("{id}");
    }
    Ok(())
}

fn apply(pipeline: &Pipeline, args: &[String]) -> Result<()> {
    let mut ids = BTreeSet::new();
    for raw in args.iter().flat_map(|arg| arg.split(',')) {
        if !raw.trim().is_empty() {
            ids.insert(parse_id(raw)?);
        }
    }
    if ids.is_empty() {
        ids = pipeline.modified_tables()?.into_iter().collect();
        if ids.is_empty() {
            bail!("no modified tables to apply; name the tables explicitly");
        }
    }

    let names: Vec<_> = ids.iter().map(TableId::as_str).collect();
    println!("[acpied:apply] applying {}...", names.join(", "));
    match pipeline.apply_selected(&ids) {
        Ok(outcome) => {
            for failure in &outcome.table_failures {
                println!("[acpied:apply] skipped {failure}");
            }
            println!(
                "[acpied:apply] '{}' now boots '{}'",
                outcome.entry.kernel.display(),
                outcome.image.display()
            );
            println!("[acpied:apply] reboot to load the override");
            Ok(())
        }
        Err(failure) => {
            report_failure(&failure);
            Err(failure.into())
        }
    }
}

fn report_failure(failure: &ApplyFailure) {
    eprintln!("[acpied:{}] failed", failure.stage);
    for table in &failure.table_failures {
        eprintln!("  {table}");
    }
}

fn images(settings: &Settings) -> Result<()> {
    let dir = &settings.artifacts_dir;
    let images = list_images(dir).with_context(|| format!("listing '{}'", dir.display()))?;
    if images.is_empty() {
        println!("[acpied:images] no override images in '{}'", dir.display());
    }
    for (path, manifest) in images {
        match manifest {
            Some(manifest) => {
                let tables: Vec<_> = manifest.tables.iter().map(|t| t.id.as_str()).collect();
                println!(
                    "{}  {}  base={}  tables={}",
                    path.display(),
                    manifest.created_at_utc,
                    manifest.base_initrd.display(),
                    tables.join(",")
                );
            }
            None => println!("{}  (no manifest)", path.display()),
        }
    }
    Ok(())
}

fn restore(pipeline: &Pipeline, image: &Path) -> Result<()> {
    match pipeline.restore(image) {
        Ok(initrd) => {
            println!("[acpied:restore] default entry boots '{}' again", initrd.display());
            Ok(())
        }
        Err(failure) => {
            report_failure(&failure);
            Err(failure.into())
        }
    }
}
