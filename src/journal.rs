//! Append-only operation journal (`/var/log/acpied.log` by default).
//!
//! One line per event, prefixed with a UTC `|YYYY-MM-DD HH:MM:SS|` stamp.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use time::OffsetDateTime;

use crate::error::{IoContext, Result};

#[derive(Debug, Clone)]
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry per line of `message`.
    pub fn record(&self, message: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .io_context(parent, || format!("creating '{}'", parent.display()))?;
        }
        let stamp = timestamp(OffsetDateTime::now_utc());
        let mut text = String::new();
        for line in message.lines() {
            text.push_str(&format!("|{stamp}| {line}\n"));
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .io_context(&self.path, || format!("opening journal '{}'", self.path.display()))?;
        file.write_all(text.as_bytes())
            .io_context(&self.path, || format!("appending to '{}'", self.path.display()))
    }

    /// Like [`Journal::record`], but a failure is only logged.
    pub fn note(&self, message: &str) {
        if let Err(err) = self.record(message) {
            log::warn!("journal: {err}");
        }
    }
}

fn timestamp(now: OffsetDateTime) -> String {
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}
