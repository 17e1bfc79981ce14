//! External helper processes with a timeout and cooperative cancellation.
//!
//! Every stage of the pipeline that shells out (dump, split, disassemble,
//! compile, archive, boot configuration) goes through [`ToolCommand`], so a
//! hung tool can never wedge an apply and an operator abort always reaps the
//! child.

use std::ffi::OsString;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::ToolError;

/// Default upper bound for one helper invocation.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Shared abort flag checked while waiting on helpers.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    linked: Option<&'static AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that also observes a process-wide flag (set from a signal handler).
    pub fn linked(flag: &'static AtomicBool) -> Self {
        Self {
            flag: Arc::default(),
            linked: Some(flag),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self
                .linked
                .map(|flag| flag.load(Ordering::SeqCst))
                .unwrap_or(false)
    }
}

/// Captured output of a successful helper run.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ToolOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Builder for one helper invocation.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    stdin: Option<Vec<u8>>,
    timeout: Duration,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            stdin: None,
            timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn stdin(mut self, bytes: Vec<u8>) -> Self {
        self.stdin = Some(bytes);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn program_name(&self) -> String {
        self.program.display().to_string()
    }

    /// Run to completion, failing on non-zero exit, timeout or cancellation.
    pub fn run(&self, cancel: &CancelToken) -> Result<ToolOutput, ToolError> {
        let program = self.program_name();
        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled { program });
        }

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        log::debug!("running {} {:?}", program, self.args);
        let mut child = cmd.spawn().map_err(|source| ToolError::Spawn {
            program: program.clone(),
            source,
        })?;

        let writer = self.stdin.clone().and_then(|bytes| {
            child.stdin.take().map(|mut pipe| {
                thread::spawn(move || {
                    // The child may exit before reading everything; that surfaces through its status.
                    let _ = pipe.write_all(&bytes);
                })
            })
        });
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let status = match wait_with_deadline(&mut child, self.timeout, cancel) {
            Ok(status) => status,
            Err(Wait::TimedOut) => {
                return Err(ToolError::TimedOut {
                    program,
                    timeout: self.timeout,
                })
            }
            Err(Wait::Cancelled) => return Err(ToolError::Cancelled { program }),
            Err(Wait::Io(source)) => return Err(ToolError::Io { program, source }),
        };

        if let Some(writer) = writer {
            let _ = writer.join();
        }
        let output = ToolOutput {
            stdout: collect(stdout),
            stderr: collect(stderr),
        };

        if !status.success() {
            return Err(ToolError::Failed {
                program,
                status,
                diagnostic: diagnostic_text(&output),
            });
        }
        Ok(output)
    }
}

enum Wait {
    TimedOut,
    Cancelled,
    Io(std::io::Error),
}

fn wait_with_deadline(
    child: &mut Child,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<std::process::ExitStatus, Wait> {
    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => {}
            Err(err) => {
                reap(child);
                return Err(Wait::Io(err));
            }
        }
        if cancel.is_cancelled() {
            reap(child);
            return Err(Wait::Cancelled);
        }
        if start.elapsed() > timeout {
            reap(child);
            return Err(Wait::TimedOut);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .map(|h| h.join().unwrap_or_default())
        .unwrap_or_default()
}

/// Stderr and stdout, trimmed, for operator-facing error messages.
pub fn diagnostic_text(output: &ToolOutput) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    match (stderr.trim(), stdout.trim()) {
        ("", "") => "no diagnostic output".to_string(),
        (err, "") => err.to_string(),
        ("", out) => out.to_string(),
        (err, out) => format!("{err}\n{out}"),
    }
}
