//! Thin wrapper around external helper binaries (`mount`, `umount`, `modprobe`).
//!
//! Keeps process handling in one place so the collaborators can be tested with fake
//! scripts dropped into a temp directory.

use std::ffi::OsStr;
use std::io;
use std::process::{Command, ExitStatus, Stdio};

/// Captured result of a helper invocation.
#[derive(Debug)]
pub(crate) struct CommandOutput {
    pub(crate) stdout: Vec<u8>,
    pub(crate) stderr: Vec<u8>,
    pub(crate) status: ExitStatus,
}

impl CommandOutput {
    pub(crate) fn success(&self) -> bool {
        self.status.success()
    }

    /// Prefer stderr, fall back to stdout, and never return an empty string.
    pub(crate) fn diagnostic(&self) -> String {
        let stderr = String::from_utf8_lossy(&self.stderr);
        let stdout = String::from_utf8_lossy(&self.stdout);
        let text = if !stderr.trim().is_empty() {
            stderr.trim().to_string()
        } else {
            stdout.trim().to_string()
        };
        if text.is_empty() {
            format!("exit code {}", self.status.code().unwrap_or(-1))
        } else {
            format!("{text} (exit code {})", self.status.code().unwrap_or(-1))
        }
    }
}

/// Run `binary` with `args`, stdin closed, capturing both output streams.
pub(crate) fn run<I, S>(binary: &OsStr, args: I) -> io::Result<CommandOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .output()?;
    Ok(CommandOutput {
        stdout: output.stdout,
        stderr: output.stderr,
        status: output.status,
    })
}
