//! Interactive password prompt collaborator.
//!
//! Console and remote entry are multiplexed by the askpass helper shipped in the
//! initramfs. From here it is a single blocking call that yields the passphrase on
//! stdout. When no helper is available we read from the controlling TTY instead.

use crate::config::CryptkeyConfig;
use crate::error::{CryptkeyError, CryptkeyResult};
use crate::passphrase::Passphrase;
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

pub const CRYPTTAB_NAME_ENV: &str = "CRYPTTAB_NAME";
pub const CRYPTTAB_SOURCE_ENV: &str = "CRYPTTAB_SOURCE";

/// Something that can ask a human (local or remote) for a password.
pub trait InteractivePrompt {
    fn prompt_password(&self, label: &str) -> CryptkeyResult<Passphrase>;
}

impl<P: InteractivePrompt + ?Sized> InteractivePrompt for &P {
    fn prompt_password(&self, label: &str) -> CryptkeyResult<Passphrase> {
        (**self).prompt_password(label)
    }
}

/// Runs `<askpass> <label>` and takes its stdout verbatim.
#[derive(Debug, Clone)]
pub struct AskpassPrompt {
    binary: PathBuf,
}

impl AskpassPrompt {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

impl InteractivePrompt for AskpassPrompt {
    fn prompt_password(&self, label: &str) -> CryptkeyResult<Passphrase> {
        debug!("prompting via {}", self.binary.display());
        let output = Command::new(&self.binary)
            .arg(label)
            .stdin(Stdio::inherit())
            .stderr(Stdio::inherit())
            .stdout(Stdio::piped())
            .output()
            .map_err(|err| {
                CryptkeyError::Prompt(format!("failed to run {}: {err}", self.binary.display()))
            })?;

        if !output.status.success() {
            return Err(CryptkeyError::Prompt(format!(
                "{} exited with code {}",
                self.binary.display(),
                output.status.code().unwrap_or(-1)
            )));
        }

        Ok(Passphrase::new(output.stdout))
    }
}

/// Reads a password from the controlling terminal with echo disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsolePrompt;

impl InteractivePrompt for ConsolePrompt {
    fn prompt_password(&self, label: &str) -> CryptkeyResult<Passphrase> {
        let password = rpassword::prompt_password(label)
            .map_err(|err| CryptkeyError::Prompt(format!("console prompt: {err}")))?;
        Ok(Passphrase::new(password.into_bytes()))
    }
}

/// Prompt chosen from configuration at startup.
#[derive(Debug, Clone)]
pub enum SystemPrompt {
    Askpass(AskpassPrompt),
    Console(ConsolePrompt),
}

impl SystemPrompt {
    /// Prefer the configured askpass helper; fall back to the console when it is
    /// unset or missing from the image.
    pub fn from_config(config: &CryptkeyConfig) -> Self {
        match config
            .prompt
            .askpass_path
            .as_deref()
            .map(str::trim)
            .filter(|path| !path.is_empty())
        {
            Some(path) if Path::new(path).exists() => {
                SystemPrompt::Askpass(AskpassPrompt::new(path))
            }
            Some(path) => {
                info!("askpass helper {path} not found; prompting on the console");
                SystemPrompt::Console(ConsolePrompt)
            }
            None => SystemPrompt::Console(ConsolePrompt),
        }
    }
}

impl InteractivePrompt for SystemPrompt {
    fn prompt_password(&self, label: &str) -> CryptkeyResult<Passphrase> {
        match self {
            SystemPrompt::Askpass(prompt) => prompt.prompt_password(label),
            SystemPrompt::Console(prompt) => prompt.prompt_password(label),
        }
    }
}

/// Build the prompt text. An explicit label wins over the crypttab mapping name and
/// its source device.
pub fn prompt_label(
    configured: Option<&str>,
    crypttab_name: Option<&str>,
    crypttab_source: Option<&str>,
) -> String {
    if let Some(label) = configured.filter(|label| !label.trim().is_empty()) {
        return label.to_string();
    }
    match (non_empty(crypttab_name), non_empty(crypttab_source)) {
        (Some(name), Some(source)) => format!("Please unlock disk {name} ({source}): "),
        (Some(name), None) => format!("Please unlock disk {name}: "),
        (None, Some(source)) => format!("Please unlock disk {source}: "),
        (None, None) => "Please unlock disk: ".to_string(),
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}
