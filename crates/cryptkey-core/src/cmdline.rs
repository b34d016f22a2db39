//! Kernel command line parsing for the `crypt_keyfile=` parameter.

use crate::device::DeviceReference;
use crate::error::CryptkeyResult;
use std::fs;
use std::path::{Component, Path, PathBuf};

pub const DEFAULT_CMDLINE_PATH: &str = "/proc/cmdline";
pub const KEYFILE_PARAM: &str = "crypt_keyfile";
/// Bare flag that turns on debug diagnostics for this boot.
pub const DEBUG_FLAG: &str = "cryptkey.debug";

/// Device reference plus the key path relative to that device's filesystem root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpec {
    pub device: DeviceReference,
    pub key_path: PathBuf,
}

/// Result of finding a `crypt_keyfile=` parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedKeySpec {
    Valid(KeySpec),
    /// Present but unusable. Carries no device or key path, only the raw value for logs.
    Invalid { value: String },
}

impl ParsedKeySpec {
    pub fn is_valid(&self) -> bool {
        matches!(self, ParsedKeySpec::Valid(_))
    }
}

/// Read and tokenize the kernel command line at `path`.
pub fn read_cmdline<P: AsRef<Path>>(path: P) -> CryptkeyResult<Vec<String>> {
    let raw = fs::read(path.as_ref())?;
    Ok(tokenize(&String::from_utf8_lossy(&raw)))
}

/// Split a command line the way the kernel does: whitespace separated, with double
/// quotes grouping a value that contains spaces. Quotes are not kept.
pub fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quoted = false;

    for ch in line.chars() {
        match ch {
            '"' => {
                quoted = !quoted;
                in_token = true;
            }
            c if c.is_ascii_whitespace() && !quoted => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        tokens.push(current);
    }

    tokens
}

/// Returns true when the bare debug flag is on the command line.
pub fn debug_requested<S: AsRef<str>>(tokens: &[S]) -> bool {
    tokens.iter().any(|token| token.as_ref() == DEBUG_FLAG)
}

/// Locate the last `crypt_keyfile=` token and parse it.
///
/// `None` means the parameter was never given. A present but malformed value yields
/// `ParsedKeySpec::Invalid`, which is an ordinary "no usable keyfile" answer.
pub fn parse_key_spec<S: AsRef<str>>(tokens: &[S]) -> Option<ParsedKeySpec> {
    let prefix = format!("{KEYFILE_PARAM}=");
    let value = tokens
        .iter()
        .filter_map(|token| token.as_ref().strip_prefix(prefix.as_str()))
        .last()?;
    Some(parse_value(value))
}

fn parse_value(value: &str) -> ParsedKeySpec {
    let (device_part, key_part) = match value.split_once(':') {
        Some((device, key)) => (device, key),
        None => (value, ""),
    };

    let device = if let Some(uuid) = strip_prefix_ignore_case(device_part, "UUID=") {
        DeviceReference::ByUuid(uuid.to_string())
    } else if let Some(label) = strip_prefix_ignore_case(device_part, "LABEL=") {
        DeviceReference::ByLabel(label.to_string())
    } else {
        DeviceReference::ByPath(device_part.to_string())
    };

    let key_path = PathBuf::from(key_part.trim_start_matches('/'));

    let escapes_device = key_path
        .components()
        .any(|component| matches!(component, Component::ParentDir));
    if device.identifier().is_empty() || key_path.as_os_str().is_empty() || escapes_device {
        return ParsedKeySpec::Invalid {
            value: value.to_string(),
        };
    }

    ParsedKeySpec::Valid(KeySpec { device, key_path })
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let head = value.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        value.get(prefix.len()..)
    } else {
        None
    }
}
