//! Read-only view of the kernel mount table.

use crate::error::CryptkeyResult;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const MOUNTS_OVERRIDE_ENV: &str = "CRYPTKEY_MOUNTS_PATH";
const DEFAULT_MOUNT_TABLE: &str = "/proc/mounts";

/// Mount table to consult: `CRYPTKEY_MOUNTS_PATH` when set, otherwise `/proc/mounts`.
pub fn mount_table_path() -> PathBuf {
    match env::var(MOUNTS_OVERRIDE_ENV) {
        Ok(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from(DEFAULT_MOUNT_TABLE),
    }
}

/// Return the source device mounted at `mountpoint` according to `table`, if any.
pub fn mounted_source(table: &Path, mountpoint: &Path) -> CryptkeyResult<Option<PathBuf>> {
    let mounts = fs::read_to_string(table)?;
    Ok(parse_mounts(&mounts, mountpoint))
}

/// True when `table` lists something mounted at `mountpoint`.
pub fn is_mountpoint_busy(table: &Path, mountpoint: &Path) -> CryptkeyResult<bool> {
    Ok(mounted_source(table, mountpoint)?.is_some())
}

fn parse_mounts(mounts: &str, mountpoint: &Path) -> Option<PathBuf> {
    // Later entries shadow earlier ones at the same mountpoint.
    let mut found = None;
    for line in mounts.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(device), Some(target)) = (parts.next(), parts.next()) else {
            continue;
        };
        if Path::new(&unescape_mount_field(target)) == mountpoint {
            found = Some(PathBuf::from(unescape_mount_field(device)));
        }
    }
    found
}

/// Decode the `\ooo` octal escapes the kernel writes for spaces, tabs and backslashes.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'\\' {
            if let Some(byte) = bytes.get(idx + 1..idx + 4).and_then(octal_byte) {
                decoded.push(byte);
                idx += 4;
                continue;
            }
        }
        decoded.push(bytes[idx]);
        idx += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

fn octal_byte(digits: &[u8]) -> Option<u8> {
    let value = digits.iter().try_fold(0u16, |acc, digit| match digit {
        b'0'..=b'7' => Some(acc * 8 + u16::from(digit - b'0')),
        _ => None,
    })?;
    u8::try_from(value).ok()
}
