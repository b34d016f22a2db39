//! Helpers shared by the unit tests.

use std::env;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Sets an environment variable for the life of the guard, restoring the old value on drop.
pub(crate) struct EnvGuard {
    key: &'static str,
    prev: Option<String>,
}

impl EnvGuard {
    pub(crate) fn set(key: &'static str, value: impl Into<String>) -> Self {
        let prev = env::var(key).ok();
        env::set_var(key, value.into());
        Self { key, prev }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        match self.prev.take() {
            Some(prev) => env::set_var(self.key, prev),
            None => env::remove_var(self.key),
        }
    }
}

/// Write a shell script standing in for a system binary.
pub(crate) fn write_executable(path: &Path, contents: &str) {
    fs::write(path, contents).unwrap();
    let mut perms = fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).unwrap();
}
