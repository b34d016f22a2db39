//! Kernel module preloading for filesystems and removable-media buses.

use crate::command;
use crate::config::CryptkeyConfig;
use crate::error::{CryptkeyError, CryptkeyResult};
use log::{debug, warn};
use std::path::PathBuf;

/// Loads kernel modules by name.
pub trait ModuleLoader {
    /// Make sure `name` is loaded. Returns false when it could not be.
    fn ensure_loaded(&self, name: &str) -> bool;
}

/// `modprobe`-backed loader.
#[derive(Debug, Clone)]
pub struct ModprobeLoader {
    binary: PathBuf,
}

impl ModprobeLoader {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn from_config(config: &CryptkeyConfig) -> Self {
        Self::new(&config.system.modprobe_path)
    }

    fn modprobe(&self, name: &str) -> CryptkeyResult<()> {
        let out = command::run(self.binary.as_os_str(), ["-q", name]).map_err(|err| {
            CryptkeyError::Module(format!("failed to run {}: {err}", self.binary.display()))
        })?;
        if !out.success() {
            return Err(CryptkeyError::Module(format!(
                "modprobe {name}: {}",
                out.diagnostic()
            )));
        }
        Ok(())
    }
}

impl ModuleLoader for ModprobeLoader {
    fn ensure_loaded(&self, name: &str) -> bool {
        match self.modprobe(name) {
            Ok(()) => true,
            Err(err) => {
                warn!("{err}");
                false
            }
        }
    }
}

/// Load every module in `names`, continuing past failures. Returns how many loaded.
///
/// A module that is built into the kernel or simply absent is not an error for the
/// unlock attempt; the keyfile path will just fail later and fall back to the prompt.
pub fn preload_modules<L, S>(loader: &L, names: &[S]) -> usize
where
    L: ModuleLoader + ?Sized,
    S: AsRef<str>,
{
    let mut loaded = 0;
    for name in names {
        let name = name.as_ref().trim();
        if name.is_empty() {
            continue;
        }
        if loader.ensure_loaded(name) {
            debug!("module {name} ready");
            loaded += 1;
        }
    }
    loaded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::write_executable;
    use std::cell::RefCell;
    use std::fs;
    use tempfile::tempdir;

    struct ScriptedLoader {
        missing: Vec<&'static str>,
        attempted: RefCell<Vec<String>>,
    }

    impl ModuleLoader for ScriptedLoader {
        fn ensure_loaded(&self, name: &str) -> bool {
            self.attempted.borrow_mut().push(name.to_string());
            !self.missing.iter().any(|missing| *missing == name)
        }
    }

    #[test]
    fn failed_module_does_not_stop_the_rest() {
        let loader = ScriptedLoader {
            missing: vec!["xfs"],
            attempted: RefCell::new(Vec::new()),
        };
        let loaded = preload_modules(&loader, &["ext4", "xfs", " ", "usb_storage"]);
        assert_eq!(loaded, 2);
        assert_eq!(
            *loader.attempted.borrow(),
            vec!["ext4".to_string(), "xfs".to_string(), "usb_storage".to_string()]
        );
    }

    #[test]
    fn modprobe_loader_runs_quietly_and_reports_failures() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("modprobe.log");
        let modprobe = dir.path().join("modprobe");
        write_executable(
            &modprobe,
            &format!(
                "#!/bin/sh\necho \"$*\" >> {}\n[ \"$2\" = sdhci ] && exit 1\nexit 0\n",
                log.display()
            ),
        );

        let loader = ModprobeLoader::new(&modprobe);
        assert!(loader.ensure_loaded("vfat"));
        assert!(!loader.ensure_loaded("sdhci"));
        assert_eq!(fs::read_to_string(&log).unwrap(), "-q vfat\n-q sdhci\n");

        assert!(!ModprobeLoader::new(dir.path().join("missing")).ensure_loaded("vfat"));
    }
}
