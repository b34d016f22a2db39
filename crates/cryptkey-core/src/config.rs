//! Configuration model and helpers used by the keyscript.

use crate::error::{CryptkeyError, CryptkeyResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/cryptkey.toml";
pub const CONFIG_PATH_ENV: &str = "CRYPTKEY_CONFIG";
pub const DEFAULT_ASKPASS_PATH: &str = "/lib/cryptsetup/askpass";
/// Upper bound on the key device wait. Larger configured values are clamped.
pub const MAX_WAIT_TIMEOUT_SECS: u64 = 3_600;
pub const DEFAULT_PRELOAD_MODULES: &[&str] = &[
    "ext2",
    "ext3",
    "ext4",
    "xfs",
    "vfat",
    "usb_storage",
    "mmc_block",
    "sdhci",
];

/// Keyfile device discovery and mount behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyfileCfg {
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_mount_root")]
    pub mount_root: String,

    #[serde(default = "default_mount_options")]
    pub mount_options: String,

    /// Drop one final `\n` from the keyfile. Turn off for binary keys that may end in 0x0a.
    #[serde(default = "default_true")]
    pub strip_trailing_newline: bool,

    #[serde(default = "default_dev_root")]
    pub dev_root: String,
}

fn default_wait_timeout_secs() -> u64 {
    10
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_mount_root() -> String {
    "/run/cryptkey".to_string()
}

fn default_mount_options() -> String {
    "ro,nosuid,nodev,noexec".to_string()
}

fn default_dev_root() -> String {
    "/dev".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for KeyfileCfg {
    fn default() -> Self {
        Self {
            wait_timeout_secs: default_wait_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            mount_root: default_mount_root(),
            mount_options: default_mount_options(),
            strip_trailing_newline: true,
            dev_root: default_dev_root(),
        }
    }
}

/// Locations of the external binaries the keyscript shells out to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemCfg {
    #[serde(default = "default_mount_path")]
    pub mount_path: String,

    #[serde(default = "default_umount_path")]
    pub umount_path: String,

    #[serde(default = "default_modprobe_path")]
    pub modprobe_path: String,
}

fn default_mount_path() -> String {
    "mount".to_string()
}

fn default_umount_path() -> String {
    "umount".to_string()
}

fn default_modprobe_path() -> String {
    "modprobe".to_string()
}

impl Default for SystemCfg {
    fn default() -> Self {
        Self {
            mount_path: default_mount_path(),
            umount_path: default_umount_path(),
            modprobe_path: default_modprobe_path(),
        }
    }
}

/// Kernel modules that must be present before the key device can show up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModulesCfg {
    #[serde(default = "default_preload")]
    pub preload: Vec<String>,
}

fn default_preload() -> Vec<String> {
    DEFAULT_PRELOAD_MODULES
        .iter()
        .map(|name| name.to_string())
        .collect()
}

impl Default for ModulesCfg {
    fn default() -> Self {
        Self {
            preload: default_preload(),
        }
    }
}

/// Interactive fallback settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptCfg {
    #[serde(default = "default_askpass_path")]
    pub askpass_path: Option<String>,

    #[serde(default)]
    pub label: Option<String>,
}

fn default_askpass_path() -> Option<String> {
    Some(DEFAULT_ASKPASS_PATH.to_string())
}

impl Default for PromptCfg {
    fn default() -> Self {
        Self {
            askpass_path: default_askpass_path(),
            label: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingCfg {
    #[serde(default)]
    pub verbose: bool,
}

/// Top-level configuration snapshot loaded from disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CryptkeyConfig {
    #[serde(default)]
    pub keyfile: KeyfileCfg,

    #[serde(default)]
    pub system: SystemCfg,

    #[serde(default)]
    pub modules: ModulesCfg,

    #[serde(default)]
    pub prompt: PromptCfg,

    #[serde(default)]
    pub logging: LoggingCfg,

    #[serde(skip)]
    pub path: Option<PathBuf>,

    #[serde(skip)]
    pub format: ConfigFormat,
}

/// Tracks whether we parsed TOML or YAML.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfigFormat {
    #[default]
    Toml,
    Yaml,
}

impl CryptkeyConfig {
    /// Resolve the config path from `CRYPTKEY_CONFIG`, falling back to the system default.
    pub fn default_path() -> PathBuf {
        match env::var(CONFIG_PATH_ENV) {
            Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
            _ => PathBuf::from(DEFAULT_CONFIG_PATH),
        }
    }

    /// Load configuration from `path`, using built-in defaults when the file is absent.
    ///
    /// Most initramfs images ship without a config file, so a missing file is normal.
    /// The fallback is silent here; `is_builtin` tells the caller it happened. This runs
    /// before the logger is installed, so anything logged here would be lost.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> CryptkeyResult<Self> {
        let path = path.as_ref();
        match fs::metadata(path) {
            Ok(_) => Self::load(path),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(CryptkeyError::Io(err)),
        }
    }

    /// Read a config file from disk and detect its format from the extension.
    pub fn load<P: AsRef<Path>>(path: P) -> CryptkeyResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let is_toml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some(ext) if ext.eq_ignore_ascii_case("toml")
        );
        let mut cfg = if is_toml {
            toml::from_str::<Self>(&contents)?
        } else {
            serde_yaml::from_str::<Self>(&contents)?
        };

        cfg.path = Some(path.to_path_buf());
        cfg.format = if is_toml {
            ConfigFormat::Toml
        } else {
            ConfigFormat::Yaml
        };

        Ok(cfg)
    }

    /// Perform a best-effort validation pass and return human-readable issues.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.keyfile.wait_timeout_secs == 0 {
            issues.push("keyfile.wait_timeout_secs must be greater than 0".to_string());
        } else if self.keyfile.wait_timeout_secs > MAX_WAIT_TIMEOUT_SECS {
            issues.push(format!(
                "keyfile.wait_timeout_secs exceeds {MAX_WAIT_TIMEOUT_SECS}; clamping to that"
            ));
        }
        let wait_ms = self.keyfile.wait_timeout_secs.saturating_mul(1_000);
        if self.keyfile.poll_interval_ms == 0 {
            issues.push("keyfile.poll_interval_ms must be greater than 0".to_string());
        } else if self.keyfile.poll_interval_ms > wait_ms {
            issues.push(
                "keyfile.poll_interval_ms must not exceed keyfile.wait_timeout_secs".to_string(),
            );
        }
        if !Path::new(&self.keyfile.mount_root).is_absolute() {
            issues.push(format!(
                "keyfile.mount_root must be an absolute path (got {})",
                self.keyfile.mount_root
            ));
        }
        if !Path::new(&self.keyfile.dev_root).is_absolute() {
            issues.push(format!(
                "keyfile.dev_root must be an absolute path (got {})",
                self.keyfile.dev_root
            ));
        }
        if self
            .modules
            .preload
            .iter()
            .any(|name| name.trim().is_empty())
        {
            issues.push("modules.preload contains an empty module name".to_string());
        }
        if let Some(askpass) = &self.prompt.askpass_path {
            if askpass.trim().is_empty() {
                issues.push(
                    "prompt.askpass_path is empty; omit it to use the console prompt".to_string(),
                );
            }
        }

        issues
    }

    /// True when no file backed this configuration.
    pub fn is_builtin(&self) -> bool {
        self.path.is_none()
    }

    /// Translate the stored device wait into a `Duration`, clamped to `MAX_WAIT_TIMEOUT_SECS`.
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.keyfile.wait_timeout_secs.min(MAX_WAIT_TIMEOUT_SECS))
    }

    /// Translate the stored poll interval into a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.keyfile.poll_interval_ms.max(1))
    }

    pub fn mount_root(&self) -> PathBuf {
        PathBuf::from(&self.keyfile.mount_root)
    }

    pub fn dev_root(&self) -> PathBuf {
        PathBuf::from(&self.keyfile.dev_root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::EnvGuard;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_boot_conventions() {
        let config = CryptkeyConfig::default();
        assert_eq!(config.wait_timeout(), Duration::from_secs(10));
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.mount_root(), PathBuf::from("/run/cryptkey"));
        assert_eq!(config.dev_root(), PathBuf::from("/dev"));
        assert!(config.keyfile.strip_trailing_newline);
        assert!(!config.logging.verbose);
        assert_eq!(
            config.prompt.askpass_path.as_deref(),
            Some(DEFAULT_ASKPASS_PATH)
        );
        assert_eq!(config.modules.preload, default_preload());
        assert!(config.validate().is_empty());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let config = CryptkeyConfig::load_or_default(dir.path().join("absent.toml")).unwrap();
        assert!(config.is_builtin());
        assert_eq!(config.keyfile.wait_timeout_secs, 10);

        let path = dir.path().join("present.toml");
        fs::write(&path, "").unwrap();
        let config = CryptkeyConfig::load_or_default(&path).unwrap();
        assert!(!config.is_builtin());
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cryptkey.toml");
        fs::write(
            &path,
            "[keyfile]\nwait_timeout_secs = 30\n\n[modules]\npreload = [\"vfat\"]\n",
        )
        .unwrap();

        let config = CryptkeyConfig::load(&path).unwrap();
        assert_eq!(config.format, ConfigFormat::Toml);
        assert_eq!(config.path.as_deref(), Some(path.as_path()));
        assert_eq!(config.keyfile.wait_timeout_secs, 30);
        assert_eq!(config.keyfile.poll_interval_ms, 100);
        assert_eq!(config.modules.preload, vec!["vfat".to_string()]);
        assert_eq!(config.system.mount_path, "mount");
    }

    #[test]
    fn unknown_extension_parses_as_yaml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cryptkey.conf");
        fs::write(&path, "logging:\n  verbose: true\nprompt:\n  askpass_path: null\n").unwrap();

        let config = CryptkeyConfig::load(&path).unwrap();
        assert_eq!(config.format, ConfigFormat::Yaml);
        assert!(config.logging.verbose);
        assert!(config.prompt.askpass_path.is_none());
    }

    #[test]
    fn malformed_toml_reports_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cryptkey.toml");
        fs::write(&path, "[keyfile\nwait_timeout_secs = ").unwrap();

        match CryptkeyConfig::load_or_default(&path) {
            Err(CryptkeyError::ConfigParse(_)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn validate_flags_bad_values() {
        let mut config = CryptkeyConfig::default();
        config.keyfile.wait_timeout_secs = 0;
        config.keyfile.mount_root = "run/cryptkey".into();
        config.modules.preload.push("  ".into());

        let issues = config.validate();
        assert!(issues.iter().any(|i| i.contains("wait_timeout_secs")));
        assert!(issues.iter().any(|i| i.contains("mount_root")));
        assert!(issues.iter().any(|i| i.contains("empty module name")));
    }

    #[test]
    fn poll_interval_longer_than_timeout_is_flagged() {
        let mut config = CryptkeyConfig::default();
        config.keyfile.wait_timeout_secs = 1;
        config.keyfile.poll_interval_ms = 5_000;
        assert!(config
            .validate()
            .iter()
            .any(|issue| issue.contains("poll_interval_ms")));
    }

    #[test]
    fn huge_wait_timeout_is_clamped_not_fatal() {
        let mut config = CryptkeyConfig::default();
        config.keyfile.wait_timeout_secs = u64::MAX;

        let issues = config.validate();
        assert_eq!(issues.len(), 1, "{issues:?}");
        assert!(issues[0].contains("clamping"));
        assert_eq!(
            config.wait_timeout(),
            Duration::from_secs(MAX_WAIT_TIMEOUT_SECS)
        );

        config.keyfile.poll_interval_ms = u64::MAX;
        assert!(!config
            .validate()
            .iter()
            .any(|issue| issue.contains("poll_interval_ms")));
    }

    #[test]
    fn config_path_respects_env_override() {
        let guard = EnvGuard::set(CONFIG_PATH_ENV, "/tmp/override.toml");
        assert_eq!(
            CryptkeyConfig::default_path(),
            PathBuf::from("/tmp/override.toml")
        );
        drop(guard);
    }
}
