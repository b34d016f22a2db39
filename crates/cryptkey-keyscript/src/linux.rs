//! cryptsetup keyscript: print the volume passphrase on stdout, nothing else.
//!
//! The keyfile on the boot-time key device is preferred. Every failure on that path
//! ends at the interactive prompt, so the only way this binary exits non-zero is a
//! prompt that could not produce a passphrase or a stdout that could not take it.

use anyhow::{Context, Result};
use clap::Parser;
use cryptkey_core::{
    cmdline::{self, DEFAULT_CMDLINE_PATH},
    config::CryptkeyConfig,
    error::CryptkeyResult,
    logging, preload_modules,
    prompt::{CRYPTTAB_NAME_ENV, CRYPTTAB_SOURCE_ENV},
    prompt_label, KeyfileRetriever, ModprobeLoader, Passphrase, PassphraseAcquisition,
    PassphraseSource, SystemMounter, SystemPrompt,
};
use log::{debug, error, info, warn};
use std::env;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Command-line options. cryptsetup invokes keyscripts with the crypttab key field
/// as the only argument, so everything else is optional.
#[derive(Parser, Debug)]
#[command(
    name = "cryptkey-keyscript",
    version,
    about = "Emit a LUKS passphrase from a boot-time keyfile, prompting when it is unavailable."
)]
struct Args {
    /// Path to the configuration file (defaults to $CRYPTKEY_CONFIG or /etc/cryptkey.toml).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Kernel command line to parse.
    #[arg(long, default_value = DEFAULT_CMDLINE_PATH)]
    cmdline: PathBuf,

    /// Seconds to wait for the key device, overriding the configuration.
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Prompt text, overriding the configuration and crypttab name.
    #[arg(short, long)]
    label: Option<String>,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,

    /// Key field from crypttab, passed through by cryptsetup. Unused.
    key: Option<String>,
}

/// Top-level entry: wrap run() and map errors to logs + exit codes.
pub(crate) fn main() {
    if let Err(err) = run() {
        error!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    // Logging depends on the config and the command line, so both are read first and
    // their problems reported once the logger is up.
    let tokens = cmdline::read_cmdline(&args.cmdline);
    let config_path = args.config.clone().unwrap_or_else(CryptkeyConfig::default_path);
    let loaded = CryptkeyConfig::load_or_default(&config_path);

    let debug_flag = tokens
        .as_ref()
        .map(|tokens| cmdline::debug_requested(tokens.as_slice()))
        .unwrap_or(false);
    let verbose = args.verbose
        || debug_flag
        || loaded
            .as_ref()
            .map(|config| config.logging.verbose)
            .unwrap_or(false);
    logging::init(logging::level_for(verbose));

    let tokens = tokens.unwrap_or_else(|err| {
        warn!(
            "failed to read kernel command line {}: {err}",
            args.cmdline.display()
        );
        Vec::new()
    });
    let mut config = settle_config(&config_path, loaded);
    if let Some(timeout) = args.timeout {
        config.keyfile.wait_timeout_secs = timeout;
    }
    for issue in config.validate() {
        warn!("config: {issue}");
    }
    if let Some(key) = &args.key {
        debug!("ignoring crypttab key field {key:?}");
    }

    let loaded_modules = preload_modules(
        &ModprobeLoader::from_config(&config),
        config.modules.preload.as_slice(),
    );
    debug!(
        "{loaded_modules}/{} preload modules ready",
        config.modules.preload.len()
    );

    let configured_label = args.label.as_deref().or(config.prompt.label.as_deref());
    let crypttab_name = env::var(CRYPTTAB_NAME_ENV).ok();
    let crypttab_source = env::var(CRYPTTAB_SOURCE_ENV).ok();
    let label = prompt_label(
        configured_label,
        crypttab_name.as_deref(),
        crypttab_source.as_deref(),
    );

    let retriever = KeyfileRetriever::from_config(&config, SystemMounter::from_config(&config));
    let prompt = SystemPrompt::from_config(&config);
    let acquisition = PassphraseAcquisition::new(retriever, prompt, label);

    let acquired = acquisition
        .acquire(tokens.as_slice())
        .context("no passphrase could be obtained")?;
    match &acquired.source {
        PassphraseSource::Keyfile { device } => {
            info!("passphrase read from key device {}", device.display())
        }
        PassphraseSource::Prompt { reason } => info!("passphrase entered at prompt ({reason})"),
    }

    emit(&acquired.passphrase)
}

/// Report how the configuration was obtained and degrade to defaults on error.
fn settle_config(path: &Path, loaded: CryptkeyResult<CryptkeyConfig>) -> CryptkeyConfig {
    match loaded {
        Ok(config) if config.is_builtin() => {
            info!(
                "no configuration at {}; using built-in defaults",
                path.display()
            );
            config
        }
        Ok(config) => {
            debug!("loaded configuration from {}", path.display());
            config
        }
        Err(err) => {
            error!(
                "failed to load config {}: {err}; continuing with built-in defaults",
                path.display()
            );
            CryptkeyConfig::default()
        }
    }
}

/// Write the passphrase to stdout exactly as obtained. No trailing newline.
fn emit(passphrase: &Passphrase) -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    out.write_all(passphrase.as_bytes())
        .context("failed to write passphrase to stdout")?;
    out.flush().context("failed to flush stdout")
}

#[cfg(test)]
mod tests {
    use super::*;
    use cryptkey_core::CryptkeyError;

    #[test]
    fn cryptsetup_invocation_parses() {
        let args = Args::try_parse_from(["cryptkey-keyscript", "none"]).unwrap();
        assert_eq!(args.key.as_deref(), Some("none"));
        assert_eq!(args.cmdline, PathBuf::from(DEFAULT_CMDLINE_PATH));
        assert!(args.config.is_none());
        assert!(args.timeout.is_none());
        assert!(!args.verbose);
    }

    #[test]
    fn overrides_parse() {
        let args = Args::try_parse_from([
            "cryptkey-keyscript",
            "--config",
            "/etc/cryptkey.yaml",
            "--cmdline",
            "/tmp/cmdline",
            "--timeout",
            "3",
            "--label",
            "Key: ",
            "-v",
        ])
        .unwrap();
        assert_eq!(args.config, Some(PathBuf::from("/etc/cryptkey.yaml")));
        assert_eq!(args.cmdline, PathBuf::from("/tmp/cmdline"));
        assert_eq!(args.timeout, Some(3));
        assert_eq!(args.label.as_deref(), Some("Key: "));
        assert!(args.verbose);
        assert!(args.key.is_none());
    }

    #[test]
    fn broken_config_degrades_to_defaults() {
        let path = Path::new("/etc/cryptkey.toml");

        let mut custom = CryptkeyConfig::default();
        custom.keyfile.wait_timeout_secs = 42;
        custom.path = Some(path.to_path_buf());
        assert_eq!(settle_config(path, Ok(custom)).keyfile.wait_timeout_secs, 42);

        let builtin = settle_config(path, Ok(CryptkeyConfig::default()));
        assert!(builtin.is_builtin());

        let broken = settle_config(path, Err(CryptkeyError::ConfigParse("bad toml".into())));
        assert!(broken.is_builtin());
        assert_eq!(broken.keyfile.wait_timeout_secs, 10);
    }

    #[test]
    fn non_numeric_timeout_is_rejected() {
        assert!(Args::try_parse_from(["cryptkey-keyscript", "--timeout", "soon"]).is_err());
    }
}
