//! Keyfile retrieval from a boot-time key device.

use crate::cmdline::KeySpec;
use crate::config::CryptkeyConfig;
use crate::device::DeviceWaiter;
use crate::mounter::{MountSession, Mounter};
use crate::passphrase::Passphrase;
use log::{error, info, warn};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What happened on the keyfile path. Anything but `Success` falls back to the prompt.
#[derive(Debug)]
pub enum RetrievalOutcome {
    Success(Passphrase),
    DeviceNotFound,
    /// The private mountpoint could not be created.
    MountpointUnavailable,
    MountFailed,
    FileNotFound,
    EmptyFile,
}

impl RetrievalOutcome {
    pub fn kind(&self) -> RetrievalFailure {
        match self {
            RetrievalOutcome::Success(_) => RetrievalFailure::None,
            RetrievalOutcome::DeviceNotFound => RetrievalFailure::DeviceNotFound,
            RetrievalOutcome::MountpointUnavailable => RetrievalFailure::MountpointUnavailable,
            RetrievalOutcome::MountFailed => RetrievalFailure::MountFailed,
            RetrievalOutcome::FileNotFound => RetrievalFailure::FileNotFound,
            RetrievalOutcome::EmptyFile => RetrievalFailure::EmptyFile,
        }
    }
}

/// Payload-free copy of a `RetrievalOutcome`, safe to keep around for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalFailure {
    None,
    DeviceNotFound,
    MountpointUnavailable,
    MountFailed,
    FileNotFound,
    EmptyFile,
}

impl fmt::Display for RetrievalFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RetrievalFailure::None => "no failure",
            RetrievalFailure::DeviceNotFound => "key device not found",
            RetrievalFailure::MountpointUnavailable => "mountpoint could not be created",
            RetrievalFailure::MountFailed => "key device could not be mounted",
            RetrievalFailure::FileNotFound => "keyfile not found on key device",
            RetrievalFailure::EmptyFile => "keyfile is empty",
        };
        f.write_str(text)
    }
}

/// Source of key material for a parsed spec. The orchestrator only sees this trait.
pub trait KeySource {
    fn retrieve(&self, spec: &KeySpec) -> RetrievalOutcome;

    /// Device node the key spec resolves to, for diagnostics.
    fn describe(&self, spec: &KeySpec) -> PathBuf;
}

impl<K: KeySource + ?Sized> KeySource for &K {
    fn retrieve(&self, spec: &KeySpec) -> RetrievalOutcome {
        (**self).retrieve(spec)
    }

    fn describe(&self, spec: &KeySpec) -> PathBuf {
        (**self).describe(spec)
    }
}

/// Waits for the key device, mounts it privately, reads the keyfile, and unmounts.
#[derive(Debug)]
pub struct KeyfileRetriever<M> {
    waiter: DeviceWaiter,
    mounter: M,
    mount_root: PathBuf,
    wait_timeout: Duration,
    strip_trailing_newline: bool,
}

impl<M: Mounter> KeyfileRetriever<M> {
    pub fn new(
        waiter: DeviceWaiter,
        mounter: M,
        mount_root: impl Into<PathBuf>,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            waiter,
            mounter,
            mount_root: mount_root.into(),
            wait_timeout,
            strip_trailing_newline: true,
        }
    }

    pub fn from_config(config: &CryptkeyConfig, mounter: M) -> Self {
        let waiter = DeviceWaiter::new(config.dev_root(), config.poll_interval());
        Self::new(waiter, mounter, config.mount_root(), config.wait_timeout())
            .with_strip_trailing_newline(config.keyfile.strip_trailing_newline)
    }

    pub fn with_strip_trailing_newline(mut self, strip: bool) -> Self {
        self.strip_trailing_newline = strip;
        self
    }

    /// Process-scoped mountpoint so a re-triggered keyscript cannot collide with us.
    pub fn mountpoint(&self) -> PathBuf {
        self.mount_root.join(format!("keydev-{}", std::process::id()))
    }

    /// Run the keyfile path once, waiting at most `wait_timeout` for the device.
    pub fn retrieve_with_timeout(
        &self,
        spec: &KeySpec,
        wait_timeout: Duration,
    ) -> RetrievalOutcome {
        let device = self.waiter.resolve(&spec.device);
        if !self.waiter.wait(&spec.device, wait_timeout) {
            info!(
                "key device {} did not appear at {} within {}s",
                spec.device,
                device.display(),
                wait_timeout.as_secs()
            );
            return RetrievalOutcome::DeviceNotFound;
        }

        let mountpoint = self.mountpoint();
        if let Err(err) = fs::create_dir_all(&mountpoint) {
            error!(
                "failed to create mountpoint {}: {err}",
                mountpoint.display()
            );
            return RetrievalOutcome::MountpointUnavailable;
        }

        let session = match MountSession::establish(&self.mounter, &device, &mountpoint) {
            Ok(session) => session,
            Err(err) => {
                warn!(
                    "could not mount key device {} at {}: {err}",
                    device.display(),
                    mountpoint.display()
                );
                return RetrievalOutcome::MountFailed;
            }
        };

        let outcome = self.read_key(&session.mountpoint().join(&spec.key_path));
        drop(session);
        outcome
    }

    fn read_key(&self, key_path: &Path) -> RetrievalOutcome {
        if !key_path.is_file() {
            info!("keyfile {} not found on key device", key_path.display());
            return RetrievalOutcome::FileNotFound;
        }

        let mut contents = match fs::read(key_path) {
            Ok(contents) => contents,
            Err(err) => {
                warn!("failed to read keyfile {}: {err}", key_path.display());
                return RetrievalOutcome::FileNotFound;
            }
        };

        if self.strip_trailing_newline {
            strip_line_endings(&mut contents);
        }

        if contents.is_empty() {
            warn!(
                "keyfile {} is empty; refusing to use it",
                key_path.display()
            );
            return RetrievalOutcome::EmptyFile;
        }

        info!("read key material from {}", key_path.display());
        RetrievalOutcome::Success(Passphrase::new(contents))
    }
}

impl<M: Mounter> KeySource for KeyfileRetriever<M> {
    fn retrieve(&self, spec: &KeySpec) -> RetrievalOutcome {
        self.retrieve_with_timeout(spec, self.wait_timeout)
    }

    fn describe(&self, spec: &KeySpec) -> PathBuf {
        self.waiter.resolve(&spec.device)
    }
}

/// Drop a single final `\n`, the one an editor or `echo` leaves behind. Any other
/// trailing byte, including `\r` or a second `\n`, is key material.
fn strip_line_endings(contents: &mut Vec<u8>) {
    if contents.last() == Some(&b'\n') {
        contents.pop();
    }
}
