//! Key device references and the bounded wait for their device nodes.

use log::{debug, info};
use std::fmt;
use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

pub const DEFAULT_DEV_ROOT: &str = "/dev";

/// How the command line names the key device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceReference {
    ByUuid(String),
    ByLabel(String),
    ByPath(String),
}

impl DeviceReference {
    /// The raw identifier, without the `UUID=`/`LABEL=` prefix.
    pub fn identifier(&self) -> &str {
        match self {
            DeviceReference::ByUuid(value)
            | DeviceReference::ByLabel(value)
            | DeviceReference::ByPath(value) => value,
        }
    }

    /// Map the reference onto the device node udev maintains under `dev_root`.
    pub fn resolve(&self, dev_root: &Path) -> PathBuf {
        match self {
            DeviceReference::ByUuid(uuid) => dev_root.join("disk/by-uuid").join(uuid),
            DeviceReference::ByLabel(label) => {
                dev_root.join("disk/by-label").join(encode_devnode_name(label))
            }
            DeviceReference::ByPath(path) => {
                if let Some(rest) = path.strip_prefix("/dev/") {
                    dev_root.join(rest)
                } else if path.starts_with('/') {
                    PathBuf::from(path)
                } else {
                    dev_root.join(path)
                }
            }
        }
    }
}

impl fmt::Display for DeviceReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceReference::ByUuid(uuid) => write!(f, "UUID={uuid}"),
            DeviceReference::ByLabel(label) => write!(f, "LABEL={label}"),
            DeviceReference::ByPath(path) => f.write_str(path),
        }
    }
}

/// Escape a label the way udev names its `by-label` symlinks.
///
/// Plain ASCII from a small whitelist and valid multibyte UTF-8 pass through; every
/// other byte becomes `\xNN`.
fn encode_devnode_name(name: &str) -> String {
    let mut encoded = String::with_capacity(name.len());
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() || "#+-.:=@_".contains(ch) || !ch.is_ascii() {
            encoded.push(ch);
        } else {
            encoded.push_str(&format!("\\x{:02x}", ch as u32));
        }
    }
    encoded
}

/// Presence check for a device node.
pub type DeviceProbe = fn(&Path) -> bool;

/// True when `path` (after following symlinks) is a block device.
pub fn is_block_device(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.file_type().is_block_device())
        .unwrap_or(false)
}

/// Polls for a key device until it appears or the timeout runs out.
#[derive(Clone)]
pub struct DeviceWaiter {
    dev_root: PathBuf,
    poll_interval: Duration,
    probe: DeviceProbe,
}

impl DeviceWaiter {
    pub fn new(dev_root: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            dev_root: dev_root.into(),
            poll_interval,
            probe: is_block_device,
        }
    }

    /// Replace the block-device check, e.g. to accept plain files in tests.
    pub fn with_probe(mut self, probe: DeviceProbe) -> Self {
        self.probe = probe;
        self
    }

    pub fn dev_root(&self) -> &Path {
        &self.dev_root
    }

    pub fn resolve(&self, device: &DeviceReference) -> PathBuf {
        device.resolve(&self.dev_root)
    }

    /// Wait up to `timeout` for `device` to show up. Returns as soon as it does.
    ///
    /// A timeout too large to represent as a deadline waits until the device appears.
    pub fn wait(&self, device: &DeviceReference, timeout: Duration) -> bool {
        let path = self.resolve(device);
        let deadline = Instant::now().checked_add(timeout);
        let mut announced = false;

        loop {
            if (self.probe)(&path) {
                debug!("key device {} present at {}", device, path.display());
                return true;
            }

            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    self.poll_interval.min(deadline - now)
                }
                None => self.poll_interval,
            };

            if !announced {
                info!(
                    "waiting up to {}s for key device {} ({})",
                    timeout.as_secs(),
                    device,
                    path.display()
                );
                announced = true;
            }
            thread::sleep(pause);
        }
    }
}

impl fmt::Debug for DeviceWaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceWaiter")
            .field("dev_root", &self.dev_root)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl Default for DeviceWaiter {
    fn default() -> Self {
        Self::new(DEFAULT_DEV_ROOT, Duration::from_millis(100))
    }
}
