//! Mount/unmount collaborator and the scoped session that guarantees cleanup.

use crate::command;
use crate::config::CryptkeyConfig;
use crate::error::{CryptkeyError, CryptkeyResult};
use crate::mounts::{is_mountpoint_busy, mount_table_path};
use log::{debug, info, warn};
use std::ffi::OsStr;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Abstraction over the mount syscalls. Filesystem type is always auto-detected.
pub trait Mounter {
    fn mount(&self, device: &Path, mountpoint: &Path) -> CryptkeyResult<()>;

    fn unmount(&self, mountpoint: &Path) -> CryptkeyResult<()>;
}

impl<M: Mounter + ?Sized> Mounter for &M {
    fn mount(&self, device: &Path, mountpoint: &Path) -> CryptkeyResult<()> {
        (**self).mount(device, mountpoint)
    }

    fn unmount(&self, mountpoint: &Path) -> CryptkeyResult<()> {
        (**self).unmount(mountpoint)
    }
}

/// Mounter backed by the host `mount`/`umount` binaries.
#[derive(Debug, Clone)]
pub struct SystemMounter {
    mount_binary: PathBuf,
    umount_binary: PathBuf,
    options: String,
    mount_table: PathBuf,
}

impl SystemMounter {
    pub fn new(
        mount_binary: impl Into<PathBuf>,
        umount_binary: impl Into<PathBuf>,
        options: impl Into<String>,
    ) -> Self {
        Self {
            mount_binary: mount_binary.into(),
            umount_binary: umount_binary.into(),
            options: options.into(),
            mount_table: mount_table_path(),
        }
    }

    pub fn from_config(config: &CryptkeyConfig) -> Self {
        Self::new(
            &config.system.mount_path,
            &config.system.umount_path,
            config.keyfile.mount_options.clone(),
        )
    }

    /// Consult `table` instead of `/proc/mounts` before mounting.
    pub fn with_mount_table(mut self, table: impl Into<PathBuf>) -> Self {
        self.mount_table = table.into();
        self
    }
}

impl Mounter for SystemMounter {
    fn mount(&self, device: &Path, mountpoint: &Path) -> CryptkeyResult<()> {
        match is_mountpoint_busy(&self.mount_table, mountpoint) {
            Ok(true) => {
                return Err(CryptkeyError::Mount(format!(
                    "{} is already a mountpoint; refusing to mount {} over it",
                    mountpoint.display(),
                    device.display()
                )))
            }
            Ok(false) => {}
            Err(err) => debug!(
                "mount table {} unreadable ({err}); skipping busy check",
                self.mount_table.display()
            ),
        }

        let mut args: Vec<&OsStr> = Vec::new();
        if !self.options.trim().is_empty() {
            args.push(OsStr::new("-o"));
            args.push(OsStr::new(&self.options));
        }
        args.push(device.as_os_str());
        args.push(mountpoint.as_os_str());

        let out = command::run(self.mount_binary.as_os_str(), args).map_err(|err| {
            CryptkeyError::Mount(format!(
                "failed to run {}: {err}",
                self.mount_binary.display()
            ))
        })?;
        if !out.success() {
            return Err(CryptkeyError::Mount(format!(
                "mount {} at {}: {}",
                device.display(),
                mountpoint.display(),
                out.diagnostic()
            )));
        }
        Ok(())
    }

    fn unmount(&self, mountpoint: &Path) -> CryptkeyResult<()> {
        let out = command::run(self.umount_binary.as_os_str(), [mountpoint]).map_err(|err| {
            CryptkeyError::Unmount(format!(
                "failed to run {}: {err}",
                self.umount_binary.display()
            ))
        })?;
        if !out.success() {
            return Err(CryptkeyError::Unmount(format!(
                "umount {}: {}",
                mountpoint.display(),
                out.diagnostic()
            )));
        }
        Ok(())
    }
}

/// A mount that is torn down when dropped.
///
/// Unmount errors are logged and swallowed. The mountpoint directory is removed
/// afterwards when possible.
pub struct MountSession<'a, M: Mounter + ?Sized> {
    mounter: &'a M,
    device: PathBuf,
    mountpoint: PathBuf,
}

impl<'a, M: Mounter + ?Sized> MountSession<'a, M> {
    /// Mount `device` at `mountpoint`. On failure the mountpoint directory is removed.
    pub fn establish(mounter: &'a M, device: &Path, mountpoint: &Path) -> CryptkeyResult<Self> {
        if let Err(err) = mounter.mount(device, mountpoint) {
            remove_mountpoint(mountpoint);
            return Err(err);
        }
        info!(
            "mounted key device {} at {}",
            device.display(),
            mountpoint.display()
        );
        Ok(Self {
            mounter,
            device: device.to_path_buf(),
            mountpoint: mountpoint.to_path_buf(),
        })
    }

    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }
}

impl<M: Mounter + ?Sized> Drop for MountSession<'_, M> {
    fn drop(&mut self) {
        match self.mounter.unmount(&self.mountpoint) {
            Ok(()) => debug!(
                "unmounted key device {} from {}",
                self.device.display(),
                self.mountpoint.display()
            ),
            Err(err) => warn!(
                "failed to unmount key device {} from {}: {err}",
                self.device.display(),
                self.mountpoint.display()
            ),
        }
        remove_mountpoint(&self.mountpoint);
    }
}

fn remove_mountpoint(mountpoint: &Path) {
    if let Err(err) = fs::remove_dir(mountpoint) {
        if err.kind() != ErrorKind::NotFound {
            debug!(
                "unable to remove mountpoint {}: {err}",
                mountpoint.display()
            );
        }
    }
}
