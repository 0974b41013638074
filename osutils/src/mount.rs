use std::path::Path;

use anyhow::{Context, Error};
use log::debug;

use crate::dependencies::{Dependency, Executor};

/// Mounts `device` on `mount_dir`, which must exist.
pub fn mount(
    exec: &dyn Executor,
    device: impl AsRef<Path>,
    mount_dir: impl AsRef<Path>,
) -> Result<(), Error> {
    Dependency::Mount
        .cmd()
        .arg(device.as_ref())
        .arg(mount_dir.as_ref())
        .run_and_check(exec)
        .with_context(|| {
            format!(
                "Failed to mount {} to path {}",
                device.as_ref().display(),
                mount_dir.as_ref().display(),
            )
        })
}

/// Unmounts given directory mount_dir.
pub fn umount(exec: &dyn Executor, mount_dir: impl AsRef<Path>) -> Result<(), Error> {
    Dependency::Umount
        .cmd()
        .arg(mount_dir.as_ref())
        .run_and_check(exec)
        .with_context(|| {
            format!(
                "Failed to unmount directory {}",
                mount_dir.as_ref().display()
            )
        })
}

/// Discards unused blocks of the filesystem mounted at `mount_dir`, so the image stays sparse.
pub fn fstrim(exec: &dyn Executor, mount_dir: impl AsRef<Path>) -> Result<(), Error> {
    let output = Dependency::Fstrim
        .cmd()
        .arg("--verbose")
        .arg(mount_dir.as_ref())
        .output_and_check(exec)
        .with_context(|| format!("Failed to trim {}", mount_dir.as_ref().display()))?;
    debug!("fstrim: {}", output.trim());
    Ok(())
}
