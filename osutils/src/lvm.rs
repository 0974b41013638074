//! Wrappers over the LVM2 command line tools.

use std::path::Path;

use anyhow::{Context, Error};

use crate::dependencies::{Dependency, Executor};

/// How a logical volume is sized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LvSize<'a> {
    /// Passed to `-L`, e.g. `1800M`.
    Size(&'a str),
    /// Passed to `-l`, e.g. `100%FREE`.
    Extents(&'a str),
}

pub fn pvcreate(exec: &dyn Executor, device: &Path, options: &[String]) -> Result<(), Error> {
    Dependency::Pvcreate
        .cmd()
        .arg(device)
        .args(options)
        .run_and_check(exec)
        .with_context(|| format!("Failed to create physical volume on '{}'", device.display()))
}

pub fn vgcreate(
    exec: &dyn Executor,
    name: &str,
    devices: &[impl AsRef<Path>],
    options: &[String],
) -> Result<(), Error> {
    Dependency::Vgcreate
        .cmd()
        .arg(name)
        .args(devices.iter().map(|d| AsRef::<Path>::as_ref(d)))
        .args(options)
        .run_and_check(exec)
        .with_context(|| format!("Failed to create volume group '{name}'"))
}

pub fn lvcreate(
    exec: &dyn Executor,
    name: &str,
    volume_group: &str,
    size: LvSize,
    options: &[String],
) -> Result<(), Error> {
    let mut cmd = Dependency::Lvcreate.cmd();
    cmd.arg("--name").arg(name);
    match size {
        LvSize::Size(size) => cmd.arg("-L").arg(size),
        LvSize::Extents(extents) => cmd.arg("-l").arg(extents),
    };
    cmd.args(options)
        .arg(volume_group)
        .run_and_check(exec)
        .with_context(|| format!("Failed to create logical volume '{volume_group}/{name}'"))
}

/// Deactivates one logical volume.
pub fn deactivate_lv(exec: &dyn Executor, volume_group: &str, name: &str) -> Result<(), Error> {
    Dependency::Lvchange
        .cmd()
        .arg("-an")
        .arg(format!("/dev/{volume_group}/{name}"))
        .run_and_check(exec)
        .with_context(|| format!("Failed to deactivate logical volume '{volume_group}/{name}'"))
}

/// Deactivates every logical volume of a volume group.
pub fn deactivate_vg(exec: &dyn Executor, name: &str) -> Result<(), Error> {
    Dependency::Vgchange
        .cmd()
        .arg("-an")
        .arg(name)
        .run_and_check(exec)
        .with_context(|| format!("Failed to deactivate volume group '{name}'"))
}

/// Refreshes the LVM metadata cache after devices went away.
pub fn pvscan_cache(exec: &dyn Executor) -> Result<(), Error> {
    Dependency::Pvscan
        .cmd()
        .arg("--cache")
        .run_and_check(exec)
        .context("Failed to refresh the physical volume cache")
}
