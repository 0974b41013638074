use std::path::Path;

use anyhow::{Context, Error};

use crate::dependencies::{Dependency, Executor};

/// Asks the kernel to re-read the partition table of `device`.
pub fn run(exec: &dyn Executor, device: impl AsRef<Path>) -> Result<(), Error> {
    Dependency::Partprobe
        .cmd()
        .arg(device.as_ref())
        .run_and_check(exec)
        .with_context(|| format!("Failed to probe partitions of '{}'", device.as_ref().display()))
}
