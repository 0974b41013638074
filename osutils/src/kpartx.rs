use std::path::Path;

use anyhow::{Context, Error};

use crate::dependencies::{Dependency, Executor};

/// Creates device-mapper nodes for the partitions of `device`. With `sync`, waits for udev to
/// create the nodes before returning.
pub fn add(exec: &dyn Executor, device: impl AsRef<Path>, sync: bool) -> Result<(), Error> {
    Dependency::Kpartx
        .cmd()
        .arg(if sync { "-avs" } else { "-av" })
        .arg(device.as_ref())
        .run_and_check(exec)
        .with_context(|| {
            format!(
                "Failed to map partitions of '{}'",
                device.as_ref().display()
            )
        })
}

/// Removes the device-mapper nodes of the partitions of `device`.
pub fn delete(exec: &dyn Executor, device: impl AsRef<Path>) -> Result<(), Error> {
    Dependency::Kpartx
        .cmd()
        .arg("-d")
        .arg(device.as_ref())
        .run_and_check(exec)
        .with_context(|| {
            format!(
                "Failed to remove partition mappings of '{}'",
                device.as_ref().display()
            )
        })
}

/// Creates the `/dev/mapper` nodes without waiting on udev, which is absent in containers.
pub fn mknodes(exec: &dyn Executor) -> Result<(), Error> {
    Dependency::Dmsetup
        .cmd()
        .arg("--noudevsync")
        .arg("mknodes")
        .run_and_check(exec)
        .context("Failed to create device-mapper nodes")
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testutils::RecordingExecutor;

    #[test]
    fn test_commands() {
        let exec = RecordingExecutor::new();
        add(&exec, "/dev/loop0", true).unwrap();
        add(&exec, "/dev/loop0", false).unwrap();
        mknodes(&exec).unwrap();
        delete(&exec, "/dev/loop0").unwrap();
        assert_eq!(
            exec.calls(),
            vec![
                "kpartx -avs /dev/loop0",
                "kpartx -av /dev/loop0",
                "dmsetup --noudevsync mknodes",
                "kpartx -d /dev/loop0",
            ]
        );
    }

    #[test]
    fn test_failure_context() {
        let exec = RecordingExecutor::new().fail_on("kpartx");
        let err = delete(&exec, "/dev/loop0").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to remove partition mappings of '/dev/loop0'"
        );
    }
}
