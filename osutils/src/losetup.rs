use std::{
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use anyhow::{bail, Context, Error};
use log::{debug, error};

use crate::dependencies::{Dependency, Executor};

/// How often detaching a busy loop device is tried before giving up.
const DETACH_ATTEMPTS: u32 = 10;
const DETACH_DELAY: Duration = Duration::from_secs(1);

/// Attaches `image` to the first free loop device and returns the device path.
pub fn attach(exec: &dyn Executor, image: impl AsRef<Path>) -> Result<PathBuf, Error> {
    let output = Dependency::Losetup
        .cmd()
        .arg("--show")
        .arg("-f")
        .arg(image.as_ref())
        .output_and_check(exec)
        .with_context(|| {
            format!(
                "Failed to attach '{}' to a loop device",
                image.as_ref().display()
            )
        })?;

    let device = output.trim();
    if device.is_empty() {
        bail!(
            "losetup printed no device for '{}'",
            image.as_ref().display()
        );
    }
    debug!(
        "Attached '{}' to loop device '{device}'",
        image.as_ref().display()
    );
    Ok(PathBuf::from(device))
}

/// Detaches a loop device. Busy devices are retried for a while, since udev or a lingering
/// mapping can hold them briefly after an unmount.
pub fn detach(exec: &dyn Executor, device: impl AsRef<Path>) -> Result<(), Error> {
    detach_with_retries(exec, device.as_ref(), DETACH_ATTEMPTS, DETACH_DELAY)
}

fn detach_with_retries(
    exec: &dyn Executor,
    device: &Path,
    attempts: u32,
    delay: Duration,
) -> Result<(), Error> {
    let mut attempt = 1;
    loop {
        match Dependency::Losetup
            .cmd()
            .arg("-d")
            .arg(device)
            .run_and_check(exec)
        {
            Ok(()) => return Ok(()),
            Err(e) if attempt >= attempts => {
                error!(
                    "Giving up detaching loop device '{}' after {attempts} attempts",
                    device.display()
                );
                return Err(e).with_context(|| {
                    format!("Failed to detach loop device '{}'", device.display())
                });
            }
            Err(e) => {
                debug!(
                    "Detaching '{}' failed (attempt {attempt}/{attempts}): {e}",
                    device.display()
                );
                attempt += 1;
                thread::sleep(delay);
            }
        }
    }
}
