use anyhow::{Context, Error};

use crate::dependencies::{Dependency, Executor};

/// Waits for the udev event queue to drain.
pub fn settle(exec: &dyn Executor) -> Result<(), Error> {
    Dependency::Udevadm
        .cmd()
        .arg("settle")
        .run_and_check(exec)
        .context("Failed settle udev setup")
}
