use std::path::Path;

use anyhow::{Context, Error};
use log::{debug, warn};

use crate::dependencies::{Command, Dependency, Executor};

/// What to put on the new filesystem besides its type.
#[derive(Debug, Clone, Copy)]
pub struct MkfsOptions<'a> {
    pub fs_type: &'a str,
    pub label: &'a str,
    pub uuid: &'a str,
    /// Extra options, placed right after the type.
    pub extra: &'a [String],
}

fn is_ext(fs_type: &str) -> bool {
    matches!(fs_type, "ext2" | "ext3" | "ext4")
}

fn is_fat(fs_type: &str) -> bool {
    matches!(fs_type, "vfat" | "fat")
}

fn command(device: &Path, options: &MkfsOptions) -> Command {
    let mut cmd = Dependency::Mkfs.cmd();
    cmd.arg("-t").arg(options.fs_type).args(options.extra);

    if is_fat(options.fs_type) {
        cmd.arg("-n").arg(options.label);
    } else {
        cmd.arg("-L").arg(options.label);
    }

    if is_ext(options.fs_type) {
        cmd.arg("-U").arg(options.uuid);
    } else if options.fs_type == "xfs" {
        cmd.arg("-m").arg(format!("uuid={}", options.uuid));
    } else if is_fat(options.fs_type) {
        // FAT volume ids are 32 bits, written as 8 hex digits.
        let volume_id: String = options
            .uuid
            .chars()
            .filter(char::is_ascii_hexdigit)
            .take(8)
            .collect();
        cmd.arg("-i").arg(volume_id);
    } else {
        warn!(
            "UUID will not be written for fs type [{}]",
            options.fs_type
        );
    }

    if is_ext(options.fs_type) || options.fs_type == "xfs" {
        cmd.arg("-q");
    }

    cmd.arg(device);
    cmd
}

/// Creates a filesystem on `device`.
pub fn run(exec: &dyn Executor, device: impl AsRef<Path>, options: &MkfsOptions) -> Result<(), Error> {
    let cmd = command(device.as_ref(), options);
    debug!("Creating fs command [{}]", cmd.render_command());
    cmd.run_and_check(exec).with_context(|| {
        format!(
            "Failed to create {} filesystem on '{}'",
            options.fs_type,
            device.as_ref().display()
        )
    })
}
