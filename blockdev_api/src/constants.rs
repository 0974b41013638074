/// Path of the root mount point.
pub const ROOT_MOUNT_POINT: &str = "/";

/// Conventional name of the root filesystem entry in the default layout.
pub const ROOT_FILESYSTEM_NAME: &str = "mkfs_root";

/// Name of the loop image in the default layout, used by `getval`.
pub const IMAGE_NAME: &str = "image0";

/// Root filesystem type used when neither the entry nor the parameter file sets one.
pub const DEFAULT_ROOT_FS_TYPE: &str = "ext4";

/// Root label used when neither the entry nor the parameter file sets one.
pub const DEFAULT_ROOT_LABEL: &str = "cloudimg-rootfs";

/// Replacement for [`DEFAULT_ROOT_LABEL`] on filesystems with short labels.
pub const SHORT_ROOT_LABEL: &str = "img-rootfs";

/// Alignment of partitions when the config sets none.
pub const DEFAULT_PARTITION_ALIGNMENT: &str = "1MiB";

/// Partition type byte used when a partition does not set one (Linux).
pub const DEFAULT_PARTITION_TYPE: u8 = 0x83;

/// Layout used when the parameter file names no block device configuration.
pub const DEFAULT_CONFIG: &str = r#"
- local_loop:
    name: image0

- mkfs:
    name: mkfs_root
    base: image0
    mount:
      mount_point: /
      fstab:
        options: "defaults"
        fsck-passno: 1
"#;

/// Location of the state directory below the build directory.
pub const STATE_DIR_RELATIVE_PATH: &str = "states/block-device";

/// Location of the installed fstab below the build directory.
pub const BUILT_ETC_RELATIVE_PATH: &str = "built/etc";

/// Environment variable naming a file to dump the graph to, in dot format.
pub const DUMP_GRAPH_ENV: &str = "BLOCK_DEVICE_DUMP_GRAPH";

/// Environment variable holding the parameter file path when `--params` is absent.
pub const PARAMS_ENV: &str = "BLOCK_DEVICE_PARAMS_YAML";

/// Namespaces of the shared state.
pub mod state_keys {
    pub const BLOCKDEV: &str = "blockdev";
    pub const FILESYS: &str = "filesys";
    pub const MOUNT: &str = "mount";
    pub const MOUNT_ORDER: &str = "mount_order";
    pub const FSTAB: &str = "fstab";
    pub const PVS: &str = "pvs";
    pub const VGS: &str = "vgs";
}
