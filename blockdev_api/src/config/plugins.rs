//! Typed configuration of each plugin kind, deserialized from flat entry bodies.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{
    constants::{DEFAULT_ROOT_LABEL, SHORT_ROOT_LABEL},
    primitives::size::{string_or_number, Bytes, SizeSpec},
};

/// The label `mkfs` actually writes: the default root label does not fit xfs and is shortened.
pub fn filesystem_label<'a>(fs_type: &str, label: &'a str) -> &'a str {
    if fs_type == "xfs" && label == DEFAULT_ROOT_LABEL {
        SHORT_ROOT_LABEL
    } else {
        label
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalLoopConfig {
    pub name: String,

    /// Size of the backing file, defaults to the `image-size` parameter.
    #[serde(default)]
    pub size: Option<Bytes>,

    /// Directory of the backing file, defaults to the `image-dir` parameter.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartitioningConfig {
    pub name: String,
    pub base: String,

    /// Partition table label. Only `mbr` is written.
    pub label: String,

    #[serde(default)]
    pub align: Option<Bytes>,

    #[serde(default)]
    pub partitions: Vec<PartitionConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionFlag {
    Boot,
    Primary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartitionConfig {
    pub name: String,

    #[serde(default)]
    pub base: Option<String>,

    #[serde(default)]
    pub flags: Vec<PartitionFlag>,

    pub size: SizeSpec,

    /// Partition type as a hex string, e.g. `0x83`.
    #[serde(default, rename = "type")]
    pub partition_type: Option<String>,
}

impl PartitionConfig {
    pub fn is_boot(&self) -> bool {
        self.flags.contains(&PartitionFlag::Boot)
    }

    pub fn is_primary(&self) -> bool {
        self.flags.contains(&PartitionFlag::Primary)
    }
}

/// Either one base or a list of bases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BaseRef {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LvmConfig {
    pub name: String,

    /// Set by the tree compiler when `lvm` is nested; ordering comes from the PVs instead.
    #[serde(default)]
    pub base: Option<BaseRef>,

    pub pvs: Vec<PhysicalVolumeConfig>,
    pub vgs: Vec<VolumeGroupConfig>,
    pub lvs: Vec<LogicalVolumeConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhysicalVolumeConfig {
    pub name: String,
    pub base: String,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VolumeGroupConfig {
    pub name: String,
    pub base: Vec<String>,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogicalVolumeConfig {
    pub name: String,
    pub base: String,

    /// Passed verbatim to `lvcreate -L`.
    #[serde(default, deserialize_with = "string_or_number")]
    pub size: Option<String>,

    /// Passed verbatim to `lvcreate -l`.
    #[serde(default, deserialize_with = "string_or_number")]
    pub extents: Option<String>,

    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MkfsConfig {
    pub name: String,
    pub base: String,

    #[serde(rename = "type")]
    pub fs_type: String,

    #[serde(default)]
    pub label: Option<String>,

    /// Extra `mkfs` options, split on whitespace.
    #[serde(default)]
    pub opts: Option<String>,

    #[serde(default)]
    pub uuid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MountConfig {
    pub name: String,
    pub base: String,
    pub mount_point: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FstabConfig {
    pub name: String,
    pub base: String,

    #[serde(default = "default_fstab_options")]
    pub options: String,

    #[serde(default, rename = "dump-freq")]
    pub dump_freq: u32,

    #[serde(default = "default_fsck_passno", rename = "fsck-passno")]
    pub fsck_passno: u32,
}

fn default_fstab_options() -> String {
    "defaults".into()
}

fn default_fsck_passno() -> u32 {
    2
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    #[test]
    fn test_filesystem_label() {
        assert_eq!(filesystem_label("xfs", DEFAULT_ROOT_LABEL), SHORT_ROOT_LABEL);
        assert_eq!(filesystem_label("ext4", DEFAULT_ROOT_LABEL), DEFAULT_ROOT_LABEL);
        assert_eq!(filesystem_label("xfs", "rootfs"), "rootfs");
    }

    #[test]
    fn test_partition_config() {
        let partition: PartitionConfig = serde_yaml::from_str(indoc! {r#"
            name: root
            flags: [boot, primary]
            size: 100%
            type: "0x83"
        "#})
        .unwrap();
        assert!(partition.is_boot());
        assert!(partition.is_primary());
        assert_eq!(partition.size, SizeSpec::Percent(100.0));
        assert_eq!(partition.partition_type.as_deref(), Some("0x83"));

        assert!(serde_yaml::from_str::<PartitionConfig>(indoc! {r#"
            name: root
            flags: [bootable]
            size: 1GiB
        "#})
        .is_err());
    }

    #[test]
    fn test_fstab_defaults() {
        let fstab: FstabConfig = serde_yaml::from_str(indoc! {r#"
            name: fstab_root
            base: mount_root
        "#})
        .unwrap();
        assert_eq!(fstab.options, "defaults");
        assert_eq!(fstab.dump_freq, 0);
        assert_eq!(fstab.fsck_passno, 2);
    }

    #[test]
    fn test_lvm_config() {
        let lvm: LvmConfig = serde_yaml::from_str(indoc! {r#"
            name: lvm
            base: [root]
            pvs:
              - name: pv
                base: root
                options: ["--force"]
            vgs:
              - name: vg
                base: [pv]
            lvs:
              - name: lv_root
                base: vg
                size: 1800M
              - name: lv_data
                base: vg
                extents: 100
        "#})
        .unwrap();
        assert_eq!(lvm.base, Some(BaseRef::Many(vec!["root".into()])));
        assert_eq!(lvm.lvs[0].size.as_deref(), Some("1800M"));
        assert_eq!(lvm.lvs[1].extents.as_deref(), Some("100"));
        assert!(lvm.vgs[0].options.is_empty());
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(serde_yaml::from_str::<MountConfig>(indoc! {r#"
            name: mount_root
            base: root_fs
            mount_point: /
            mountpoint: /
        "#})
        .is_err());
    }
}
