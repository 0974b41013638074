use log::{info, warn};
use uuid::Uuid;

use blockdev_api::{
    config::{
        plugins::{filesystem_label, MkfsConfig},
        ConfigEntry, ConfigError,
    },
    constants::state_keys,
    error::{BlockDeviceError, ExecutionError, ReportError},
    state::FilesystemRecord,
};
use osutils::mkfs::{self, MkfsOptions};

use crate::engine::{registry::Plugin, Edges, GraphContext, Node, NodeContext};

/// Longest label each filesystem type accepts.
fn max_label_length(fs_type: &str) -> Option<usize> {
    match fs_type {
        "ext2" | "ext3" | "ext4" => Some(16),
        "xfs" => Some(12),
        "vfat" | "fat" => Some(11),
        _ => None,
    }
}

pub(crate) struct Mkfs {
    name: String,
    base: String,
    fs_type: String,
    label: String,
    opts: Vec<String>,
    uuid: Option<String>,
}

impl Plugin for Mkfs {
    fn new(entry: &ConfigEntry, ctx: &mut GraphContext) -> Result<Self, BlockDeviceError> {
        let config: MkfsConfig = entry.parse()?;

        let mut label = config.label.unwrap_or_else(|| config.name.clone());
        let written = filesystem_label(&config.fs_type, &label);
        if written != label {
            warn!("Label '{label}' too long for {}, using '{written}'", config.fs_type);
            label = written.into();
        }

        match max_label_length(&config.fs_type) {
            Some(max) if label.len() > max => {
                return Err(ConfigError::LabelTooLong {
                    length: label.len(),
                    label,
                    fs_type: config.fs_type,
                    max,
                }
                .into())
            }
            Some(_) => (),
            None => warn!(
                "Cannot check label length of '{label}' for unknown fs type '{}'",
                config.fs_type
            ),
        }
        ctx.register_label(&label)?;

        Ok(Self {
            opts: config
                .opts
                .as_deref()
                .map(|opts| opts.split_whitespace().map(String::from).collect())
                .unwrap_or_default(),
            name: config.name,
            base: config.base,
            fs_type: config.fs_type,
            label,
            uuid: config.uuid,
        })
    }

    fn into_nodes(self) -> Vec<Box<dyn Node>> {
        vec![Box::new(self)]
    }
}

impl Node for Mkfs {
    fn name(&self) -> &str {
        &self.name
    }

    fn edges(&self, _ctx: &GraphContext) -> Edges {
        Edges::from_base(&self.base)
    }

    fn create(&self, ctx: &mut NodeContext) -> Result<(), BlockDeviceError> {
        let device = ctx.state.device_of(&self.base)?;
        let uuid = self
            .uuid
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        info!(
            "Creating {} filesystem '{}' on '{}'",
            self.fs_type,
            self.label,
            device.display()
        );
        mkfs::run(
            ctx.exec,
            &device,
            &MkfsOptions {
                fs_type: &self.fs_type,
                label: &self.label,
                uuid: &uuid,
                extra: &self.opts,
            },
        )
        .structured(ExecutionError::CreateFilesystem {
            name: self.name.clone(),
        })?;

        ctx.state.insert(
            state_keys::FILESYS,
            &self.name,
            &FilesystemRecord {
                uuid,
                label: self.label.clone(),
                fstype: self.fs_type.clone(),
                opts: self.opts.clone(),
                device,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use blockdev_api::state::{BlockDeviceRecord, SharedState};
    use osutils::testutils::RecordingExecutor;

    use super::*;

    use crate::engine::plugins::test_utils;

    fn label_error(yaml: &str) -> String {
        let root = tempfile::tempdir().unwrap();
        let params = test_utils::params(root.path());
        test_utils::nodes(&params, &[test_utils::entry(yaml)])
            .err()
            .unwrap()
            .kind()
            .to_string()
    }

    #[test]
    fn test_labels() {
        assert_eq!(
            label_error("mkfs: {name: fs, base: root, type: xfs, label: thirteen_char}"),
            "Invalid block device configuration: Label 'thirteen_char' too long for filesystem 'xfs': 13 > 12"
        );
        assert_eq!(
            label_error("mkfs: {name: efi_system_part, base: root, type: vfat}"),
            "Invalid block device configuration: Label 'efi_system_part' too long for filesystem 'vfat': 15 > 11"
        );

        let root = tempfile::tempdir().unwrap();
        let params = test_utils::params(root.path());
        let err = test_utils::nodes(
            &params,
            &[
                test_utils::entry("mkfs: {name: fs1, base: root, type: ext4, label: data}"),
                test_utils::entry("mkfs: {name: fs2, base: root, type: ext4, label: data}"),
            ],
        )
        .err()
        .unwrap();
        assert_eq!(
            err.kind().to_string(),
            "Invalid block device configuration: File system label 'data' used more than once"
        );

        // Unknown types are not checked.
        test_utils::nodes(
            &params,
            &[test_utils::entry(
                "mkfs: {name: fs, base: root, type: btrfs, label: a_very_long_btrfs_label}",
            )],
        )
        .unwrap();
    }

    #[test]
    fn test_create_records_filesystem() {
        let root = tempfile::tempdir().unwrap();
        let params = test_utils::params(root.path());
        let (ctx, nodes) = test_utils::nodes(
            &params,
            &[test_utils::entry(
                "mkfs: {name: mkfs_root, base: root, type: xfs, label: cloudimg-rootfs, opts: '-i size=512'}",
            )],
        )
        .unwrap();
        assert_eq!(nodes[0].edges(&ctx), Edges::from_base("root"));

        let mut state = SharedState::new();
        state
            .insert(
                state_keys::BLOCKDEV,
                "root",
                &BlockDeviceRecord {
                    device: "/dev/mapper/loop0p1".into(),
                    image: None,
                },
            )
            .unwrap();
        let exec = RecordingExecutor::new();
        let rollback = test_utils::create(nodes[0].as_ref(), &params, &mut state, &exec).unwrap();
        assert!(rollback.is_empty());

        let record: FilesystemRecord = state.get(state_keys::FILESYS, "mkfs_root").unwrap();
        assert_eq!(record.label, "img-rootfs");
        assert_eq!(record.fstype, "xfs");
        assert_eq!(record.opts, vec!["-i", "size=512"]);
        assert!(Uuid::parse_str(&record.uuid).is_ok());
        assert_eq!(
            exec.calls(),
            vec![format!(
                "mkfs -t xfs -i size=512 -L img-rootfs -m uuid={} -q /dev/mapper/loop0p1",
                record.uuid
            )]
        );
    }

    #[test]
    fn test_fixed_uuid() {
        let root = tempfile::tempdir().unwrap();
        let params = test_utils::params(root.path());
        let (_, nodes) = test_utils::nodes(
            &params,
            &[test_utils::entry(
                "mkfs: {name: fs_boot, base: boot, type: vfat, label: EFI, uuid: 1234abcd-0000-4000-8000-000000000000}",
            )],
        )
        .unwrap();

        let mut state = SharedState::new();
        state
            .insert(
                state_keys::BLOCKDEV,
                "boot",
                &BlockDeviceRecord {
                    device: "/dev/loop1".into(),
                    image: None,
                },
            )
            .unwrap();
        let exec = RecordingExecutor::new().fail_on("mkfs");
        let err = test_utils::create(nodes[0].as_ref(), &params, &mut state, &exec).unwrap_err();
        assert_eq!(err.kind().to_string(), "Failed to create filesystem 'fs_boot'");
        assert_eq!(
            exec.calls(),
            vec!["mkfs -t vfat -n EFI -i 1234abcd /dev/loop1"]
        );
        assert!(!state.contains(state_keys::FILESYS, "fs_boot"));
    }
}
