//! MBR partitioning of a loop image. Contributes one node per partition; all of them share one
//! table, which is written by whichever node runs first.

use std::{
    cell::Cell,
    path::{Path, PathBuf},
    rc::Rc,
    str::FromStr,
};

use log::{debug, info};

use blockdev_api::{
    config::{
        plugins::{PartitionConfig, PartitioningConfig},
        ConfigEntry, ConfigError,
    },
    constants::{state_keys, DEFAULT_PARTITION_ALIGNMENT, DEFAULT_PARTITION_TYPE},
    error::{BlockDeviceError, ExecutionError, ReportError, StateError},
    primitives::size::{Bytes, SizeSpec},
    state::BlockDeviceRecord,
};
use osutils::{container, dependencies::Executor, kpartx, mbr::Mbr, partprobe, udevadm};

use crate::engine::{
    registry::Plugin,
    rollback::{RollbackStack, UndoAction},
    Edges, GraphContext, Node, NodeContext, TeardownContext,
};

struct Partition {
    name: String,
    primary: bool,
    boot: bool,
    size: SizeSpec,
    partition_type: u8,
}

struct PartitionTable {
    base: String,
    alignment: u64,
    partitions: Vec<Partition>,
    created: Cell<bool>,
    unmapped: Cell<bool>,
}

pub(crate) struct Partitioning {
    table: Rc<PartitionTable>,
}

fn parse_partition_type(value: Option<&str>) -> Result<u8, ConfigError> {
    let Some(value) = value else {
        return Ok(DEFAULT_PARTITION_TYPE);
    };
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u8::from_str_radix(digits, 16).map_err(|_| ConfigError::InvalidPartitionType(value.into()))
}

impl Partition {
    fn from_config(config: PartitionConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            partition_type: parse_partition_type(config.partition_type.as_deref())?,
            primary: config.is_primary(),
            boot: config.is_boot(),
            size: config.size,
            name: config.name,
        })
    }
}

impl Plugin for Partitioning {
    fn new(entry: &ConfigEntry, _ctx: &mut GraphContext) -> Result<Self, BlockDeviceError> {
        let config: PartitioningConfig = entry.parse()?;
        if config.label != "mbr" {
            return Err(ConfigError::UnsupportedLabel(config.label).into());
        }

        let alignment = match config.align {
            Some(align) => align,
            None => Bytes::from_str(DEFAULT_PARTITION_ALIGNMENT).map_err(|e| {
                ConfigError::InvalidSize {
                    value: DEFAULT_PARTITION_ALIGNMENT.into(),
                    reason: e.to_string(),
                }
            })?,
        };

        let partitions = config
            .partitions
            .into_iter()
            .map(Partition::from_config)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            table: Rc::new(PartitionTable {
                base: config.base,
                alignment: alignment.bytes(),
                partitions,
                created: Cell::new(false),
                unmapped: Cell::new(false),
            }),
        })
    }

    fn into_nodes(self) -> Vec<Box<dyn Node>> {
        (0..self.table.partitions.len())
            .map(|index| {
                Box::new(PartitionNode {
                    table: self.table.clone(),
                    index,
                }) as Box<dyn Node>
            })
            .collect()
    }
}

impl PartitionTable {
    /// Writes the table and makes the partitions visible. Runs once per table.
    fn create(&self, ctx: &mut NodeContext) -> Result<(), BlockDeviceError> {
        if self.created.replace(true) {
            debug!("Partitions of '{}' already created", self.base);
            return Ok(());
        }

        let base: BlockDeviceRecord = ctx.state.get(state_keys::BLOCKDEV, &self.base)?;
        let image = base.image.structured(StateError::MissingKey {
            namespace: state_keys::BLOCKDEV.into(),
            key: format!("{}.image", self.base),
        })?;
        let write_error = || ExecutionError::WritePartitionTable {
            path: image.display().to_string(),
        };

        let disk_size = std::fs::metadata(&image).structured(write_error())?.len();
        let mut mbr = Mbr::open(&image, disk_size, self.alignment).structured(write_error())?;

        let loop_name = base
            .device
            .file_name()
            .structured(write_error())?
            .to_string_lossy()
            .into_owned();
        let mut devices = Vec::with_capacity(self.partitions.len());
        for partition in &self.partitions {
            let size = partition.size.resolve(mbr.free());
            let number = mbr
                .add_partition(
                    partition.primary,
                    partition.boot,
                    size,
                    partition.partition_type,
                )
                .structured(write_error())?;

            let device = PathBuf::from(format!("/dev/mapper/{loop_name}p{number}"));
            info!(
                "Partition '{}' is number {number} ({size} bytes), device '{}'",
                partition.name,
                device.display()
            );
            ctx.state.insert(
                state_keys::BLOCKDEV,
                &partition.name,
                &BlockDeviceRecord {
                    device: device.clone(),
                    image: None,
                },
            )?;
            devices.push(device);
        }
        mbr.close().structured(write_error())?;

        notify(ctx.exec, &base.device, &devices, ctx.rollback).structured(
            ExecutionError::MapPartitions {
                device: base.device.display().to_string(),
            },
        )
    }

    fn unmap(&self, ctx: &TeardownContext) -> Result<(), BlockDeviceError> {
        if self.unmapped.replace(true) {
            return Ok(());
        }
        let device = ctx.state.device_of(&self.base)?;
        kpartx::delete(ctx.exec, &device).structured(ExecutionError::UnmapPartitions {
            device: device.display().to_string(),
        })
    }
}

/// Gets the kernel to expose the new partitions. udev may already have done it after partprobe;
/// otherwise kpartx creates the mappings, and inside a container the nodes are made by hand.
fn notify(
    exec: &dyn Executor,
    device: &Path,
    partitions: &[PathBuf],
    rollback: &mut RollbackStack,
) -> Result<(), anyhow::Error> {
    if let Err(e) = partprobe::run(exec, device) {
        debug!("Ignoring partprobe failure: {e:?}");
    }
    if let Err(e) = udevadm::settle(exec) {
        debug!("Ignoring udevadm failure: {e:?}");
    }

    if partitions.iter().all(|p| p.exists()) {
        debug!("All partitions of '{}' visible", device.display());
        return Ok(());
    }

    let in_container = container::is_running_in_container();
    kpartx::add(exec, device, !in_container)?;
    rollback.push(UndoAction::RemovePartitionMappings {
        device: device.into(),
    });
    if in_container {
        kpartx::mknodes(exec)?;
    }
    Ok(())
}

struct PartitionNode {
    table: Rc<PartitionTable>,
    index: usize,
}

impl Node for PartitionNode {
    fn name(&self) -> &str {
        &self.table.partitions[self.index].name
    }

    fn edges(&self, _ctx: &GraphContext) -> Edges {
        let mut edges = Edges::from_base(&self.table.base);
        if let Some(previous) = self.index.checked_sub(1) {
            edges
                .incoming
                .push(self.table.partitions[previous].name.clone());
        }
        edges
    }

    fn create(&self, ctx: &mut NodeContext) -> Result<(), BlockDeviceError> {
        self.table.create(ctx)
    }

    fn cleanup(&self, ctx: &TeardownContext) -> Result<(), BlockDeviceError> {
        self.table.unmap(ctx)
    }

    fn delete(&self, ctx: &TeardownContext) -> Result<(), BlockDeviceError> {
        self.table.unmap(ctx)
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use blockdev_api::state::SharedState;
    use osutils::testutils::RecordingExecutor;

    use super::*;

    use crate::engine::plugins::test_utils;

    const TABLE: &str = indoc! {r#"
        partitioning:
          name: mbr
          base: image0
          label: mbr
          partitions:
            - name: root
              flags: [boot, primary]
              size: 50%
            - name: data
              size: 100%
              type: "0x8e"
    "#};

    fn loop_state(image: &Path) -> SharedState {
        let mut state = SharedState::new();
        state
            .insert(
                state_keys::BLOCKDEV,
                "image0",
                &BlockDeviceRecord {
                    device: "/dev/loop0".into(),
                    image: Some(image.into()),
                },
            )
            .unwrap();
        state
    }

    #[test]
    fn test_edges() {
        let root = tempfile::tempdir().unwrap();
        let params = test_utils::params(root.path());
        let (ctx, nodes) = test_utils::nodes(&params, &[test_utils::entry(TABLE)]).unwrap();

        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].edges(&ctx), Edges::from_base("image0"));
        assert_eq!(
            nodes[1].edges(&ctx).incoming,
            vec!["image0".to_string(), "root".to_string()]
        );
    }

    #[test]
    fn test_invalid_tables() {
        let root = tempfile::tempdir().unwrap();
        let params = test_utils::params(root.path());

        let err = test_utils::nodes(
            &params,
            &[test_utils::entry(
                "partitioning: {name: gpt, base: image0, label: gpt, partitions: []}",
            )],
        )
        .err()
        .unwrap();
        assert_eq!(
            err.kind().to_string(),
            "Invalid block device configuration: Unsupported partition table label 'gpt', only 'mbr' is supported"
        );

        let err = test_utils::nodes(
            &params,
            &[test_utils::entry(indoc! {r#"
                partitioning:
                  name: mbr
                  base: image0
                  label: mbr
                  partitions:
                    - name: root
                      size: 100%
                      type: linux
            "#})],
        )
        .err()
        .unwrap();
        assert_eq!(
            err.kind().to_string(),
            "Invalid block device configuration: Invalid partition type 'linux'"
        );
    }

    #[test]
    fn test_partition_type() {
        assert_eq!(parse_partition_type(None), Ok(0x83));
        assert_eq!(parse_partition_type(Some("0x8e")), Ok(0x8e));
        assert_eq!(parse_partition_type(Some("ef")), Ok(0xef));
        assert!(parse_partition_type(Some("0x100")).is_err());
    }

    #[test]
    fn test_create_once_for_all_partitions() {
        let root = tempfile::tempdir().unwrap();
        let params = test_utils::params(root.path());
        let image = root.path().join("image0.raw");
        osutils::files::create_sparse_file(&image, 64 << 20).unwrap();

        let (_, nodes) = test_utils::nodes(&params, &[test_utils::entry(TABLE)]).unwrap();
        let exec = RecordingExecutor::new();
        let mut state = loop_state(&image);

        let first = test_utils::create(nodes[0].as_ref(), &params, &mut state, &exec).unwrap();
        let calls = exec.calls();
        let second = test_utils::create(nodes[1].as_ref(), &params, &mut state, &exec).unwrap();

        // The second node found the table already written.
        assert_eq!(exec.calls(), calls);
        assert!(second.is_empty());

        let mut expected = vec!["partprobe /dev/loop0", "udevadm settle"];
        if container::is_running_in_container() {
            expected.extend(["kpartx -av /dev/loop0", "dmsetup --noudevsync mknodes"]);
        } else {
            expected.push("kpartx -avs /dev/loop0");
        }
        assert_eq!(calls, expected);
        assert_eq!(
            first.actions(),
            &[UndoAction::RemovePartitionMappings {
                device: "/dev/loop0".into()
            }]
        );

        // A primary partition and the first logical one.
        assert_eq!(
            state.device_of("root").unwrap(),
            PathBuf::from("/dev/mapper/loop0p1")
        );
        assert_eq!(
            state.device_of("data").unwrap(),
            PathBuf::from("/dev/mapper/loop0p5")
        );

        let mut sector = [0u8; 512];
        std::io::Read::read_exact(&mut std::fs::File::open(&image).unwrap(), &mut sector).unwrap();
        assert_eq!(&sector[510..], &[0x55, 0xAA]);
        // Boot flag and type of the first slot, then the extended partition in the second.
        assert_eq!(sector[446], 0x80);
        assert_eq!(sector[446 + 4], 0x83);
        assert_eq!(sector[446 + 16 + 4], 0x0F);
    }

    #[test]
    fn test_unmap_once() {
        let root = tempfile::tempdir().unwrap();
        let params = test_utils::params(root.path());
        let (_, nodes) = test_utils::nodes(&params, &[test_utils::entry(TABLE)]).unwrap();
        let state = loop_state(&root.path().join("image0.raw"));
        let exec = RecordingExecutor::new();
        let ctx = test_utils::teardown_ctx(&params, &state, &exec);

        for node in nodes.iter().rev() {
            node.umount(&ctx).unwrap();
            node.cleanup(&ctx).unwrap();
            node.delete(&ctx).unwrap();
        }
        assert_eq!(exec.calls(), vec!["kpartx -d /dev/loop0"]);
    }

    #[test]
    fn test_too_large() {
        let root = tempfile::tempdir().unwrap();
        let params = test_utils::params(root.path());
        let image = root.path().join("image0.raw");
        osutils::files::create_sparse_file(&image, 8 << 20).unwrap();

        let (_, nodes) = test_utils::nodes(
            &params,
            &[test_utils::entry(
                "partitioning: {name: mbr, base: image0, label: mbr, partitions: [{name: root, flags: [primary], size: 1GiB}]}",
            )],
        )
        .unwrap();
        let exec = RecordingExecutor::new();
        let mut state = loop_state(&image);
        let err = test_utils::create(nodes[0].as_ref(), &params, &mut state, &exec).unwrap_err();
        assert_eq!(
            err.kind().to_string(),
            format!("Failed to write partition table to '{}'", image.display())
        );
        assert!(exec.calls().is_empty());
    }
}
