//! A sparse image file attached to a loop device. Root of most layouts.

use std::{io::ErrorKind as IoErrorKind, path::PathBuf, str::FromStr};

use log::{info, warn};

use blockdev_api::{
    config::{plugins::LocalLoopConfig, ConfigEntry, ConfigError},
    constants::state_keys,
    error::{BlockDeviceError, ExecutionError, ReportError},
    primitives::size::Bytes,
    state::BlockDeviceRecord,
};
use osutils::{files, losetup};

use crate::engine::{
    registry::Plugin, rollback::UndoAction, Edges, GraphContext, Node, NodeContext,
    TeardownContext,
};

pub(crate) struct LocalLoop {
    name: String,
    size: u64,
    image: PathBuf,
}

impl Plugin for LocalLoop {
    fn new(entry: &ConfigEntry, ctx: &mut GraphContext) -> Result<Self, BlockDeviceError> {
        let config: LocalLoopConfig = entry.parse()?;
        let params = ctx.params();

        let size = match (config.size, &params.image_size) {
            (Some(size), _) => size.bytes(),
            (None, Some(default)) => {
                Bytes::from_str(default)
                    .map_err(|e| ConfigError::InvalidSize {
                        value: default.clone(),
                        reason: e.to_string(),
                    })?
                    .bytes()
            }
            (None, None) => return Err(ConfigError::MissingDefault("image-size".into()).into()),
        };

        let directory = config
            .directory
            .or_else(|| params.image_dir.clone())
            .ok_or_else(|| ConfigError::MissingDefault("image-dir".into()))?;

        Ok(Self {
            image: directory.join(format!("{}.raw", config.name)),
            name: config.name,
            size,
        })
    }

    fn into_nodes(self) -> Vec<Box<dyn Node>> {
        vec![Box::new(self)]
    }
}

impl Node for LocalLoop {
    fn name(&self) -> &str {
        &self.name
    }

    fn edges(&self, _ctx: &GraphContext) -> Edges {
        Edges::default()
    }

    fn create(&self, ctx: &mut NodeContext) -> Result<(), BlockDeviceError> {
        info!(
            "Creating image '{}' of {} bytes",
            self.image.display(),
            self.size
        );
        files::create_sparse_file(&self.image, self.size).structured(
            ExecutionError::CreateImage {
                path: self.image.display().to_string(),
            },
        )?;
        ctx.rollback.push(UndoAction::RemoveFile {
            path: self.image.clone(),
        });

        let device = losetup::attach(ctx.exec, &self.image).structured(
            ExecutionError::AttachLoopDevice {
                path: self.image.display().to_string(),
            },
        )?;
        ctx.rollback.push(UndoAction::DetachLoop {
            device: device.clone(),
        });
        info!("Attached loop device '{}'", device.display());

        ctx.state.insert(
            state_keys::BLOCKDEV,
            &self.name,
            &BlockDeviceRecord {
                device,
                image: Some(self.image.clone()),
            },
        )
    }

    fn umount(&self, ctx: &TeardownContext) -> Result<(), BlockDeviceError> {
        let device = ctx.state.device_of(&self.name)?;
        losetup::detach(ctx.exec, &device).structured(ExecutionError::DetachLoopDevice {
            device: device.display().to_string(),
        })
    }

    fn delete(&self, _ctx: &TeardownContext) -> Result<(), BlockDeviceError> {
        match std::fs::remove_file(&self.image) {
            Ok(()) => {
                info!("Removed image '{}'", self.image.display());
                Ok(())
            }
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                warn!("Image '{}' already removed", self.image.display());
                Ok(())
            }
            Err(e) => Err(e).structured(ExecutionError::RemoveImage {
                path: self.image.display().to_string(),
            }),
        }
    }
}
