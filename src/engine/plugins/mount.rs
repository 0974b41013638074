use std::path::PathBuf;

use log::{debug, info, warn};

use blockdev_api::{
    config::{plugins::MountConfig, ConfigEntry, ConfigError},
    constants::state_keys,
    error::{BlockDeviceError, ExecutionError, ReportError},
    state::{FilesystemRecord, MountRecord},
};
use osutils::{files, mount, mountpoint, path};

use crate::engine::{
    registry::Plugin, rollback::UndoAction, Edges, GraphContext, Node, NodeContext,
    TeardownContext,
};

pub(crate) struct Mount {
    name: String,
    base: String,
    mount_point: PathBuf,
    /// Where the mount point lives on the build host.
    path: PathBuf,
}

impl Mount {
    fn key(&self) -> String {
        self.mount_point.display().to_string()
    }

    fn unmount(&self, ctx: &TeardownContext) -> Result<(), BlockDeviceError> {
        info!("Unmounting '{}'", self.path.display());
        mount::umount(ctx.exec, &self.path).structured(ExecutionError::Unmount {
            mount_point: self.key(),
        })
    }
}

impl Plugin for Mount {
    fn new(entry: &ConfigEntry, ctx: &mut GraphContext) -> Result<Self, BlockDeviceError> {
        let config: MountConfig = entry.parse()?;
        let mount_base = ctx
            .params()
            .mount_base
            .as_ref()
            .ok_or_else(|| ConfigError::MissingDefault("mount-base".into()))?;

        ctx.register_mount_point(&config.mount_point, &config.name)?;

        Ok(Self {
            path: path::join_relative(mount_base, &config.mount_point),
            name: config.name,
            base: config.base,
            mount_point: config.mount_point,
        })
    }

    fn into_nodes(self) -> Vec<Box<dyn Node>> {
        vec![Box::new(self)]
    }
}

impl Node for Mount {
    fn name(&self) -> &str {
        &self.name
    }

    fn edges(&self, ctx: &GraphContext) -> Edges {
        let mut edges = Edges::default();
        // Parents are mounted before the paths below them.
        if let Some(previous) = ctx.previous_mount(&self.mount_point) {
            edges.incoming.push(previous.into());
        }
        edges.incoming.push(self.base.clone());
        edges
    }

    fn create(&self, ctx: &mut NodeContext) -> Result<(), BlockDeviceError> {
        let filesystem: FilesystemRecord = ctx.state.get(state_keys::FILESYS, &self.base)?;
        let mount_error = || ExecutionError::Mount {
            mount_point: self.key(),
        };

        files::mkdir_p(ctx.exec, &self.path).structured(mount_error())?;
        info!(
            "Mounting '{}' on '{}'",
            filesystem.device.display(),
            self.path.display()
        );
        mount::mount(ctx.exec, &filesystem.device, &self.path).structured(mount_error())?;
        ctx.rollback.push(UndoAction::Unmount {
            path: self.path.clone(),
        });

        ctx.state.insert(
            state_keys::MOUNT,
            &self.key(),
            &MountRecord {
                name: self.name.clone(),
                base: self.base.clone(),
                path: self.path.clone(),
            },
        )?;
        ctx.state.push(state_keys::MOUNT_ORDER, &self.key())
    }

    fn umount(&self, ctx: &TeardownContext) -> Result<(), BlockDeviceError> {
        let filesystem: FilesystemRecord = ctx.state.get(state_keys::FILESYS, &self.base)?;
        if filesystem.fstype == "vfat" {
            debug!("Not trimming vfat filesystem at '{}'", self.path.display());
        } else if let Err(e) = mount::fstrim(ctx.exec, &self.path) {
            warn!("Ignoring failed trim of '{}': {e:?}", self.path.display());
        }
        self.unmount(ctx)
    }

    fn delete(&self, ctx: &TeardownContext) -> Result<(), BlockDeviceError> {
        let mounted = mountpoint::check_is_mountpoint(ctx.exec, &self.path).structured(
            ExecutionError::Unmount {
                mount_point: self.key(),
            },
        )?;
        if mounted {
            self.unmount(ctx)
        } else {
            debug!("'{}' is not mounted", self.path.display());
            Ok(())
        }
    }
}
