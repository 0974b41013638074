//! Physical volumes, volume groups and logical volumes.
//!
//! The PV, VG and LV nodes only carry ordering. A driver node sits between the physical devices and
//! the PVs and creates everything at once.

use std::{path::PathBuf, rc::Rc};

use log::{debug, info, warn};

use blockdev_api::{
    config::{
        plugins::{LogicalVolumeConfig, LvmConfig},
        ConfigEntry, ConfigError,
    },
    constants::state_keys,
    error::{BlockDeviceError, ExecutionError, ReportError},
    state::{LogicalVolumeRecord, PhysicalVolumeRecord, VolumeGroupRecord},
};
use osutils::{
    lvm::{self, LvSize},
    udevadm,
};

use crate::engine::{
    registry::Plugin, rollback::UndoAction, Edges, GraphContext, Node, NodeContext,
    TeardownContext,
};

pub(crate) struct Lvm {
    config: Rc<LvmConfig>,
}

fn invalid_reference(kind: &str, name: &str, base: &str, target: &str) -> ConfigError {
    ConfigError::InvalidReference {
        kind: kind.into(),
        name: name.into(),
        base: base.into(),
        target: target.into(),
    }
}

fn lv_size(lv: &LogicalVolumeConfig) -> Result<LvSize, ConfigError> {
    match (&lv.size, &lv.extents) {
        (Some(size), _) => Ok(LvSize::Size(size)),
        (None, Some(extents)) => Ok(LvSize::Extents(extents)),
        (None, None) => Err(ConfigError::MissingLogicalVolumeSize(lv.name.clone())),
    }
}

impl Plugin for Lvm {
    fn new(entry: &ConfigEntry, _ctx: &mut GraphContext) -> Result<Self, BlockDeviceError> {
        let config: LvmConfig = entry.parse()?;

        for vg in &config.vgs {
            for base in &vg.base {
                if !config.pvs.iter().any(|pv| &pv.name == base) {
                    return Err(invalid_reference("vg", &vg.name, base, "physical volume").into());
                }
            }
        }
        for lv in &config.lvs {
            if !config.vgs.iter().any(|vg| vg.name == lv.base) {
                return Err(invalid_reference("lv", &lv.name, &lv.base, "volume group").into());
            }
            lv_size(lv)?;
        }

        Ok(Self {
            config: Rc::new(config),
        })
    }

    fn into_nodes(self) -> Vec<Box<dyn Node>> {
        let mut nodes: Vec<Box<dyn Node>> = vec![Box::new(Driver {
            config: self.config.clone(),
        })];
        nodes.extend((0..self.config.pvs.len()).map(|index| {
            Box::new(PhysicalVolume {
                config: self.config.clone(),
                index,
            }) as Box<dyn Node>
        }));
        nodes.extend((0..self.config.vgs.len()).map(|index| {
            Box::new(VolumeGroup {
                config: self.config.clone(),
                index,
            }) as Box<dyn Node>
        }));
        nodes.extend((0..self.config.lvs.len()).map(|index| {
            Box::new(LogicalVolume {
                config: self.config.clone(),
                index,
            }) as Box<dyn Node>
        }));
        nodes
    }
}

struct Driver {
    config: Rc<LvmConfig>,
}

impl Driver {
    fn create_lvm(&self, ctx: &mut NodeContext) -> Result<(), BlockDeviceError> {
        for pv in &self.config.pvs {
            let device = ctx.state.device_of(&pv.base)?;
            info!("Creating physical volume '{}' on '{}'", pv.name, device.display());
            lvm::pvcreate(ctx.exec, &device, &pv.options).structured(ExecutionError::CreateLvm {
                name: pv.name.clone(),
            })?;
            ctx.state.insert(
                state_keys::PVS,
                &pv.name,
                &PhysicalVolumeRecord {
                    opts: pv.options.clone(),
                    device,
                },
            )?;
        }

        for vg in &self.config.vgs {
            let devices = vg
                .base
                .iter()
                .map(|pv| {
                    ctx.state
                        .get::<PhysicalVolumeRecord>(state_keys::PVS, pv)
                        .map(|record| record.device)
                })
                .collect::<Result<Vec<PathBuf>, _>>()?;
            info!("Creating volume group '{}'", vg.name);
            lvm::vgcreate(ctx.exec, &vg.name, &devices[..], &vg.options).structured(
                ExecutionError::CreateLvm {
                    name: vg.name.clone(),
                },
            )?;
            ctx.rollback.push(UndoAction::DeactivateVolumeGroup {
                name: vg.name.clone(),
            });
            ctx.state.insert(
                state_keys::VGS,
                &vg.name,
                &VolumeGroupRecord {
                    opts: vg.options.clone(),
                    devices,
                },
            )?;
        }

        for lv in &self.config.lvs {
            info!("Creating logical volume '{}/{}'", lv.base, lv.name);
            lvm::lvcreate(ctx.exec, &lv.name, &lv.base, lv_size(lv)?, &lv.options).structured(
                ExecutionError::CreateLvm {
                    name: format!("{}/{}", lv.base, lv.name),
                },
            )?;
            ctx.rollback.push(UndoAction::DeactivateLogicalVolume {
                volume_group: lv.base.clone(),
                name: lv.name.clone(),
            });
            ctx.state.insert(
                state_keys::BLOCKDEV,
                &lv.name,
                &LogicalVolumeRecord {
                    vgs: lv.base.clone(),
                    size: lv.size.clone(),
                    extents: lv.extents.clone(),
                    opts: lv.options.clone(),
                    device: PathBuf::from(format!("/dev/mapper/{}-{}", lv.base, lv.name)),
                },
            )?;
        }
        Ok(())
    }

    fn refresh_cache(&self, ctx: &TeardownContext) {
        if let Err(e) = lvm::pvscan_cache(ctx.exec) {
            warn!("Ignoring failed LVM cache refresh: {e:?}");
        }
    }
}

impl Node for Driver {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn edges(&self, _ctx: &GraphContext) -> Edges {
        let mut incoming: Vec<String> = Vec::new();
        for pv in &self.config.pvs {
            if !incoming.contains(&pv.base) {
                incoming.push(pv.base.clone());
            }
        }
        Edges {
            incoming,
            outgoing: self.config.pvs.iter().map(|pv| pv.name.clone()).collect(),
        }
    }

    fn create(&self, ctx: &mut NodeContext) -> Result<(), BlockDeviceError> {
        self.create_lvm(ctx)
    }

    fn cleanup(&self, ctx: &TeardownContext) -> Result<(), BlockDeviceError> {
        self.refresh_cache(ctx);
        Ok(())
    }

    fn delete(&self, ctx: &TeardownContext) -> Result<(), BlockDeviceError> {
        self.refresh_cache(ctx);
        Ok(())
    }
}

struct PhysicalVolume {
    config: Rc<LvmConfig>,
    index: usize,
}

impl Node for PhysicalVolume {
    fn name(&self) -> &str {
        &self.config.pvs[self.index].name
    }

    fn edges(&self, _ctx: &GraphContext) -> Edges {
        Edges::default()
    }

    fn create(&self, _ctx: &mut NodeContext) -> Result<(), BlockDeviceError> {
        Ok(())
    }
}

struct VolumeGroup {
    config: Rc<LvmConfig>,
    index: usize,
}

impl Node for VolumeGroup {
    fn name(&self) -> &str {
        &self.config.vgs[self.index].name
    }

    fn edges(&self, _ctx: &GraphContext) -> Edges {
        Edges {
            incoming: self.config.vgs[self.index].base.clone(),
            outgoing: Vec::new(),
        }
    }

    fn create(&self, _ctx: &mut NodeContext) -> Result<(), BlockDeviceError> {
        Ok(())
    }

    fn umount(&self, ctx: &TeardownContext) -> Result<(), BlockDeviceError> {
        let name = self.name();
        lvm::deactivate_vg(ctx.exec, name).structured(ExecutionError::DeactivateLvm {
            name: name.into(),
        })?;
        settle(ctx);
        Ok(())
    }
}

struct LogicalVolume {
    config: Rc<LvmConfig>,
    index: usize,
}

impl Node for LogicalVolume {
    fn name(&self) -> &str {
        &self.config.lvs[self.index].name
    }

    fn edges(&self, _ctx: &GraphContext) -> Edges {
        Edges::from_base(&self.config.lvs[self.index].base)
    }

    fn create(&self, _ctx: &mut NodeContext) -> Result<(), BlockDeviceError> {
        Ok(())
    }

    fn umount(&self, ctx: &TeardownContext) -> Result<(), BlockDeviceError> {
        let lv = &self.config.lvs[self.index];
        lvm::deactivate_lv(ctx.exec, &lv.base, &lv.name).structured(
            ExecutionError::DeactivateLvm {
                name: format!("{}/{}", lv.base, lv.name),
            },
        )?;
        settle(ctx);
        Ok(())
    }
}

fn settle(ctx: &TeardownContext) {
    if let Err(e) = udevadm::settle(ctx.exec) {
        debug!("Ignoring udevadm failure: {e:?}");
    }
}
