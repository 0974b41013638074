use log::debug;

use blockdev_api::{
    config::{ConfigEntry, PluginKind},
    error::BlockDeviceError,
};

use super::{
    plugins::{
        fstab::Fstab, local_loop::LocalLoop, lvm::Lvm, mkfs::Mkfs, mount::Mount,
        partitioning::Partitioning,
    },
    GraphContext, Node,
};

/// Turns one flat config entry into the nodes it contributes.
pub(crate) trait Plugin: Sized {
    /// Validates the entry. Claims on globally unique resources (labels, mount points) are
    /// registered in `ctx`.
    fn new(entry: &ConfigEntry, ctx: &mut GraphContext) -> Result<Self, BlockDeviceError>;

    fn into_nodes(self) -> Vec<Box<dyn Node>>;
}

fn build<P: Plugin>(
    entry: &ConfigEntry,
    ctx: &mut GraphContext,
) -> Result<Vec<Box<dyn Node>>, BlockDeviceError> {
    Ok(P::new(entry, ctx)?.into_nodes())
}

/// Instantiates the plugin registered for the entry's kind.
pub(crate) fn instantiate(
    entry: &ConfigEntry,
    ctx: &mut GraphContext,
) -> Result<Vec<Box<dyn Node>>, BlockDeviceError> {
    debug!(
        "Instantiating {} plugin for '{}'",
        entry.kind,
        entry.name().unwrap_or("<unnamed>")
    );
    match entry.kind {
        PluginKind::LocalLoop => build::<LocalLoop>(entry, ctx),
        PluginKind::Partitioning => build::<Partitioning>(entry, ctx),
        PluginKind::Lvm => build::<Lvm>(entry, ctx),
        PluginKind::Mkfs => build::<Mkfs>(entry, ctx),
        PluginKind::Mount => build::<Mount>(entry, ctx),
        PluginKind::Fstab => build::<Fstab>(entry, ctx),
    }
}
