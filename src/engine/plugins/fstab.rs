use blockdev_api::{
    config::{plugins::FstabConfig, ConfigEntry},
    constants::state_keys,
    error::BlockDeviceError,
    state::FstabRecord,
};

use crate::engine::{registry::Plugin, Edges, GraphContext, Node, NodeContext};

/// Collects the fstab fields of one mount. The file itself is rendered by `writefstab`.
pub(crate) struct Fstab {
    config: FstabConfig,
}

impl Plugin for Fstab {
    fn new(entry: &ConfigEntry, _ctx: &mut GraphContext) -> Result<Self, BlockDeviceError> {
        Ok(Self {
            config: entry.parse()?,
        })
    }

    fn into_nodes(self) -> Vec<Box<dyn Node>> {
        vec![Box::new(self)]
    }
}

impl Node for Fstab {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn edges(&self, _ctx: &GraphContext) -> Edges {
        Edges::from_base(&self.config.base)
    }

    fn create(&self, ctx: &mut NodeContext) -> Result<(), BlockDeviceError> {
        ctx.state.insert(
            state_keys::FSTAB,
            &self.config.base,
            &FstabRecord {
                options: self.config.options.clone(),
                dump_freq: self.config.dump_freq,
                fsck_passno: self.config.fsck_passno,
            },
        )
    }
}
