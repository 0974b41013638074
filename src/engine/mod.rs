use strum_macros::{Display, IntoStaticStr};

use blockdev_api::error::BlockDeviceError;

mod builder;
mod context;
mod plugins;
mod registry;
pub mod rollback;

pub(crate) use builder::{create_graph, NodeGraph};
pub(crate) use context::{GraphContext, NodeContext, TeardownContext};

/// Dependencies a node declares, by node name. Incoming nodes run before this one, outgoing nodes
/// after it.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct Edges {
    pub incoming: Vec<String>,
    pub outgoing: Vec<String>,
}

impl Edges {
    pub fn from_base(base: impl Into<String>) -> Self {
        Self {
            incoming: vec![base.into()],
            outgoing: Vec::new(),
        }
    }
}

/// The phases that walk the graph in reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum TeardownPhase {
    Umount,
    Cleanup,
    Delete,
}

/// A unit of work in the graph, produced by a plugin.
///
/// Nodes are rebuilt from the persisted config in every phase, so they hold configuration only;
/// everything a node learns while running goes into the shared state.
pub(crate) trait Node {
    fn name(&self) -> &str;

    /// Called once every node of every plugin exists.
    fn edges(&self, ctx: &GraphContext) -> Edges;

    /// Does the real work, recording results in the shared state and registering undo actions.
    fn create(&self, ctx: &mut NodeContext) -> Result<(), BlockDeviceError>;

    fn umount(&self, _ctx: &TeardownContext) -> Result<(), BlockDeviceError> {
        Ok(())
    }

    fn cleanup(&self, _ctx: &TeardownContext) -> Result<(), BlockDeviceError> {
        Ok(())
    }

    fn delete(&self, _ctx: &TeardownContext) -> Result<(), BlockDeviceError> {
        Ok(())
    }
}

impl dyn Node {
    pub fn teardown(
        &self,
        phase: TeardownPhase,
        ctx: &TeardownContext,
    ) -> Result<(), BlockDeviceError> {
        match phase {
            TeardownPhase::Umount => self.umount(ctx),
            TeardownPhase::Cleanup => self.cleanup(ctx),
            TeardownPhase::Delete => self.delete(ctx),
        }
    }
}
