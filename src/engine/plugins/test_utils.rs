use std::path::Path;

use blockdev_api::{
    config::{ConfigEntry, Params},
    error::BlockDeviceError,
    state::SharedState,
};
use osutils::dependencies::Executor;

use crate::engine::{
    registry, rollback::RollbackStack, GraphContext, Node, NodeContext, TeardownContext,
};

/// Parameters pointing every directory below `root`.
pub fn params(root: &Path) -> Params {
    Params {
        build_dir: root.join("build"),
        image_size: Some("1GiB".into()),
        image_dir: Some(root.join("images")),
        mount_base: Some(root.join("mnt")),
        ..Default::default()
    }
}

pub fn entry(yaml: &str) -> ConfigEntry {
    serde_yaml::from_str(yaml).unwrap()
}

/// Instantiates entries the way the graph builder does, returning the context for edge queries.
pub fn nodes<'a>(
    params: &'a Params,
    entries: &[ConfigEntry],
) -> Result<(GraphContext<'a>, Vec<Box<dyn Node>>), BlockDeviceError> {
    let mut ctx = GraphContext::new(params);
    let mut nodes = Vec::new();
    for entry in entries {
        nodes.extend(registry::instantiate(entry, &mut ctx)?);
    }
    Ok((ctx, nodes))
}

/// Runs `create` of one node, returning the undo actions it registered.
pub fn create(
    node: &dyn Node,
    params: &Params,
    state: &mut SharedState,
    exec: &dyn Executor,
) -> Result<RollbackStack, BlockDeviceError> {
    let mut rollback = RollbackStack::default();
    node.create(&mut NodeContext {
        params,
        state,
        exec,
        rollback: &mut rollback,
    })?;
    Ok(rollback)
}

pub fn teardown_ctx<'a>(
    params: &'a Params,
    state: &'a SharedState,
    exec: &'a dyn Executor,
) -> TeardownContext<'a> {
    TeardownContext {
        params,
        state,
        exec,
    }
}
