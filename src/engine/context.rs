use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use log::debug;
use once_cell::unsync::OnceCell;

use blockdev_api::{
    config::{ConfigError, Params},
    state::SharedState,
};
use osutils::dependencies::Executor;

use super::rollback::RollbackStack;

/// Knowledge shared by all plugins while the graph is built: the parameters, the filesystem labels
/// and mount points declared so far. Scoped to one graph build.
pub struct GraphContext<'a> {
    params: &'a Params,
    labels: BTreeSet<String>,
    mount_points: Vec<(PathBuf, String)>,
    mount_order: OnceCell<Vec<(PathBuf, String)>>,
}

impl<'a> GraphContext<'a> {
    pub fn new(params: &'a Params) -> Self {
        Self {
            params,
            labels: BTreeSet::new(),
            mount_points: Vec::new(),
            mount_order: OnceCell::new(),
        }
    }

    pub fn params(&self) -> &'a Params {
        self.params
    }

    /// Claims a filesystem label; labels must be unique across the image.
    pub fn register_label(&mut self, label: &str) -> Result<(), ConfigError> {
        if !self.labels.insert(label.into()) {
            return Err(ConfigError::DuplicateLabel(label.into()));
        }
        Ok(())
    }

    /// Claims a mount point for the mount node `node`.
    pub fn register_mount_point(&mut self, mount_point: &Path, node: &str) -> Result<(), ConfigError> {
        if self.mount_points.iter().any(|(mp, _)| mp == mount_point) {
            return Err(ConfigError::DuplicateMountPoint(mount_point.into()));
        }
        self.mount_points.push((mount_point.into(), node.into()));
        self.mount_order.take();
        Ok(())
    }

    /// All mount points with their node names, parents before the paths below them.
    ///
    /// Sorted once, on first use after the last registration.
    pub fn mount_order(&self) -> &[(PathBuf, String)] {
        self.mount_order.get_or_init(|| {
            let mut sorted = self.mount_points.clone();
            // Paths compare component-wise, so `/var` sorts right before `/var/log`.
            sorted.sort_by(|(a, _), (b, _)| a.cmp(b));
            debug!(
                "Ordered mounts now: {:?}",
                sorted.iter().map(|(mp, _)| mp).collect::<Vec<_>>()
            );
            sorted
        })
    }

    /// Mount node whose mount point comes right before `mount_point` in the global order.
    pub fn previous_mount(&self, mount_point: &Path) -> Option<&str> {
        let order = self.mount_order();
        let index = order.iter().position(|(mp, _)| mp == mount_point)?;
        index
            .checked_sub(1)
            .map(|previous| order[previous].1.as_str())
    }
}

/// What a node sees while running `create`.
pub struct NodeContext<'a> {
    pub params: &'a Params,
    pub state: &'a mut SharedState,
    pub exec: &'a dyn Executor,
    /// Undo actions of the running node.
    pub rollback: &'a mut RollbackStack,
}

/// What a node sees during the teardown phases. The state is read-only.
pub struct TeardownContext<'a> {
    pub params: &'a Params,
    pub state: &'a SharedState,
    pub exec: &'a dyn Executor,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_of(ctx: &GraphContext) -> Vec<String> {
        ctx.mount_order()
            .iter()
            .map(|(mp, _)| mp.display().to_string())
            .collect()
    }

    #[test]
    fn test_mount_order_independent_of_declaration() {
        let params = Params::default();
        let declarations = [
            ["/var/log", "/boot", "/", "/var"],
            ["/", "/var", "/var/log", "/boot"],
            ["/var", "/var/log", "/boot", "/"],
            ["/boot", "/var/log", "/var", "/"],
        ];

        for declared in declarations {
            let mut ctx = GraphContext::new(&params);
            for mp in declared {
                ctx.register_mount_point(Path::new(mp), &format!("mount{mp}"))
                    .unwrap();
            }
            assert_eq!(order_of(&ctx), vec!["/", "/boot", "/var", "/var/log"]);
        }
    }

    #[test]
    fn test_prefix_is_not_parent() {
        let params = Params::default();
        let mut ctx = GraphContext::new(&params);
        for mp in ["/varx", "/var/log", "/var"] {
            ctx.register_mount_point(Path::new(mp), mp).unwrap();
        }
        assert_eq!(order_of(&ctx), vec!["/var", "/var/log", "/varx"]);
    }

    #[test]
    fn test_previous_mount() {
        let params = Params::default();
        let mut ctx = GraphContext::new(&params);
        ctx.register_mount_point(Path::new("/var"), "mount_var").unwrap();
        ctx.register_mount_point(Path::new("/"), "mount_root").unwrap();
        assert_eq!(ctx.previous_mount(Path::new("/")), None);
        assert_eq!(ctx.previous_mount(Path::new("/var")), Some("mount_root"));
        assert_eq!(ctx.previous_mount(Path::new("/home")), None);

        // Registering after the order was computed invalidates it.
        ctx.register_mount_point(Path::new("/var/log"), "mount_log").unwrap();
        assert_eq!(ctx.previous_mount(Path::new("/var/log")), Some("mount_var"));
    }

    #[test]
    fn test_duplicates_rejected() {
        let params = Params::default();
        let mut ctx = GraphContext::new(&params);
        ctx.register_mount_point(Path::new("/"), "a").unwrap();
        assert_eq!(
            ctx.register_mount_point(Path::new("/"), "b"),
            Err(ConfigError::DuplicateMountPoint("/".into()))
        );

        ctx.register_label("cloudimg-rootfs").unwrap();
        assert_eq!(
            ctx.register_label("cloudimg-rootfs"),
            Err(ConfigError::DuplicateLabel("cloudimg-rootfs".into()))
        );
    }
}
