use std::{collections::HashMap, env, path::Path};

use log::{debug, info};

use blockdev_api::{
    config::{FlatConfig, Params},
    constants::DUMP_GRAPH_ENV,
    error::{BlockDeviceError, InternalError, ReportError},
    graph::Digraph,
};

use super::{registry, GraphContext, Node};

/// The nodes of a configuration, in execution order.
pub(crate) struct NodeGraph {
    nodes: Vec<Box<dyn Node>>,
}

impl NodeGraph {
    /// Nodes in topological order; teardown walks them in reverse.
    pub fn nodes(&self) -> &[Box<dyn Node>] {
        &self.nodes
    }

    pub fn call_order(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.name().to_string()).collect()
    }
}

/// Builds the graph for a flat configuration. The same config always yields the same order.
///
/// When `BLOCK_DEVICE_DUMP_GRAPH` is set, the graph is also written to that path in dot format.
pub(crate) fn create_graph(
    config: &FlatConfig,
    params: &Params,
) -> Result<NodeGraph, BlockDeviceError> {
    let dump_path = env::var_os(DUMP_GRAPH_ENV);
    build(config, params, dump_path.as_deref().map(Path::new))
}

fn build(
    config: &FlatConfig,
    params: &Params,
    dump_path: Option<&Path>,
) -> Result<NodeGraph, BlockDeviceError> {
    let mut ctx = GraphContext::new(params);

    let mut nodes = Vec::new();
    for entry in config.entries() {
        nodes.extend(registry::instantiate(entry, &mut ctx)?);
    }

    let mut graph = Digraph::new();
    for node in &nodes {
        debug!("Adding node '{}'", node.name());
        graph.add_node(node.name())?;
    }

    // Edges need global knowledge, so they are only asked for once every node exists.
    for node in &nodes {
        let edges = node.edges(&ctx);
        for from in &edges.incoming {
            debug!("Edge {from} -> {}", node.name());
            graph.add_edge(from, node.name())?;
        }
        for to in &edges.outgoing {
            debug!("Edge {} -> {to}", node.name());
            graph.add_edge(node.name(), to)?;
        }
    }

    if let Some(path) = dump_path {
        info!("Dumping graph to '{}'", path.display());
        std::fs::write(path, graph.to_dot()).structured(InternalError::DumpGraph)?;
    }

    let order = graph.topological_sort()?;
    debug!("Call order: {order:?}");

    let mut by_name: HashMap<String, Box<dyn Node>> = nodes
        .into_iter()
        .map(|node| (node.name().to_string(), node))
        .collect();
    let nodes = order
        .iter()
        .map(|name| {
            by_name
                .remove(name)
                .structured(InternalError::Internal("Sorted node missing from graph"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(NodeGraph { nodes })
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use blockdev_api::config::{config_tree_to_graph, ConfigError};

    use super::*;

    fn params() -> Params {
        Params {
            build_dir: "/tmp/build".into(),
            image_size: Some("1GiB".into()),
            image_dir: Some("/tmp/images".into()),
            mount_base: Some("/tmp/mnt".into()),
            ..Default::default()
        }
    }

    fn flat(yaml: &str) -> FlatConfig {
        config_tree_to_graph(&serde_yaml::from_str(yaml).unwrap()).unwrap()
    }

    fn position(order: &[String], name: &str) -> usize {
        order.iter().position(|n| n == name).unwrap()
    }

    const LAYOUT: &str = indoc! {r#"
        - local_loop:
            name: image0
        - partitioning:
            base: image0
            name: mbr
            label: mbr
            partitions:
              - name: root
                flags: [primary]
                size: 50%
              - name: data
                size: 100%
        - lvm:
            name: lvm
            pvs:
              - name: pv
                base: data
            vgs:
              - name: vg
                base: [pv]
            lvs:
              - name: lv_var
                base: vg
                size: 1G
              - name: lv_log
                base: vg
                extents: 100%FREE
        - mkfs:
            name: fs_var_log
            base: lv_log
            type: xfs
            mount:
              mount_point: /var/log
        - mkfs:
            name: fs_var
            base: lv_var
            type: xfs
            mount:
              mount_point: /var
        - mkfs:
            name: fs_root
            base: root
            type: ext4
            mount:
              mount_point: /
              fstab:
                fsck-passno: 1
    "#};

    #[test]
    fn test_order_respects_edges() {
        let params = params();
        let graph = build(&flat(LAYOUT), &params, None).unwrap();
        let order = graph.call_order();
        assert_eq!(order.len(), 15);

        let before = |a: &str, b: &str| {
            assert!(
                position(&order, a) < position(&order, b),
                "{a} should precede {b} in {order:?}"
            )
        };
        before("image0", "root");
        before("root", "data");
        before("data", "lvm");
        before("lvm", "pv");
        before("pv", "vg");
        before("vg", "lv_var");
        before("vg", "lv_log");
        before("lv_log", "fs_var_log");
        before("mount_fs_root", "mount_fs_var");
        before("mount_fs_var", "mount_fs_var_log");
        before("mount_fs_root", "fstab_mount_fs_root");

        // Rebuilding yields the identical order.
        let again = build(&flat(LAYOUT), &params, None).unwrap();
        assert_eq!(again.call_order(), order);
    }

    #[test]
    fn test_dump_graph() {
        let dir = tempfile::tempdir().unwrap();
        let dump = dir.path().join("graph.dot");
        build(&flat(LAYOUT), &params(), Some(&dump)).unwrap();
        let dot = std::fs::read_to_string(&dump).unwrap();
        assert!(dot.starts_with("digraph {"));
        assert!(dot.contains("lv_log"));
    }

    #[test]
    fn test_undefined_base() {
        let err = build(
            &flat(indoc! {r#"
                - mkfs:
                    name: fs_root
                    base: missing
                    type: ext4
            "#}),
            &params(),
            None,
        )
        .err()
        .unwrap();
        assert_eq!(
            err.kind().to_string(),
            format!(
                "Invalid block device configuration: {}",
                ConfigError::UndefinedEdge {
                    from: "missing".into(),
                    to: "fs_root".into()
                }
            )
        );
    }

    #[test]
    fn test_duplicate_node() {
        let err = build(
            &flat(indoc! {r#"
                - local_loop:
                    name: image0
                - local_loop:
                    name: image0
            "#}),
            &params(),
            None,
        )
        .err()
        .unwrap();
        assert_eq!(
            err.kind().to_string(),
            "Invalid block device configuration: Duplicate node name: image0"
        );
    }
}
