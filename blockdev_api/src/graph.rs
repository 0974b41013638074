use std::collections::BTreeMap;

use log::trace;
use petgraph::{
    algo::tarjan_scc,
    dot::{Config, Dot},
    graph::NodeIndex,
    visit::DfsPostOrder,
    Directed, Graph,
};

use crate::config::ConfigError;

/// Directed graph of uniquely named nodes. An edge `A -> B` means B runs after A.
#[derive(Debug, Clone, Default)]
pub struct Digraph {
    inner: Graph<String, (), Directed>,
    index: BTreeMap<String, NodeIndex>,
}

impl Digraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, name: impl Into<String>) -> Result<(), ConfigError> {
        let name = name.into();
        if self.index.contains_key(&name) {
            return Err(ConfigError::DuplicateNode(name));
        }
        trace!("Adding node '{name}'");
        let idx = self.inner.add_node(name.clone());
        self.index.insert(name, idx);
        Ok(())
    }

    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<(), ConfigError> {
        let (Some(&a), Some(&b)) = (self.index.get(from), self.index.get(to)) else {
            return Err(ConfigError::UndefinedEdge {
                from: from.into(),
                to: to.into(),
            });
        };
        trace!("Adding edge '{from}' -> '{to}'");
        self.inner.update_edge(a, b, ());
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.inner.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.node_count() == 0
    }

    /// Returns all node names such that every edge's source precedes its target.
    ///
    /// Runs a depth-first post-order walk from every node in insertion order and prepends each
    /// node once its walk completes, so disconnected components are all covered and the result
    /// is deterministic for a given insertion order. Cycles are rejected.
    pub fn topological_sort(&self) -> Result<Vec<String>, ConfigError> {
        self.check_acyclic()?;

        let mut order = Vec::with_capacity(self.inner.node_count());
        let mut dfs = DfsPostOrder::empty(&self.inner);
        for start in self.inner.node_indices() {
            if dfs.discovered.contains(start.index()) {
                continue;
            }
            dfs.move_to(start);
            while let Some(idx) = dfs.next(&self.inner) {
                order.push(self.inner[idx].clone());
            }
        }
        order.reverse();
        Ok(order)
    }

    fn check_acyclic(&self) -> Result<(), ConfigError> {
        let mut cyclic: Vec<String> = tarjan_scc(&self.inner)
            .into_iter()
            .filter(|scc| {
                scc.len() > 1 || self.inner.find_edge(scc[0], scc[0]).is_some()
            })
            .flatten()
            .map(|idx| self.inner[idx].clone())
            .collect();

        if cyclic.is_empty() {
            return Ok(());
        }
        cyclic.sort();
        Err(ConfigError::DependencyCycle { nodes: cyclic })
    }

    /// Renders the graph in Graphviz dot format.
    pub fn to_dot(&self) -> String {
        format!("{:?}", Dot::with_config(&self.inner, &[Config::EdgeNoLabel]))
    }
}
