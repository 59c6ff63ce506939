use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::BTreeMap;

use crate::catalog::AppTemplate;

/// Resolves container start order from the `depends_on` lists of one template.
///
/// Edges point from dependency to dependent (if `web` depends on `db`, the
/// edge is db -> web), so a topological sort yields dependencies first.
#[derive(Debug)]
pub struct ServiceGraph {
    graph: DiGraph<String, ()>,
}

impl ServiceGraph {
    /// Build the graph. Returns an error if a service depends on a service the
    /// template does not define.
    pub fn from_template(template: &AppTemplate) -> Result<Self, String> {
        let mut graph = DiGraph::new();
        let mut node_map: BTreeMap<String, NodeIndex> = BTreeMap::new();

        for name in template.services.keys() {
            let idx = graph.add_node(name.clone());
            node_map.insert(name.clone(), idx);
        }

        for (name, svc) in &template.services {
            let dependent_idx = node_map[name];
            for dep in &svc.depends_on {
                let dep_idx = node_map.get(dep).ok_or_else(|| {
                    format!("service '{}' depends on '{}', which is not defined", name, dep)
                })?;
                graph.add_edge(*dep_idx, dependent_idx, ());
            }
        }

        Ok(Self { graph })
    }

    /// Return a valid start order (dependencies first).
    ///
    /// Returns an error if the graph contains a cycle.
    pub fn start_order(&self) -> Result<Vec<String>, String> {
        match toposort(&self.graph, None) {
            Ok(indices) => Ok(indices
                .into_iter()
                .map(|idx| self.graph[idx].clone())
                .collect()),
            Err(cycle) => Err(format!(
                "dependency cycle detected involving service '{}'",
                self.graph[cycle.node_id()]
            )),
        }
    }
}
