/// Petgraph view of a workflow
///
/// Built once per workflow version when it is compiled into the registry. The
/// executor uses it for edge lookups by node and for reachability from the start node;
/// edges are referred to by their index in `Workflow::edges`.

use crate::runtime::error::ExecutionError;
use crate::workflow::types::Workflow;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use petgraph::Direction;
use std::collections::{HashMap, HashSet};

#[derive(Debug)]
pub struct WorkflowGraph {
    /// Node weights are node ids, edge weights are indices into `Workflow::edges`
    graph: DiGraph<String, usize>,
    node_id_to_index: HashMap<String, NodeIndex>,
}

impl WorkflowGraph {
    /// Build the graph, rejecting edges that reference unknown nodes
    pub fn build(workflow: &Workflow) -> Result<Self, ExecutionError> {
        let mut graph = DiGraph::new();
        let mut node_id_to_index = HashMap::new();

        for node in &workflow.nodes {
            let index = graph.add_node(node.id.clone());
            node_id_to_index.insert(node.id.clone(), index);
        }

        for (edge_index, edge) in workflow.edges.iter().enumerate() {
            let from = node_id_to_index
                .get(&edge.from_node_id)
                .ok_or_else(|| ExecutionError::NodeNotFound(edge.from_node_id.clone()))?;
            let to = node_id_to_index
                .get(&edge.to_node_id)
                .ok_or_else(|| ExecutionError::NodeNotFound(edge.to_node_id.clone()))?;
            graph.add_edge(*from, *to, edge_index);
        }

        tracing::debug!(
            "📊 Built workflow graph '{}': {} nodes, {} edges",
            workflow.id,
            graph.node_count(),
            graph.edge_count()
        );

        Ok(Self { graph, node_id_to_index })
    }

    /// Incoming edge indices in definition order
    pub fn incoming(&self, node_id: &str) -> Vec<usize> {
        self.edges(node_id, Direction::Incoming)
    }

    /// Outgoing edge indices in definition order
    pub fn outgoing(&self, node_id: &str) -> Vec<usize> {
        self.edges(node_id, Direction::Outgoing)
    }

    fn edges(&self, node_id: &str, direction: Direction) -> Vec<usize> {
        let Some(index) = self.node_id_to_index.get(node_id) else {
            return Vec::new();
        };
        let mut edges: Vec<usize> = self
            .graph
            .edges_directed(*index, direction)
            .map(|edge| *edge.weight())
            .collect();
        edges.sort_unstable();
        edges
    }

    /// Every node reachable from `start`, including `start`
    pub fn reachable_from(&self, start: &str) -> HashSet<String> {
        let mut reachable = HashSet::new();
        let Some(start_index) = self.node_id_to_index.get(start) else {
            return reachable;
        };

        let mut bfs = Bfs::new(&self.graph, *start_index);
        while let Some(index) = bfs.next(&self.graph) {
            reachable.insert(self.graph[index].clone());
        }
        reachable
    }
}
