//! Minimal parallel DAG executor.
//!
//! A [`TaskGraph`] node pairs an action with the nodes it waits on. Nodes are
//! immutable and shared through `Arc`, so a node reachable through several
//! dependents is one node, and a graph can never contain a cycle once built
//! (a node only ever references nodes that already exist).
//!
//! [`TaskGraph::run`] executes the whole reachable subgraph: every distinct
//! node runs exactly once, strictly after its upstream nodes, and independent
//! nodes run concurrently on the rayon pool. Completed nodes unlock their
//! dependents as soon as their last upstream finishes; there is no level
//! barrier, so the wall-clock cost is the longest chain, not the sum of the
//! slowest node per level.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::unbounded;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::error::{AggregateError, BuildError};

type Action = Box<dyn Fn() -> Result<(), BuildError> + Send + Sync>;

/// A node in the build schedule: an optional action plus the upstream nodes
/// that must finish first.
pub struct TaskGraph {
    name: String,
    action: Option<Action>,
    dependencies: Vec<Arc<TaskGraph>>,
}

impl TaskGraph {
    /// A work node: `action` runs once all of `dependencies` succeeded.
    pub fn new(
        name: impl Into<String>,
        action: impl Fn() -> Result<(), BuildError> + Send + Sync + 'static,
        dependencies: Vec<Arc<TaskGraph>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            action: Some(Box::new(action)),
            dependencies,
        })
    }

    /// A no-op fan-in node, used as the synthetic root over a set of
    /// requested tasks.
    pub fn aggregate(dependencies: Vec<Arc<TaskGraph>>) -> Arc<Self> {
        Arc::new(Self {
            name: String::new(),
            action: None,
            dependencies,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute the subgraph reachable from this node.
    ///
    /// On failure the graph settles first: actions already running finish,
    /// dependents of failed nodes never start, and every observed failure is
    /// returned in completion order.
    pub fn run(self: &Arc<Self>) -> Result<(), AggregateError> {
        let graph = flatten(self);

        // How many upstream nodes each node still waits on.
        let mut pending: HashMap<NodeIndex, usize> = graph
            .node_indices()
            .map(|index| {
                (
                    index,
                    graph.neighbors_directed(index, Direction::Incoming).count(),
                )
            })
            .collect();

        let (result_sender, result_receiver) = unbounded::<(NodeIndex, Result<(), BuildError>)>();
        let mut errors = Vec::new();
        let mut in_flight = 0usize;

        rayon::scope(|scope| {
            let spawn_node = |in_flight: &mut usize, index: NodeIndex| {
                *in_flight += 1;
                let node = graph[index].clone();
                let sender = result_sender.clone();
                scope.spawn(move |_| {
                    let outcome = match &node.action {
                        Some(action) => action(),
                        None => Ok(()),
                    };
                    // The receiver outlives every sender; the loop below
                    // drains until all spawned nodes have reported.
                    let _ = sender.send((index, outcome));
                });
            };

            for index in graph.node_indices() {
                if pending[&index] == 0 {
                    spawn_node(&mut in_flight, index);
                }
            }

            while in_flight > 0 {
                let (completed, outcome) = result_receiver
                    .recv()
                    .expect("a spawned node finished without reporting");
                in_flight -= 1;

                match outcome {
                    Ok(()) => {
                        let dependents: Vec<NodeIndex> = graph
                            .neighbors_directed(completed, Direction::Outgoing)
                            .collect();
                        for index in dependents {
                            let count = pending
                                .get_mut(&index)
                                .expect("dependent missing from the schedule");
                            *count -= 1;
                            if *count == 0 {
                                spawn_node(&mut in_flight, index);
                            }
                        }
                    }
                    Err(error) => errors.push(error),
                }
            }
        });

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AggregateError(errors))
        }
    }
}

/// Collapse the `Arc`-linked nodes reachable from `root` into a petgraph
/// graph keyed by node identity, with edges pointing downstream.
fn flatten(root: &Arc<TaskGraph>) -> DiGraph<Arc<TaskGraph>, ()> {
    let mut graph = DiGraph::new();
    let mut index_of: HashMap<*const TaskGraph, NodeIndex> = HashMap::new();
    add_node(root, &mut graph, &mut index_of);
    graph
}

fn add_node(
    node: &Arc<TaskGraph>,
    graph: &mut DiGraph<Arc<TaskGraph>, ()>,
    index_of: &mut HashMap<*const TaskGraph, NodeIndex>,
) -> NodeIndex {
    if let Some(&index) = index_of.get(&Arc::as_ptr(node)) {
        return index;
    }

    let index = graph.add_node(node.clone());
    index_of.insert(Arc::as_ptr(node), index);

    for dependency in &node.dependencies {
        let upstream = add_node(dependency, graph, index_of);
        graph.add_edge(upstream, index, ());
    }

    index
}
