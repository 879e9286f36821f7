//! Job dependency graph leveling for hierarchical layout.
//!
//! The feed delivers a flat list of jobs and `source -> target` edges
//! where the target depends on the source completing. Every node gets a
//! `level`: roots (no incoming edge) sit at 0 and each edge pushes its
//! target to at least `source.level + 1`, i.e. the longest path from a
//! root.
//!
//! Partial data is expected, so bad edges are skipped and reported in
//! [`LeveledGraph::skipped`] instead of failing the build. Cycles are
//! broken deterministically: a depth-first search runs from every root
//! in input order, then from every node it has not reached yet, and each
//! back edge it finds is dropped.

use std::collections::{BTreeMap, HashMap, HashSet};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{depth_first_search, DfsEvent};
use petgraph::Direction;
use serde::{Deserialize, Serialize};

use crate::status::JobStatus;
use crate::types::JobId;

/// A job as delivered by the dependency feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobNode {
    pub id: JobId,
    pub name: String,
    /// `None` for jobs that have never run.
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// `target` depends on `source` completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub source: JobId,
    pub target: JobId,
}

/// A job decorated with its layout level and derived edge counts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DependencyNode {
    pub id: JobId,
    pub name: String,
    pub status: Option<JobStatus>,
    pub enabled: bool,
    pub level: u32,
    pub incoming: u32,
    pub outgoing: u32,
}

/// Why an edge was left out of the leveled graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum GraphDataError {
    #[error("Edge source job {0} is not in the feed")]
    UnknownSource(JobId),

    #[error("Edge target job {0} is not in the feed")]
    UnknownTarget(JobId),

    #[error("Duplicate edge")]
    DuplicateEdge,

    #[error("Edge closes a dependency cycle")]
    CycleBroken,
}

/// An input edge that did not make it into the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedEdge {
    pub edge: DependencyEdge,
    pub reason: GraphDataError,
}

/// Output of [`DependencyGraphBuilder::build`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LeveledGraph {
    /// Nodes in feed order (first occurrence of each id).
    pub nodes: Vec<DependencyNode>,
    /// Retained edges in feed order.
    pub edges: Vec<DependencyEdge>,
    pub skipped: Vec<SkippedEdge>,
}

impl LeveledGraph {
    pub fn node(&self, id: JobId) -> Option<&DependencyNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn level_of(&self, id: JobId) -> Option<u32> {
        self.node(id).map(|n| n.level)
    }

    /// Deepest level in the graph, 0 for an empty graph.
    pub fn max_level(&self) -> u32 {
        self.nodes.iter().map(|n| n.level).max().unwrap_or(0)
    }

    /// Job ids grouped by level, in feed order within a level.
    pub fn by_level(&self) -> BTreeMap<u32, Vec<JobId>> {
        let mut levels: BTreeMap<u32, Vec<JobId>> = BTreeMap::new();
        for node in &self.nodes {
            levels.entry(node.level).or_default().push(node.id);
        }
        levels
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Converts a flat job/dependency feed into a [`LeveledGraph`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DependencyGraphBuilder;

impl DependencyGraphBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Level every node. Never fails: unusable edges land in `skipped`.
    pub fn build(&self, nodes: Vec<JobNode>, edges: Vec<DependencyEdge>) -> LeveledGraph {
        let mut graph: DiGraph<JobId, ()> = DiGraph::with_capacity(nodes.len(), edges.len());
        let mut index: HashMap<JobId, NodeIndex> = HashMap::with_capacity(nodes.len());
        let mut kept: Vec<JobNode> = Vec::with_capacity(nodes.len());

        for node in nodes {
            if index.contains_key(&node.id) {
                tracing::warn!(job_id = node.id, "Duplicate job in dependency feed, keeping first");
                continue;
            }
            index.insert(node.id, graph.add_node(node.id));
            kept.push(node);
        }

        let mut skipped = Vec::new();
        let mut accepted = Vec::with_capacity(edges.len());
        let mut seen = HashSet::with_capacity(edges.len());

        for edge in edges {
            let Some(&from) = index.get(&edge.source) else {
                skipped.push(SkippedEdge {
                    edge,
                    reason: GraphDataError::UnknownSource(edge.source),
                });
                continue;
            };
            let Some(&to) = index.get(&edge.target) else {
                skipped.push(SkippedEdge {
                    edge,
                    reason: GraphDataError::UnknownTarget(edge.target),
                });
                continue;
            };
            if !seen.insert((edge.source, edge.target)) {
                skipped.push(SkippedEdge {
                    edge,
                    reason: GraphDataError::DuplicateEdge,
                });
                continue;
            }
            graph.add_edge(from, to, ());
            accepted.push(edge);
        }

        let broken = break_cycles(&mut graph);
        for &(source, target) in &broken {
            tracing::warn!(source, target, "Dependency cycle broken at edge");
            skipped.push(SkippedEdge {
                edge: DependencyEdge { source, target },
                reason: GraphDataError::CycleBroken,
            });
        }

        let levels = longest_path_levels(&graph);

        let nodes = kept
            .into_iter()
            .enumerate()
            .map(|(i, job)| {
                let idx = NodeIndex::new(i);
                DependencyNode {
                    id: job.id,
                    name: job.name,
                    status: job.status,
                    enabled: job.enabled,
                    level: levels[i],
                    incoming: graph.neighbors_directed(idx, Direction::Incoming).count() as u32,
                    outgoing: graph.neighbors_directed(idx, Direction::Outgoing).count() as u32,
                }
            })
            .collect();

        let edges = accepted
            .into_iter()
            .filter(|e| !broken.contains(&(e.source, e.target)))
            .collect();

        LeveledGraph {
            nodes,
            edges,
            skipped,
        }
    }
}

/// Remove every back edge found by a DFS seeded with the roots (in input
/// order) followed by all nodes. Returns the removed `(source, target)`
/// pairs. The remaining graph is acyclic.
fn break_cycles(graph: &mut DiGraph<JobId, ()>) -> HashSet<(JobId, JobId)> {
    let roots: Vec<NodeIndex> = graph
        .node_indices()
        .filter(|&n| {
            graph
                .neighbors_directed(n, Direction::Incoming)
                .next()
                .is_none()
        })
        .collect();
    let starts: Vec<NodeIndex> = roots.into_iter().chain(graph.node_indices()).collect();

    let mut back_edges = Vec::new();
    depth_first_search(&*graph, starts, |event| {
        if let DfsEvent::BackEdge(u, v) = event {
            back_edges.push((u, v));
        }
    });

    let mut broken = HashSet::with_capacity(back_edges.len());
    for (u, v) in back_edges {
        if let Some(edge) = graph.find_edge(u, v) {
            graph.remove_edge(edge);
        }
        broken.insert((graph[u], graph[v]));
    }
    broken
}

/// Longest distance from a root for every node, indexed by node index.
fn longest_path_levels(graph: &DiGraph<JobId, ()>) -> Vec<u32> {
    let order: Vec<NodeIndex> = match petgraph::algo::toposort(graph, None) {
        Ok(order) => order,
        Err(cycle) => {
            // Unreachable once back edges are removed; keep going with
            // insertion order rather than failing the whole graph.
            tracing::error!(job_id = graph[cycle.node_id()], "Cycle left after breaking back edges");
            graph.node_indices().collect()
        }
    };

    let mut levels = vec![0u32; graph.node_count()];
    for node in order {
        let next = levels[node.index()] + 1;
        for target in graph.neighbors(node) {
            if levels[target.index()] < next {
                levels[target.index()] = next;
            }
        }
    }
    levels
}
