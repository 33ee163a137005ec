//! Relationship graph over locations
//!
//! The graph is a pure function of the node set: it is rebuilt from scratch on
//! every run and never mutated afterwards. Three edge kinds link locations:
//! - **Geographic**: within a distance threshold, weight falls off linearly
//! - **Brand**: shared brand, weight grows as the brand gets rarer
//! - **Category**: shared category, same shape with its own scale
//!
//! Several kinds between the same pair stay separate edges.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::{CoreError, GraphConfig, LocationNode};

/// Kinds of relationship between two locations
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Geographic,
    Brand,
    Category,
}

/// An undirected, weighted edge between node indices (`a < b`)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub a: usize,
    pub b: usize,
    pub kind: EdgeKind,
    /// Weight in (0, 1]
    pub weight: f64,
}

impl Edge {
    fn new(i: usize, j: usize, kind: EdgeKind, weight: f64) -> Self {
        let (a, b) = if i < j { (i, j) } else { (j, i) };
        Self { a, b, kind, weight }
    }

    /// The endpoint opposite `node`
    pub fn other(&self, node: usize) -> usize {
        if self.a == node {
            self.b
        } else {
            self.a
        }
    }
}

/// An incident edge as seen from one endpoint
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub node: usize,
    pub kind: EdgeKind,
    pub weight: f64,
}

/// Weighted multigraph over a fixed, id-ordered node list
#[derive(Debug, Clone)]
pub struct RelationGraph {
    ids: Vec<String>,
    index: HashMap<String, usize>,
    edges: Vec<Edge>,
    adjacency: Vec<Vec<Neighbor>>,
}

impl RelationGraph {
    /// Build a graph from explicit node ids and `(a, b, kind, weight)` edges.
    ///
    /// Self-edges, unknown ids and weights outside (0, 1] are dropped.
    pub fn from_edges<S: AsRef<str>>(
        node_ids: &[S],
        edges: &[(S, S, EdgeKind, f64)],
    ) -> Result<Self, CoreError> {
        let mut ids: Vec<String> = node_ids
            .iter()
            .map(|s| {
                let id: &str = s.as_ref();
                id.to_string()
            })
            .collect();
        ids.sort();
        ids.dedup();

        if ids.len() < 2 {
            return Err(CoreError::EmptyGraph { eligible: ids.len() });
        }

        let index: HashMap<String, usize> =
            ids.iter().enumerate().map(|(i, id)| (id.clone(), i)).collect();

        let resolved = edges
            .iter()
            .filter_map(|(a, b, kind, weight)| {
                let (a, b): (&str, &str) = (a.as_ref(), b.as_ref());
                let i = *index.get(a)?;
                let j = *index.get(b)?;
                (i != j && is_valid_weight(*weight)).then(|| Edge::new(i, j, *kind, *weight))
            })
            .collect();

        Ok(Self::assemble(ids, index, resolved))
    }

    fn assemble(ids: Vec<String>, index: HashMap<String, usize>, mut edges: Vec<Edge>) -> Self {
        edges.sort_by(|x, y| (x.a, x.b, x.kind).cmp(&(y.a, y.b, y.kind)));

        let mut adjacency = vec![Vec::new(); ids.len()];
        for edge in &edges {
            adjacency[edge.a].push(Neighbor {
                node: edge.b,
                kind: edge.kind,
                weight: edge.weight,
            });
            adjacency[edge.b].push(Neighbor {
                node: edge.a,
                kind: edge.kind,
                weight: edge.weight,
            });
        }

        Self {
            ids,
            index,
            edges,
            adjacency,
        }
    }

    pub fn node_count(&self) -> usize {
        self.ids.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn id(&self, node: usize) -> &str {
        &self.ids[node]
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn neighbors(&self, node: usize) -> &[Neighbor] {
        &self.adjacency[node]
    }

    pub fn degree(&self, node: usize) -> usize {
        self.adjacency[node].len()
    }

    /// Sum of incident edge weights (degree-weighted centrality)
    pub fn weighted_degree(&self, node: usize) -> f64 {
        self.adjacency[node].iter().map(|n| n.weight).sum()
    }

    pub fn weighted_degrees(&self) -> Vec<f64> {
        (0..self.node_count()).map(|i| self.weighted_degree(i)).collect()
    }

    pub fn stats(&self) -> GraphStats {
        let mut by_kind = BTreeMap::new();
        for edge in &self.edges {
            *by_kind.entry(edge.kind).or_insert(0usize) += 1;
        }

        let max_degree = (0..self.node_count())
            .map(|i| self.degree(i))
            .max()
            .unwrap_or(0);
        let isolated = (0..self.node_count()).filter(|&i| self.degree(i) == 0).count();
        let total_weight: f64 = self.edges.iter().map(|e| e.weight).sum();

        GraphStats {
            nodes: self.node_count(),
            edges: self.edge_count(),
            edges_by_kind: by_kind,
            max_degree,
            isolated_nodes: isolated,
            mean_weighted_degree: 2.0 * total_weight / self.node_count().max(1) as f64,
        }
    }
}

/// Graph summary statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphStats {
    pub nodes: usize,
    pub edges: usize,
    pub edges_by_kind: BTreeMap<EdgeKind, usize>,
    pub max_degree: usize,
    pub isolated_nodes: usize,
    pub mean_weighted_degree: f64,
}

/// Builds relationship graphs from location snapshots
#[derive(Debug, Clone)]
pub struct GraphBuilder {
    config: GraphConfig,
}

impl GraphBuilder {
    pub fn new(config: GraphConfig) -> Self {
        Self { config }
    }

    /// Build the capped multigraph over the eligible subset of `nodes`
    pub fn build<'a, I>(&self, nodes: I) -> Result<RelationGraph, CoreError>
    where
        I: IntoIterator<Item = &'a LocationNode>,
    {
        let mut eligible: Vec<&LocationNode> = nodes.into_iter().filter(|n| n.is_eligible()).collect();
        eligible.sort_by(|a, b| a.id.cmp(&b.id));
        eligible.dedup_by(|later, earlier| later.id == earlier.id);

        if eligible.len() < 2 {
            return Err(CoreError::EmptyGraph {
                eligible: eligible.len(),
            });
        }

        let mut edges = Vec::new();
        if self.config.geographic_edges {
            self.geographic_edges(&eligible, &mut edges);
        }
        if self.config.brand_edges {
            group_edges(
                &eligible,
                |n| n.brand.as_str(),
                EdgeKind::Brand,
                self.config.brand_weight_scale,
                &mut edges,
            );
        }
        if self.config.category_edges {
            group_edges(
                &eligible,
                |n| n.category.as_str(),
                EdgeKind::Category,
                self.config.category_weight_scale,
                &mut edges,
            );
        }

        let candidates = edges.len();
        let edges = cap_edges(eligible.len(), edges, self.config.max_edges_per_node);
        debug!(
            "Built graph: {} nodes, {} edges ({} before top-{} cap)",
            eligible.len(),
            edges.len(),
            candidates,
            self.config.max_edges_per_node
        );

        let ids: Vec<String> = eligible.iter().map(|n| n.id.clone()).collect();
        let index = ids.iter().enumerate().map(|(i, id)| (id.clone(), i)).collect();
        Ok(RelationGraph::assemble(ids, index, edges))
    }

    fn geographic_edges(&self, nodes: &[&LocationNode], out: &mut Vec<Edge>) {
        let max = self.config.geo_max_distance_km;
        for i in 0..nodes.len() {
            for j in (i + 1)..nodes.len() {
                let d = nodes[i].coordinates.distance_km(&nodes[j].coordinates);
                if d < max {
                    out.push(Edge::new(i, j, EdgeKind::Geographic, 1.0 - d / max));
                }
            }
        }
    }
}

/// Link every pair sharing a key; weight = scale / (members - 1), capped at 1
fn group_edges<F>(nodes: &[&LocationNode], key: F, kind: EdgeKind, scale: f64, out: &mut Vec<Edge>)
where
    F: Fn(&LocationNode) -> &str,
{
    let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, node) in nodes.iter().enumerate() {
        let k = key(*node);
        if !k.is_empty() {
            groups.entry(k).or_default().push(i);
        }
    }

    for members in groups.values().filter(|m| m.len() >= 2) {
        let weight = (scale / (members.len() - 1) as f64).min(1.0);
        for (x, &i) in members.iter().enumerate() {
            for &j in &members[x + 1..] {
                out.push(Edge::new(i, j, kind, weight));
            }
        }
    }
}

/// Degree-bounded greedy cap: heaviest edges first, at most `k` per node.
///
/// Edges of equal weight and kind form a tier that is taken in rounds; in
/// round `r` an edge is accepted only while both endpoints have fewer than `r`
/// edges, so a large brand or category shares its capacity across all members
/// instead of saturating the lowest ids.
fn cap_edges(node_count: usize, mut edges: Vec<Edge>, k: usize) -> Vec<Edge> {
    edges.sort_by(rank);

    let mut degree = vec![0usize; node_count];
    let mut kept = Vec::with_capacity(edges.len().min(node_count.saturating_mul(k)));
    let mut start = 0;

    while start < edges.len() {
        let head = edges[start];
        let end = start
            + edges[start..]
                .iter()
                .take_while(|e| e.weight == head.weight && e.kind == head.kind)
                .count();

        let mut pending: Vec<Edge> = edges[start..end].to_vec();
        let mut round = 1;
        while !pending.is_empty() && round <= k {
            pending.retain(|edge| {
                let (da, db) = (degree[edge.a], degree[edge.b]);
                if da >= k || db >= k {
                    return false;
                }
                if da < round && db < round {
                    degree[edge.a] += 1;
                    degree[edge.b] += 1;
                    kept.push(*edge);
                    return false;
                }
                true
            });
            round += 1;
        }

        start = end;
    }

    kept
}

/// Heavier first; ties by kind, then by endpoint indices
fn rank(x: &Edge, y: &Edge) -> Ordering {
    y.weight
        .total_cmp(&x.weight)
        .then(x.kind.cmp(&y.kind))
        .then(x.a.cmp(&y.a))
        .then(x.b.cmp(&y.b))
}

fn is_valid_weight(w: f64) -> bool {
    w.is_finite() && w > 0.0 && w <= 1.0
}
