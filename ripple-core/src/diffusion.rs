//! Discrete-step diffusion of sentiment shocks
//!
//! At every step each node keeps a fraction of its own delta (reversion toward
//! zero) and receives inflow from its neighbours proportional to edge weight:
//!
//! `δ[t+1][i] = retention · δ[t][i] + coupling · Σ w(i,j) · δ[t][j]`
//!
//! The step loop is strictly sequential and fully deterministic. A run stops
//! early when any delta leaves the safety bound.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{CoreError, DiffusionConfig, PerturbationSeed, RelationGraph};

/// Report attached to a trajectory that hit the safety bound
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverflowReport {
    /// First step whose state exceeded the bound (not kept in the trajectory;
    /// at step 0 the seeds are kept clamped to the bound)
    pub step: usize,
    /// Node indices whose delta exceeded the bound or became non-finite
    pub nodes: Vec<usize>,
    /// Largest finite magnitude observed at that step
    pub magnitude: f64,
    pub bound: f64,
}

impl OverflowReport {
    pub fn to_error(&self) -> CoreError {
        CoreError::DivergenceOverflow {
            step: self.step,
            magnitude: self.magnitude,
            bound: self.bound,
        }
    }
}

/// Per-step node deltas of one simulation run; step 0 holds the injected seeds
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    steps: Vec<Vec<f64>>,
    overflow: Option<OverflowReport>,
}

impl Trajectory {
    pub fn steps(&self) -> &[Vec<f64>] {
        &self.steps
    }

    /// Number of recorded states (including step 0)
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.steps.first().map_or(0, Vec::len)
    }

    pub fn delta(&self, step: usize, node: usize) -> f64 {
        self.steps[step][node]
    }

    pub fn initial(&self) -> &[f64] {
        &self.steps[0]
    }

    /// Deltas at the last recorded step
    pub fn terminal(&self) -> &[f64] {
        self.steps.last().map_or(&[], Vec::as_slice)
    }

    /// One node's delta over time
    pub fn series(&self, node: usize) -> Vec<f64> {
        self.steps.iter().map(|s| s[node]).collect()
    }

    pub fn overflow(&self) -> Option<&OverflowReport> {
        self.overflow.as_ref()
    }

    pub fn overflowed(&self) -> bool {
        self.overflow.is_some()
    }

    /// Largest |delta| anywhere in the trajectory
    pub fn peak_magnitude(&self) -> f64 {
        self.steps
            .iter()
            .flatten()
            .fold(0.0_f64, |acc, d| acc.max(d.abs()))
    }

    /// Drop every state after `len`
    pub fn truncate(&mut self, len: usize) {
        self.steps.truncate(len.max(1));
    }
}

/// Runs the diffusion process over a relationship graph
#[derive(Debug, Clone)]
pub struct Simulator {
    config: DiffusionConfig,
}

impl Simulator {
    pub fn new(config: DiffusionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DiffusionConfig {
        &self.config
    }

    /// Map seeds onto node indices, summing seeds on the same node.
    ///
    /// Returns the initial vector and how many seeds landed in the graph.
    pub fn seed_vector(graph: &RelationGraph, seeds: &[PerturbationSeed]) -> (Vec<f64>, usize) {
        let mut initial = vec![0.0; graph.node_count()];
        let mut placed = 0;

        for seed in seeds {
            if !seed.magnitude.is_finite() {
                warn!("Dropping non-finite seed for {}", seed.node_id);
                continue;
            }
            match graph.index_of(&seed.node_id) {
                Some(idx) => {
                    initial[idx] += seed.magnitude;
                    placed += 1;
                }
                None => debug!("Seed for {} is outside the graph", seed.node_id),
            }
        }

        (initial, placed)
    }

    /// Simulate from a set of seeds
    pub fn run(&self, graph: &RelationGraph, seeds: &[PerturbationSeed]) -> Trajectory {
        let (initial, _) = Self::seed_vector(graph, seeds);
        self.run_from(graph, initial)
    }

    /// Simulate from an explicit initial delta vector.
    ///
    /// The safety bound applies to every step including step 0. An initial
    /// vector outside the bound is reported as an overflow at step 0 and kept
    /// only in clamped form, so the trajectory never holds an out-of-bound delta.
    pub fn run_from(&self, graph: &RelationGraph, initial: Vec<f64>) -> Trajectory {
        let bound = self.config.safety_bound;

        if let Some(report) = self.check_bound(graph, 0, &initial) {
            let clamped = initial
                .iter()
                .map(|d| if d.is_finite() { d.clamp(-bound, bound) } else { 0.0 })
                .collect();
            return Trajectory {
                steps: vec![clamped],
                overflow: Some(report),
            };
        }

        let mut steps = Vec::with_capacity(self.config.steps + 1);
        steps.push(initial);

        for t in 1..=self.config.steps {
            let next = self.step(graph, &steps[t - 1]);

            if let Some(report) = self.check_bound(graph, t, &next) {
                return Trajectory {
                    steps,
                    overflow: Some(report),
                };
            }

            steps.push(next);
        }

        Trajectory {
            steps,
            overflow: None,
        }
    }

    /// Overflow report for `deltas` at step `t`, if any node leaves the bound
    fn check_bound(&self, graph: &RelationGraph, t: usize, deltas: &[f64]) -> Option<OverflowReport> {
        let bound = self.config.safety_bound;
        let offending: Vec<usize> = deltas
            .iter()
            .enumerate()
            .filter(|(_, d)| !d.is_finite() || d.abs() > bound)
            .map(|(i, _)| i)
            .collect();

        let first = *offending.first()?;
        let magnitude = offending
            .iter()
            .map(|&i| deltas[i].abs())
            .filter(|m| m.is_finite())
            .fold(0.0_f64, f64::max);

        let report = OverflowReport {
            step: t,
            nodes: offending,
            magnitude,
            bound,
        };
        warn!(
            "{} (first offender {}), truncating trajectory",
            report.to_error(),
            graph.id(first)
        );
        Some(report)
    }

    /// Advance one step
    pub fn step(&self, graph: &RelationGraph, prev: &[f64]) -> Vec<f64> {
        let retention = self.config.retention();
        (0..graph.node_count())
            .map(|i| retention * prev[i] + self.inflow(graph, i, prev))
            .collect()
    }

    /// Total neighbour inflow into `node` given the previous state
    pub fn inflow(&self, graph: &RelationGraph, node: usize, prev: &[f64]) -> f64 {
        graph
            .neighbors(node)
            .iter()
            .map(|n| self.config.coupling * n.weight * prev[n.node])
            .sum()
    }
}
