//! Echo analysis - sensitivity of the diffusion to small input changes
//!
//! Two runs are compared: the observed seeds (baseline) and the same seeds
//! nudged by `epsilon` away from zero (perturbed). The gap between them,
//! normalised by `epsilon`, is the echo discrepancy. Its late growth rate
//! separates contained shocks (decaying echo) from cascading ones (growing,
//! non-saturating echo); a flip-flopping echo marks bounded oscillation.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    DiffusionConfig, EchoConfig, OverflowReport, PerturbationSeed, RelationGraph, Simulator,
    Trajectory, DISCREPANCY_FLOOR,
};

/// Growth-rate clamp; unreached nodes sit at the lower end
pub const MAX_GROWTH: f64 = 5.0;

/// Per-node divergence metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDivergence {
    pub node_id: String,
    /// Peak |baseline delta| relative to the total seed magnitude
    pub amplification: f64,
    /// Step at which |baseline delta| peaked
    pub time_to_peak: usize,
    /// Mean per-step log growth of the echo over the late window
    pub growth_rate: f64,
    /// Fraction of sign flips in the echo's successive differences
    pub oscillation: f64,
    pub peak_discrepancy: f64,
    pub final_discrepancy: f64,
    /// Scalar fed to the regime thresholds
    pub score: f64,
    /// Node exceeded the safety bound in either run
    pub overflowed: bool,
}

/// Region-level aggregate over all nodes of one graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeDivergence {
    /// Mean node score weighted by weighted degree
    pub score: f64,
    pub max_score: f64,
    /// `(1 - cos(baseline, perturbed))` at the last step, per step
    pub decorrelation_rate: f64,
    pub peak_discrepancy: f64,
    /// Recorded states compared (after truncation)
    pub steps: usize,
    pub overflowed: bool,
}

/// Output of one echo analysis
#[derive(Debug, Clone)]
pub struct EchoReport {
    pub nodes: Vec<NodeDivergence>,
    pub aggregate: ScopeDivergence,
    /// Baseline run, truncated to the compared length
    pub baseline: Trajectory,
    pub overflow: Option<OverflowReport>,
}

impl EchoReport {
    pub fn node(&self, id: &str) -> Option<&NodeDivergence> {
        self.nodes.iter().find(|n| n.node_id == id)
    }
}

/// Runs baseline/perturbed pairs and derives divergence metrics
#[derive(Debug, Clone)]
pub struct EchoAnalyzer {
    simulator: Simulator,
    config: EchoConfig,
}

impl EchoAnalyzer {
    pub fn new(diffusion: DiffusionConfig, config: EchoConfig) -> Self {
        Self {
            simulator: Simulator::new(diffusion),
            config,
        }
    }

    /// Analyze how `seeds` echo through `graph`.
    ///
    /// Returns `None` when no non-zero seed lands in the graph.
    pub fn analyze(&self, graph: &RelationGraph, seeds: &[PerturbationSeed]) -> Option<EchoReport> {
        let (initial, placed) = Simulator::seed_vector(graph, seeds);
        let seed_mass: f64 = initial.iter().map(|d| d.abs()).sum();

        if placed == 0 || seed_mass == 0.0 {
            debug!("No effective seeds in graph of {} nodes", graph.node_count());
            return None;
        }

        let eps = self.config.epsilon;
        let perturbed_initial: Vec<f64> = initial
            .iter()
            .map(|&d| if d == 0.0 { 0.0 } else { d + eps * d.signum() })
            .collect();

        let baseline = self.simulator.run_from(graph, initial);
        let perturbed = self.simulator.run_from(graph, perturbed_initial);

        Some(self.compare(graph, baseline, perturbed, seed_mass))
    }

    /// Compare two trajectories of the same graph whose seeds differ by `epsilon`
    pub fn compare(
        &self,
        graph: &RelationGraph,
        mut baseline: Trajectory,
        mut perturbed: Trajectory,
        seed_mass: f64,
    ) -> EchoReport {
        let len = baseline.len().min(perturbed.len());
        baseline.truncate(len);
        perturbed.truncate(len);

        let mut overflowed = vec![false; graph.node_count()];
        for report in [baseline.overflow(), perturbed.overflow()].into_iter().flatten() {
            for &i in &report.nodes {
                overflowed[i] = true;
            }
        }
        let overflow = baseline
            .overflow()
            .or(perturbed.overflow())
            .cloned();

        let eps = self.config.epsilon;
        let nodes: Vec<NodeDivergence> = (0..graph.node_count())
            .map(|i| {
                let base = baseline.series(i);
                let echo: Vec<f64> = perturbed
                    .series(i)
                    .iter()
                    .zip(&base)
                    .map(|(p, b)| (p - b) / eps)
                    .collect();
                self.node_metrics(graph.id(i), &base, &echo, seed_mass, overflowed[i])
            })
            .collect();

        let aggregate = aggregate(graph, &nodes, &baseline, &perturbed, overflow.is_some());

        EchoReport {
            nodes,
            aggregate,
            baseline,
            overflow,
        }
    }

    fn node_metrics(
        &self,
        id: &str,
        base: &[f64],
        echo: &[f64],
        seed_mass: f64,
        overflowed: bool,
    ) -> NodeDivergence {
        let (time_to_peak, peak) = base
            .iter()
            .enumerate()
            .fold((0, 0.0_f64), |(at, best), (t, d)| {
                if d.abs() > best {
                    (t, d.abs())
                } else {
                    (at, best)
                }
            });

        let discrepancy: Vec<f64> = echo.iter().map(|e| e.abs()).collect();
        let growth_rate = growth_rate(&discrepancy);
        let oscillation = oscillation_index(echo);

        NodeDivergence {
            node_id: id.to_string(),
            amplification: peak / seed_mass,
            time_to_peak,
            growth_rate,
            oscillation,
            peak_discrepancy: discrepancy.iter().copied().fold(0.0, f64::max),
            final_discrepancy: discrepancy.last().copied().unwrap_or(0.0),
            score: growth_rate + self.config.oscillation_weight * oscillation,
            overflowed,
        }
    }
}

/// Mean log growth over the second half of the series.
///
/// Falls back to the whole series when the late window has no usable pair.
fn growth_rate(discrepancy: &[f64]) -> f64 {
    let log_ratios = |from: usize| -> Vec<f64> {
        discrepancy
            .windows(2)
            .skip(from)
            .filter(|w| w[0] > DISCREPANCY_FLOOR && w[1] > DISCREPANCY_FLOOR)
            .map(|w| (w[1] / w[0]).ln().clamp(-MAX_GROWTH, MAX_GROWTH))
            .collect()
    };

    let mut ratios = log_ratios(discrepancy.len() / 2);
    if ratios.is_empty() {
        ratios = log_ratios(0);
    }

    if ratios.is_empty() {
        let reached = discrepancy.iter().any(|d| *d > DISCREPANCY_FLOOR);
        return if reached { 0.0 } else { -MAX_GROWTH };
    }

    ratios.iter().sum::<f64>() / ratios.len() as f64
}

/// Fraction of sign changes between successive non-negligible differences
fn oscillation_index(echo: &[f64]) -> f64 {
    let diffs: Vec<f64> = echo
        .windows(2)
        .map(|w| w[1] - w[0])
        .filter(|d| d.abs() > DISCREPANCY_FLOOR)
        .collect();

    if diffs.len() < 3 {
        return 0.0;
    }

    let flips = diffs
        .windows(2)
        .filter(|w| w[0].signum() != w[1].signum())
        .count();
    flips as f64 / (diffs.len() - 1) as f64
}

fn aggregate(
    graph: &RelationGraph,
    nodes: &[NodeDivergence],
    baseline: &Trajectory,
    perturbed: &Trajectory,
    overflowed: bool,
) -> ScopeDivergence {
    let mut weights = graph.weighted_degrees();
    if weights.iter().all(|w| *w == 0.0) {
        weights.iter_mut().for_each(|w| *w = 1.0);
    }
    let total: f64 = weights.iter().sum();
    let score = nodes
        .iter()
        .zip(&weights)
        .map(|(n, w)| n.score * w)
        .sum::<f64>()
        / total;

    let max_score = nodes
        .iter()
        .map(|n| n.score)
        .fold(f64::NEG_INFINITY, f64::max);

    let steps = baseline.len();
    let decorrelation_rate = if steps > 1 {
        (1.0 - cosine(baseline.terminal(), perturbed.terminal())) / (steps - 1) as f64
    } else {
        0.0
    };

    ScopeDivergence {
        score,
        max_score,
        decorrelation_rate,
        peak_discrepancy: nodes
            .iter()
            .map(|n| n.peak_discrepancy)
            .fold(0.0, f64::max),
        steps,
        overflowed,
    }
}

/// Cosine similarity; two zero vectors count as identical
fn cosine(x: &[f64], y: &[f64]) -> f64 {
    let dot: f64 = x.iter().zip(y).map(|(a, b)| a * b).sum();
    let nx = x.iter().map(|a| a * a).sum::<f64>().sqrt();
    let ny = y.iter().map(|b| b * b).sum::<f64>().sqrt();

    if nx == 0.0 || ny == 0.0 {
        return if nx == ny { 1.0 } else { 0.0 };
    }
    (dot / (nx * ny)).clamp(-1.0, 1.0)
}
