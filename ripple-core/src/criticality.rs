//! Stability regimes and contagion candidates
//!
//! Divergence scores map onto four ordered regimes through configurable
//! thresholds. A node is a contagion candidate only when it is both volatile
//! (critical or chaotic) and structurally central, so isolated but noisy
//! locations are not flagged.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::{
    AnalyticSignal, CriticalityConfig, EchoReport, RegimeThresholds, RelationGraph, SignalSource,
    MAX_GROWTH,
};

/// Stability regime, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StabilityRegime {
    Stable,
    Watch,
    Critical,
    Chaotic,
}

impl StabilityRegime {
    /// Map a divergence score onto a regime; monotone in `score`
    pub fn classify(score: f64, thresholds: &RegimeThresholds) -> Self {
        if score >= thresholds.chaotic {
            StabilityRegime::Chaotic
        } else if score >= thresholds.critical {
            StabilityRegime::Critical
        } else if score >= thresholds.watch {
            StabilityRegime::Watch
        } else {
            StabilityRegime::Stable
        }
    }

    /// Critical or chaotic
    pub fn is_volatile(self) -> bool {
        self >= StabilityRegime::Critical
    }

    /// Confidence attached to the propagation signal in this regime
    pub fn predictability(self) -> f64 {
        match self {
            StabilityRegime::Stable => 0.9,
            StabilityRegime::Watch => 0.75,
            StabilityRegime::Critical => 0.6,
            StabilityRegime::Chaotic => 0.4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StabilityRegime::Stable => "stable",
            StabilityRegime::Watch => "watch",
            StabilityRegime::Critical => "critical",
            StabilityRegime::Chaotic => "chaotic",
        }
    }
}

impl fmt::Display for StabilityRegime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Regime assessment of a single node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAssessment {
    pub node_id: String,
    pub regime: StabilityRegime,
    pub score: f64,
    pub weighted_degree: f64,
    pub contagion_candidate: bool,
}

/// A node capable of carrying volatility further through the network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContagionCandidate {
    pub node_id: String,
    pub regime: StabilityRegime,
    pub weighted_degree: f64,
    pub amplification: f64,
}

/// Classification of one graph (region)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticalityReport {
    /// Regime of the region as a whole
    pub regime: StabilityRegime,
    pub score: f64,
    pub nodes: Vec<NodeAssessment>,
    pub contagion: Vec<ContagionCandidate>,
    /// Weighted degree a node needed to be considered central
    pub centrality_cutoff: f64,
    pub overflowed: bool,
    /// Propagation-derived input for the arbiter; absent without seeds
    pub signal: Option<AnalyticSignal>,
}

impl CriticalityReport {
    pub fn node(&self, id: &str) -> Option<&NodeAssessment> {
        self.nodes.iter().find(|n| n.node_id == id)
    }

    pub fn count(&self, regime: StabilityRegime) -> usize {
        self.nodes.iter().filter(|n| n.regime == regime).count()
    }
}

/// Maps divergence metrics to regimes and flags contagion candidates
#[derive(Debug, Clone)]
pub struct CriticalityClassifier {
    config: CriticalityConfig,
}

impl CriticalityClassifier {
    pub fn new(config: CriticalityConfig) -> Self {
        Self { config }
    }

    pub fn classify(&self, score: f64) -> StabilityRegime {
        StabilityRegime::classify(score, &self.config.thresholds)
    }

    /// Classify every node of `graph` from its echo report
    pub fn assess(&self, graph: &RelationGraph, echo: &EchoReport) -> CriticalityReport {
        let degrees = graph.weighted_degrees();
        let cutoff = percentile(&degrees, self.config.centrality_percentile);

        let mut nodes = Vec::with_capacity(echo.nodes.len());
        let mut contagion = Vec::new();

        for (metrics, &degree) in echo.nodes.iter().zip(&degrees) {
            // Overflow is informative: treat it as the most severe outcome
            let regime = if metrics.overflowed {
                StabilityRegime::Chaotic
            } else {
                self.classify(metrics.score)
            };
            let central = degree > 0.0 && degree >= cutoff;
            let candidate = regime.is_volatile() && central;

            if candidate {
                contagion.push(ContagionCandidate {
                    node_id: metrics.node_id.clone(),
                    regime,
                    weighted_degree: degree,
                    amplification: metrics.amplification,
                });
            }

            nodes.push(NodeAssessment {
                node_id: metrics.node_id.clone(),
                regime,
                score: metrics.score,
                weighted_degree: degree,
                contagion_candidate: candidate,
            });
        }

        let regime = if echo.aggregate.overflowed {
            StabilityRegime::Chaotic
        } else {
            self.classify(echo.aggregate.score)
        };

        contagion.sort_by(|a, b| {
            b.regime
                .cmp(&a.regime)
                .then(b.weighted_degree.total_cmp(&a.weighted_degree))
                .then(a.node_id.cmp(&b.node_id))
        });

        debug!(
            "Region {} (score {:.4}), {} contagion candidate(s)",
            regime,
            echo.aggregate.score,
            contagion.len()
        );

        CriticalityReport {
            regime,
            score: echo.aggregate.score,
            nodes,
            contagion,
            centrality_cutoff: cutoff,
            overflowed: echo.aggregate.overflowed,
            signal: Some(self.propagation_signal(echo.baseline.terminal(), regime)),
        }
    }

    /// Report for a graph that received no shock: everything stable, no signal
    pub fn quiescent(&self, graph: &RelationGraph) -> CriticalityReport {
        let degrees = graph.weighted_degrees();
        let cutoff = percentile(&degrees, self.config.centrality_percentile);

        CriticalityReport {
            regime: StabilityRegime::Stable,
            score: -MAX_GROWTH,
            nodes: graph
                .ids()
                .iter()
                .zip(degrees)
                .map(|(id, degree)| NodeAssessment {
                    node_id: id.clone(),
                    regime: StabilityRegime::Stable,
                    score: -MAX_GROWTH,
                    weighted_degree: degree,
                    contagion_candidate: false,
                })
                .collect(),
            contagion: Vec::new(),
            centrality_cutoff: cutoff,
            overflowed: false,
            signal: None,
        }
    }

    /// Directional signal from where the shock settled
    pub fn propagation_signal(&self, terminal: &[f64], regime: StabilityRegime) -> AnalyticSignal {
        let mean = if terminal.is_empty() {
            0.0
        } else {
            terminal.iter().sum::<f64>() / terminal.len() as f64
        };

        AnalyticSignal::new(
            SignalSource::Propagation,
            (self.config.impact_gain * mean).tanh(),
            regime.predictability(),
        )
    }
}

/// Nearest-rank percentile of `values` (p in [0, 1])
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let rank = (p * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
