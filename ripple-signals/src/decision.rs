//! Arbitrated decisions and the fusion rule that produces them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use ripple_core::{AnalyticSignal, ArbiterConfig, CoreError, SignalSource};

/// Directional recommendation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Buy,
    Hold,
    Sell,
}

impl Direction {
    /// Map a fused value onto a label; values exactly on a threshold hold
    pub fn from_value(value: f64, buy_threshold: f64, sell_threshold: f64) -> Self {
        if value > buy_threshold {
            Direction::Buy
        } else if value < sell_threshold {
            Direction::Sell
        } else {
            Direction::Hold
        }
    }

    /// Tie-break preference when votes are even: the most conservative wins
    pub fn caution(self) -> u8 {
        match self {
            Direction::Hold => 2,
            Direction::Sell => 1,
            Direction::Buy => 0,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Direction::Buy => "BUY",
            Direction::Hold => "HOLD",
            Direction::Sell => "SELL",
        };
        f.write_str(label)
    }
}

/// One input's share in a fused decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub source: SignalSource,
    pub value: f64,
    pub confidence: f64,
    pub trust: f64,
    /// Normalised effective weight (all contributions sum to 1)
    pub weight: f64,
}

/// Why a decision came out the way it did
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rationale {
    pub contributions: Vec<Contribution>,
    pub fused_value: f64,
    /// 1 - weighted variance of the inputs around the fused value
    pub agreement: f64,
    /// Weighted mean of the inputs' own confidences
    pub mean_confidence: f64,
    /// Set when the decision is the aggregate of a consensus ensemble
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus_agreement: Option<f64>,
}

/// Fused recommendation for one target entity; immutable once produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbitratedDecision {
    pub id: Uuid,
    pub entity_id: String,
    pub direction: Direction,
    pub confidence: f64,
    pub rationale: Rationale,
    pub decided_at: DateTime<Utc>,
}

impl ArbitratedDecision {
    /// Supersede `base` with an ensemble outcome, keeping its rationale
    pub fn with_consensus(base: &ArbitratedDecision, direction: Direction, confidence: f64, agreement: f64) -> Self {
        let mut rationale = base.rationale.clone();
        rationale.consensus_agreement = Some(agreement);

        Self {
            id: Uuid::new_v4(),
            entity_id: base.entity_id.clone(),
            direction,
            confidence: confidence.clamp(0.0, 1.0),
            rationale,
            decided_at: Utc::now(),
        }
    }
}

/// Fuse signals into a decision.
///
/// Each input weighs `confidence × trust(source)`. Confidence of the result is
/// agreement (inverse weighted variance) scaled by the inputs' mean
/// confidence, so a consistent but unsure set does not win on magnitude alone.
pub fn fuse(
    entity_id: &str,
    signals: &[AnalyticSignal],
    config: &ArbiterConfig,
) -> Result<ArbitratedDecision, CoreError> {
    let raw: Vec<(&AnalyticSignal, f64, f64)> = signals
        .iter()
        .map(|s| {
            let trust = config.trust_for(&s.source);
            (s, trust, s.confidence * trust)
        })
        .collect();

    let total: f64 = raw.iter().map(|(_, _, w)| w).sum();
    if !(total.is_finite() && total > 0.0) {
        return Err(CoreError::NoSignal(format!(
            "{} signal(s) for {} carry no weight",
            signals.len(),
            entity_id
        )));
    }

    let fused = (raw.iter().map(|(s, _, w)| w * s.value).sum::<f64>() / total).clamp(-1.0, 1.0);
    let variance = raw
        .iter()
        .map(|(s, _, w)| w * (s.value - fused).powi(2))
        .sum::<f64>()
        / total;
    let agreement = (1.0 - variance).clamp(0.0, 1.0);
    let mean_confidence = raw.iter().map(|(s, _, w)| w * s.confidence).sum::<f64>() / total;

    let contributions = raw
        .iter()
        .map(|(s, trust, w)| Contribution {
            source: s.source.clone(),
            value: s.value,
            confidence: s.confidence,
            trust: *trust,
            weight: w / total,
        })
        .collect();

    Ok(ArbitratedDecision {
        id: Uuid::new_v4(),
        entity_id: entity_id.to_string(),
        direction: Direction::from_value(fused, config.buy_threshold, config.sell_threshold),
        confidence: (agreement * mean_confidence).clamp(0.0, 1.0),
        rationale: Rationale {
            contributions,
            fused_value: fused,
            agreement,
            mean_confidence,
            consensus_agreement: None,
        },
        decided_at: Utc::now(),
    })
}
