//! Cycle and scope reports

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ripple_core::{
    ContagionCandidate, CriticalityReport, ErrorKind, GraphStats, OverflowReport, StabilityRegime,
};
use ripple_signals::{ArbitratedDecision, ArbiterState, Direction, EnsembleResult};

use crate::TargetScope;

/// Outcome of one scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScopeStatus {
    /// A decision was reached
    Decided {
        decision: ArbitratedDecision,
        consensus: EnsembleResult,
    },
    /// Not enough signal to decide; distinct from a HOLD
    NoDecision { reason: String },
    /// The scope could not be evaluated
    Skipped {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<ErrorKind>,
        message: String,
    },
}

/// Everything produced for one scope in a cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeReport {
    pub scope: TargetScope,
    pub entity_id: String,
    /// Snapshot nodes the scope selected (before eligibility filtering)
    pub selected_nodes: usize,
    /// Seeds that landed on a node of the scope's graph
    pub seeds_placed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph: Option<GraphStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criticality: Option<CriticalityReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overflow: Option<OverflowReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arbiter_state: Option<ArbiterState>,
    pub status: ScopeStatus,
    pub elapsed_ms: u64,
}

impl ScopeReport {
    pub fn decision(&self) -> Option<&ArbitratedDecision> {
        match &self.status {
            ScopeStatus::Decided { decision, .. } => Some(decision),
            _ => None,
        }
    }

    pub fn direction(&self) -> Option<Direction> {
        self.decision().map(|d| d.direction)
    }

    pub fn regime(&self) -> Option<StabilityRegime> {
        self.criticality.as_ref().map(|c| c.regime)
    }

    pub fn contagion(&self) -> &[ContagionCandidate] {
        self.criticality
            .as_ref()
            .map(|c| c.contagion.as_slice())
            .unwrap_or(&[])
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.status, ScopeStatus::Skipped { .. })
    }
}

/// Result of one evaluation cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub snapshot_taken_at: DateTime<Utc>,
    pub snapshot_nodes: usize,
    pub seeds: usize,
    pub scopes: Vec<ScopeReport>,
}

impl CycleReport {
    pub fn scope(&self, entity_id: &str) -> Option<&ScopeReport> {
        self.scopes.iter().find(|s| s.entity_id == entity_id)
    }

    /// (decided, no decision, skipped)
    pub fn counts(&self) -> (usize, usize, usize) {
        self.scopes.iter().fold((0, 0, 0), |(d, n, s), scope| match scope.status {
            ScopeStatus::Decided { .. } => (d + 1, n, s),
            ScopeStatus::NoDecision { .. } => (d, n + 1, s),
            ScopeStatus::Skipped { .. } => (d, n, s + 1),
        })
    }
}
