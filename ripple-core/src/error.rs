//! Error taxonomy shared across the engine
//!
//! Every error belongs to one of three kinds. Input insufficiency and numeric
//! safety are recovered at the scope they occur in; configuration errors abort
//! a cycle before any simulation starts.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How an error propagates through an evaluation cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Not enough data for a scope; the scope is skipped
    InputInsufficiency,
    /// A computation left its numeric safety envelope; results are truncated
    NumericSafety,
    /// Misconfigured deployment; the whole cycle is aborted
    Configuration,
}

impl ErrorKind {
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorKind::Configuration)
    }
}

/// Errors from the propagation core
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    #[error("Empty graph: {eligible} eligible node(s), at least 2 required")]
    EmptyGraph { eligible: usize },

    #[error("Divergence overflow at step {step}: |delta| = {magnitude:.3} exceeds bound {bound}")]
    DivergenceOverflow {
        step: usize,
        magnitude: f64,
        bound: f64,
    },

    #[error("No signal: {0}")]
    NoSignal(String),

    #[error("Invalid ensemble size: {0} (must be at least 1)")]
    InvalidEnsembleSize(usize),

    #[error("Malformed regime thresholds: {0}")]
    MalformedThresholds(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::EmptyGraph { .. } | CoreError::NoSignal(_) => ErrorKind::InputInsufficiency,
            CoreError::DivergenceOverflow { .. } => ErrorKind::NumericSafety,
            CoreError::InvalidEnsembleSize(_)
            | CoreError::MalformedThresholds(_)
            | CoreError::InvalidConfig(_) => ErrorKind::Configuration,
        }
    }

    /// Short stable name, used in reports
    pub fn name(&self) -> &'static str {
        match self {
            CoreError::EmptyGraph { .. } => "empty_graph",
            CoreError::DivergenceOverflow { .. } => "divergence_overflow",
            CoreError::NoSignal(_) => "no_signal",
            CoreError::InvalidEnsembleSize(_) => "invalid_ensemble_size",
            CoreError::MalformedThresholds(_) => "malformed_thresholds",
            CoreError::InvalidConfig(_) => "invalid_config",
        }
    }
}
