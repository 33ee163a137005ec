//! Analytic signals consumed by the arbiter
//!
//! Signals are normalised opinions about a target entity:
//! - a value in [-1, 1] (negative = bearish, positive = bullish)
//! - a confidence weight in [0, 1]
//! - a source tag identifying the producer

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies the producer of an analytic signal
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SignalSource {
    /// Causal-depth analysis
    Causal,
    /// Temporal-pattern analysis
    Temporal,
    /// Topological structure analysis
    Topological,
    /// Derived from the diffusion / criticality pipeline
    Propagation,
    /// Any other named producer
    Custom(String),
}

impl SignalSource {
    pub fn as_str(&self) -> &str {
        match self {
            SignalSource::Causal => "causal",
            SignalSource::Temporal => "temporal",
            SignalSource::Topological => "topological",
            SignalSource::Propagation => "propagation",
            SignalSource::Custom(name) => name,
        }
    }
}

impl From<String> for SignalSource {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "causal" => SignalSource::Causal,
            "temporal" => SignalSource::Temporal,
            "topological" => SignalSource::Topological,
            "propagation" => SignalSource::Propagation,
            _ => SignalSource::Custom(value),
        }
    }
}

impl From<&str> for SignalSource {
    fn from(value: &str) -> Self {
        SignalSource::from(value.to_string())
    }
}

impl From<SignalSource> for String {
    fn from(value: SignalSource) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for SignalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalised signal about one target entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticSignal {
    pub source: SignalSource,
    /// Directional value in [-1, 1]
    pub value: f64,
    /// Producer's confidence in [0, 1]
    pub confidence: f64,
}

impl AnalyticSignal {
    /// Create a signal, clamping value and confidence into range.
    /// Non-finite inputs collapse to zero.
    pub fn new(source: impl Into<SignalSource>, value: f64, confidence: f64) -> Self {
        Self {
            source: source.into(),
            value: finite_or_zero(value).clamp(-1.0, 1.0),
            confidence: finite_or_zero(confidence).clamp(0.0, 1.0),
        }
    }

    /// Re-apply range clamping (for signals deserialised from external input)
    pub fn normalized(self) -> Self {
        Self::new(self.source, self.value, self.confidence)
    }
}

fn finite_or_zero(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_clamping() {
        let s = AnalyticSignal::new("causal", 1.7, -0.2);
        assert_eq!(s.value, 1.0);
        assert_eq!(s.confidence, 0.0);
        assert_eq!(s.source, SignalSource::Causal);

        let nan = AnalyticSignal::new("temporal", f64::NAN, f64::INFINITY);
        assert_eq!(nan.value, 0.0);
        assert_eq!(nan.confidence, 0.0);
    }

    #[test]
    fn test_source_round_trip_through_json() {
        let s = AnalyticSignal::new("sentiment_velocity", 0.3, 0.8);
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("\"sentiment_velocity\""));

        let back: AnalyticSignal = serde_json::from_str(&json).unwrap();
        assert_eq!(back.source, SignalSource::Custom("sentiment_velocity".into()));

        let known: SignalSource = serde_json::from_str("\"Topological\"").unwrap();
        assert_eq!(known, SignalSource::Topological);
    }
}
