//! Engine configuration
//!
//! Loaded from TOML; every field has a default so a partial file (or none at
//! all) yields a working engine. `validate` must pass before a cycle starts.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

use crate::{CoreError, SignalSource};

/// Upper bound on simulation steps
pub const MAX_STEPS: usize = 500;

/// Errors loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error(transparent)]
    Invalid(#[from] CoreError),
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub graph: GraphConfig,
    pub diffusion: DiffusionConfig,
    pub echo: EchoConfig,
    pub criticality: CriticalityConfig,
    pub arbiter: ArbiterConfig,
    pub consensus: ConsensusConfig,
    pub store: StoreConfig,
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Check every section; any failure is a configuration error
    pub fn validate(&self) -> Result<(), CoreError> {
        self.graph.validate()?;
        self.diffusion.validate()?;
        self.echo.validate()?;
        self.criticality.validate()?;
        self.arbiter.validate()?;
        self.consensus.validate()?;
        self.store.validate()
    }
}

/// Relationship graph construction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub geographic_edges: bool,
    /// Locations closer than this are linked (km)
    pub geo_max_distance_km: f64,
    pub brand_edges: bool,
    /// Brand edge weight = scale / (members - 1), capped at 1
    pub brand_weight_scale: f64,
    pub category_edges: bool,
    pub category_weight_scale: f64,
    /// Top-K edge cap per node
    pub max_edges_per_node: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            geographic_edges: true,
            geo_max_distance_km: 5.0,
            brand_edges: true,
            brand_weight_scale: 1.0,
            category_edges: true,
            category_weight_scale: 0.5,
            max_edges_per_node: 16,
        }
    }
}

impl GraphConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        if !(self.geo_max_distance_km.is_finite() && self.geo_max_distance_km > 0.0) {
            return Err(invalid("graph.geo_max_distance_km must be positive"));
        }
        for (name, scale) in [
            ("brand_weight_scale", self.brand_weight_scale),
            ("category_weight_scale", self.category_weight_scale),
        ] {
            if !(scale.is_finite() && scale > 0.0) {
                return Err(invalid(&format!("graph.{name} must be positive")));
            }
        }
        if self.max_edges_per_node == 0 {
            return Err(invalid("graph.max_edges_per_node must be at least 1"));
        }
        Ok(())
    }
}

/// Discrete-step diffusion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffusionConfig {
    pub steps: usize,
    /// Fraction of a node's own delta lost per step (reversion toward zero)
    pub decay: f64,
    /// Scale on neighbour inflow
    pub coupling: f64,
    /// Any |delta| beyond this aborts the run
    pub safety_bound: f64,
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            steps: 20,
            decay: 0.2,
            coupling: 0.2,
            safety_bound: 10.0,
        }
    }
}

impl DiffusionConfig {
    pub fn retention(&self) -> f64 {
        1.0 - self.decay
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.steps == 0 || self.steps > MAX_STEPS {
            return Err(invalid(&format!(
                "diffusion.steps must be within 1..={MAX_STEPS}"
            )));
        }
        if !(0.0..=1.0).contains(&self.decay) {
            return Err(invalid("diffusion.decay must be within [0, 1]"));
        }
        if !(self.coupling.is_finite() && self.coupling >= 0.0) {
            return Err(invalid("diffusion.coupling must be non-negative"));
        }
        if !(self.safety_bound.is_finite() && self.safety_bound > 0.0) {
            return Err(invalid("diffusion.safety_bound must be positive"));
        }
        Ok(())
    }
}

/// Echo (perturbation sensitivity) analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EchoConfig {
    /// Size of the controlled perturbation applied to every seed
    pub epsilon: f64,
    /// Contribution of oscillation to the divergence score
    pub oscillation_weight: f64,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            epsilon: 0.01,
            oscillation_weight: 0.1,
        }
    }
}

impl EchoConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        if !(self.epsilon.is_finite() && self.epsilon > 0.0 && self.epsilon < 1.0) {
            return Err(invalid("echo.epsilon must be within (0, 1)"));
        }
        if !(self.oscillation_weight.is_finite() && self.oscillation_weight >= 0.0) {
            return Err(invalid("echo.oscillation_weight must be non-negative"));
        }
        Ok(())
    }
}

/// Ordered divergence-score thresholds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeThresholds {
    pub watch: f64,
    pub critical: f64,
    pub chaotic: f64,
}

impl Default for RegimeThresholds {
    fn default() -> Self {
        Self {
            watch: -0.05,
            critical: 0.02,
            chaotic: 0.10,
        }
    }
}

impl RegimeThresholds {
    pub fn validate(&self) -> Result<(), CoreError> {
        if ![self.watch, self.critical, self.chaotic]
            .iter()
            .all(|t| t.is_finite())
        {
            return Err(CoreError::MalformedThresholds(
                "thresholds must be finite".into(),
            ));
        }
        if !(self.watch < self.critical && self.critical < self.chaotic) {
            return Err(CoreError::MalformedThresholds(format!(
                "expected watch < critical < chaotic, got {} / {} / {}",
                self.watch, self.critical, self.chaotic
            )));
        }
        Ok(())
    }
}

/// Regime classification and the criticality-derived signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CriticalityConfig {
    /// Weighted-degree percentile a node must reach to be a contagion candidate
    pub centrality_percentile: f64,
    /// Gain applied to the mean terminal delta before squashing into [-1, 1]
    pub impact_gain: f64,
    pub thresholds: RegimeThresholds,
}

impl Default for CriticalityConfig {
    fn default() -> Self {
        Self {
            centrality_percentile: 0.75,
            impact_gain: 2.0,
            thresholds: RegimeThresholds::default(),
        }
    }
}

impl CriticalityConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        self.thresholds.validate()?;
        if !(0.0..=1.0).contains(&self.centrality_percentile) {
            return Err(invalid("criticality.centrality_percentile must be within [0, 1]"));
        }
        if !(self.impact_gain.is_finite() && self.impact_gain > 0.0) {
            return Err(invalid("criticality.impact_gain must be positive"));
        }
        Ok(())
    }
}

/// Signal arbitration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    /// Sources the arbiter waits for before the deadline
    pub expected_sources: Vec<SignalSource>,
    pub collection_deadline_ms: u64,
    pub buy_threshold: f64,
    pub sell_threshold: f64,
    /// Per-source trust multipliers; unlisted sources get 1.0
    pub trust: BTreeMap<SignalSource, f64>,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            expected_sources: vec![
                SignalSource::Causal,
                SignalSource::Temporal,
                SignalSource::Topological,
            ],
            collection_deadline_ms: 2000,
            buy_threshold: 0.2,
            sell_threshold: -0.2,
            trust: BTreeMap::new(),
        }
    }
}

impl ArbiterConfig {
    pub fn trust_for(&self, source: &SignalSource) -> f64 {
        self.trust.get(source).copied().unwrap_or(1.0)
    }

    pub fn collection_deadline(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.collection_deadline_ms)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if !(self.buy_threshold.is_finite() && self.sell_threshold.is_finite()) {
            return Err(invalid("arbiter thresholds must be finite"));
        }
        if self.sell_threshold >= self.buy_threshold {
            return Err(invalid("arbiter.sell_threshold must be below arbiter.buy_threshold"));
        }
        if self.buy_threshold > 1.0 || self.sell_threshold < -1.0 {
            return Err(invalid("arbiter thresholds must lie within [-1, 1]"));
        }
        if let Some((source, _)) = self
            .trust
            .iter()
            .find(|(_, t)| !(t.is_finite() && **t >= 0.0))
        {
            return Err(invalid(&format!(
                "arbiter.trust.{source} must be non-negative"
            )));
        }
        Ok(())
    }
}

/// Swarm consensus ensemble
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub ensemble_size: usize,
    /// Members scale each trust multiplier by a factor in [1 - jitter, 1 + jitter]
    pub trust_jitter: f64,
    /// Resample signals with replacement per member
    pub bootstrap: bool,
    /// Base seed for member RNGs
    pub seed: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            ensemble_size: 10,
            trust_jitter: 0.2,
            bootstrap: true,
            seed: 0x5EED,
        }
    }
}

impl ConsensusConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.ensemble_size < 1 {
            return Err(CoreError::InvalidEnsembleSize(self.ensemble_size));
        }
        if !(0.0..1.0).contains(&self.trust_jitter) {
            return Err(invalid("consensus.trust_jitter must be within [0, 1)"));
        }
        Ok(())
    }
}

/// Location store behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Nodes without observations for this long are stale
    pub staleness_days: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { staleness_days: 30 }
    }
}

impl StoreConfig {
    pub fn staleness_window(&self) -> Duration {
        Duration::days(self.staleness_days)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.staleness_days < 1 {
            return Err(invalid("store.staleness_days must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> CoreError {
    CoreError::InvalidConfig(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = EngineConfig::from_toml_str(
            r#"
            [diffusion]
            steps = 10

            [criticality.thresholds]
            chaotic = 0.5

            [arbiter]
            expected_sources = ["causal", "sentiment_velocity"]

            [arbiter.trust]
            causal = 1.5
            propagation = 0.8

            [consensus]
            ensemble_size = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.diffusion.steps, 10);
        assert_eq!(config.diffusion.decay, 0.2);
        assert_eq!(config.criticality.thresholds.chaotic, 0.5);
        assert_eq!(config.criticality.thresholds.watch, -0.05);
        assert_eq!(
            config.arbiter.expected_sources[1],
            SignalSource::Custom("sentiment_velocity".into())
        );
        assert_eq!(config.arbiter.trust_for(&SignalSource::Causal), 1.5);
        assert_eq!(config.arbiter.trust_for(&SignalSource::Temporal), 1.0);
        assert_eq!(config.consensus.ensemble_size, 5);
    }

    #[test]
    fn test_malformed_thresholds_rejected() {
        let err = EngineConfig::from_toml_str(
            r#"
            [criticality.thresholds]
            watch = 0.3
            critical = 0.2
            chaotic = 0.4
            "#,
        )
        .unwrap_err();

        assert!(matches!(
            err,
            ConfigError::Invalid(CoreError::MalformedThresholds(_))
        ));
    }

    #[test]
    fn test_zero_ensemble_rejected() {
        let mut config = EngineConfig::default();
        config.consensus.ensemble_size = 0;
        assert_eq!(
            config.validate(),
            Err(CoreError::InvalidEnsembleSize(0))
        );
    }

    #[test]
    fn test_inverted_arbiter_thresholds_rejected() {
        let mut config = EngineConfig::default();
        config.arbiter.buy_threshold = -0.3;
        assert!(matches!(
            config.validate(),
            Err(CoreError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_bad_toml_is_parse_error() {
        let err = EngineConfig::from_toml_str("[diffusion\nsteps = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
