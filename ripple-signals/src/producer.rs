//! Capability interface for analytic signal producers
//!
//! Causal, temporal, topological (or any other) analysis engines plug into
//! the arbiter by implementing [`SignalProducer`]. The arbiter never needs to
//! know which concrete sources exist.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use ripple_core::{AnalyticSignal, SignalSource};

/// Errors from signal producers
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Source unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed signal: {0}")]
    Malformed(String),

    #[error("No data for entity {0}")]
    NoData(String),
}

/// Common interface for all analytic signal sources
#[async_trait]
pub trait SignalProducer: Send + Sync {
    /// Tag identifying this producer
    fn source(&self) -> SignalSource;

    /// Produce signals about `entity_id` for the current cycle
    async fn produce(&self, entity_id: &str) -> Result<Vec<AnalyticSignal>, SourceError>;
}

/// Thread-safe producer handle
pub type SharedProducer = Arc<dyn SignalProducer>;

/// Serves signals that were materialised before the cycle started
#[derive(Debug, Clone)]
pub struct StaticSignalProducer {
    source: SignalSource,
    signals: HashMap<String, Vec<AnalyticSignal>>,
}

impl StaticSignalProducer {
    pub fn new(source: impl Into<SignalSource>) -> Self {
        Self {
            source: source.into(),
            signals: HashMap::new(),
        }
    }

    /// Add a signal for an entity; value and confidence are clamped into range
    pub fn with_signal(mut self, entity_id: &str, value: f64, confidence: f64) -> Self {
        let signal = AnalyticSignal::new(self.source.clone(), value, confidence);
        self.signals
            .entry(entity_id.to_string())
            .or_default()
            .push(signal);
        self
    }

    /// Split an entity → signals map into one producer per source tag
    pub fn from_batch(batch: HashMap<String, Vec<AnalyticSignal>>) -> Vec<SharedProducer> {
        let mut by_source: HashMap<SignalSource, StaticSignalProducer> = HashMap::new();

        for (entity, signals) in batch {
            for signal in signals {
                let signal = signal.normalized();
                by_source
                    .entry(signal.source.clone())
                    .or_insert_with(|| StaticSignalProducer::new(signal.source.clone()))
                    .signals
                    .entry(entity.clone())
                    .or_default()
                    .push(signal);
            }
        }

        let mut producers: Vec<StaticSignalProducer> = by_source.into_values().collect();
        producers.sort_by(|a, b| a.source.cmp(&b.source));
        producers
            .into_iter()
            .map(|p| Arc::new(p) as SharedProducer)
            .collect()
    }
}

#[async_trait]
impl SignalProducer for StaticSignalProducer {
    fn source(&self) -> SignalSource {
        self.source.clone()
    }

    async fn produce(&self, entity_id: &str) -> Result<Vec<AnalyticSignal>, SourceError> {
        self.signals
            .get(entity_id)
            .cloned()
            .ok_or_else(|| SourceError::NoData(entity_id.to_string()))
    }
}
