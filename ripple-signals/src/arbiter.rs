//! Signal Arbiter
//!
//! Collects analytic signals for one target entity and fuses them with the
//! propagation signal:
//! - COLLECTING until every expected source reported or the deadline passed
//! - READY once either happens (partial input is fine past the deadline)
//! - RESOLVED after fusion
//! - EXPIRED when nothing at all arrived in time; no decision this cycle

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use ripple_core::{AnalyticSignal, ArbiterConfig, CoreError, ErrorKind, SignalSource};

use crate::{fuse, ArbitratedDecision, SharedProducer};

/// Lifecycle of one arbitration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArbiterState {
    Collecting,
    Ready,
    Resolved,
    Expired,
}

impl fmt::Display for ArbiterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArbiterState::Collecting => "collecting",
            ArbiterState::Ready => "ready",
            ArbiterState::Resolved => "resolved",
            ArbiterState::Expired => "expired",
        };
        f.write_str(name)
    }
}

/// Errors from arbitration
#[derive(Debug, Error)]
pub enum ArbiterError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Cannot {action} while {state}")]
    InvalidTransition {
        state: ArbiterState,
        action: &'static str,
    },
}

impl ArbiterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ArbiterError::Core(e) => e.kind(),
            ArbiterError::InvalidTransition { .. } => ErrorKind::Configuration,
        }
    }
}

/// Arbitration for one entity in one cycle
#[derive(Debug)]
pub struct SignalArbiter {
    entity_id: String,
    config: ArbiterConfig,
    state: ArbiterState,
    signals: Vec<AnalyticSignal>,
    reported: BTreeSet<SignalSource>,
    deadline: Instant,
    decision: Option<ArbitratedDecision>,
}

impl SignalArbiter {
    /// Open a collection window ending `collection_deadline_ms` from now
    pub fn new(entity_id: &str, config: ArbiterConfig) -> Self {
        let deadline = Instant::now() + config.collection_deadline();
        Self {
            entity_id: entity_id.to_string(),
            config,
            state: ArbiterState::Collecting,
            signals: Vec::new(),
            reported: BTreeSet::new(),
            deadline,
            decision: None,
        }
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn state(&self) -> ArbiterState {
        self.state
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn signals(&self) -> &[AnalyticSignal] {
        &self.signals
    }

    /// Sources that have reported at least one signal
    pub fn reported_sources(&self) -> impl Iterator<Item = &SignalSource> {
        self.reported.iter()
    }

    /// Every expected source has reported (with none expected: any report)
    pub fn is_complete(&self) -> bool {
        if self.config.expected_sources.is_empty() {
            return !self.reported.is_empty();
        }
        self.config
            .expected_sources
            .iter()
            .all(|s| self.reported.contains(s))
    }

    /// Accept one signal while collecting
    pub fn report(&mut self, signal: AnalyticSignal) -> Result<ArbiterState, ArbiterError> {
        if self.state != ArbiterState::Collecting {
            return Err(ArbiterError::InvalidTransition {
                state: self.state,
                action: "accept a report",
            });
        }

        let signal = signal.normalized();
        debug!(
            "Arbiter {} received {} signal ({:.3}, conf {:.2})",
            self.entity_id, signal.source, signal.value, signal.confidence
        );
        self.reported.insert(signal.source.clone());
        self.signals.push(signal);

        if self.is_complete() {
            self.state = ArbiterState::Ready;
        }
        Ok(self.state)
    }

    /// Apply the deadline as of `now`
    pub fn poll(&mut self, now: Instant) -> ArbiterState {
        if self.state == ArbiterState::Collecting && now >= self.deadline {
            self.close();
        }
        self.state
    }

    /// End collection: READY with whatever arrived, EXPIRED with nothing
    pub fn close(&mut self) -> ArbiterState {
        if self.state == ArbiterState::Collecting {
            self.state = if self.signals.is_empty() {
                warn!("Arbiter {} expired with no signals", self.entity_id);
                ArbiterState::Expired
            } else {
                if !self.is_complete() {
                    info!(
                        "Arbiter {} proceeding with partial input ({} source(s))",
                        self.entity_id,
                        self.reported.len()
                    );
                }
                ArbiterState::Ready
            };
        }
        self.state
    }

    /// Poll every producer concurrently until complete, exhausted or the deadline
    pub async fn collect(&mut self, producers: &[SharedProducer]) -> ArbiterState {
        let entity = self.entity_id.clone();
        let mut pending: FuturesUnordered<_> = producers
            .iter()
            .map(|producer| {
                let producer = producer.clone();
                let entity = entity.clone();
                async move {
                    let result = producer.produce(&entity).await;
                    (producer.source(), result)
                }
            })
            .collect();

        while self.state == ArbiterState::Collecting {
            match timeout_at(self.deadline, pending.next()).await {
                Ok(Some((_, Ok(signals)))) => {
                    for signal in signals {
                        // Only fails once collection has ended
                        if self.report(signal).is_err() {
                            break;
                        }
                    }
                }
                Ok(Some((source, Err(e)))) => {
                    warn!("Source {} failed for {}: {}", source, self.entity_id, e);
                }
                Ok(None) => break,
                Err(_) => {
                    debug!("Arbiter {} hit its collection deadline", self.entity_id);
                    break;
                }
            }
        }

        self.close()
    }

    /// Fuse collected signals (plus the optional propagation signal).
    ///
    /// Repeated calls after resolution return the same decision.
    pub fn resolve(
        &mut self,
        propagation: Option<&AnalyticSignal>,
    ) -> Result<ArbitratedDecision, ArbiterError> {
        match self.state {
            ArbiterState::Resolved => {
                if let Some(decision) = &self.decision {
                    return Ok(decision.clone());
                }
                Err(ArbiterError::InvalidTransition {
                    state: self.state,
                    action: "resolve",
                })
            }
            ArbiterState::Expired => Err(CoreError::NoSignal(format!(
                "no source reported for {} before the deadline",
                self.entity_id
            ))
            .into()),
            ArbiterState::Collecting => Err(ArbiterError::InvalidTransition {
                state: self.state,
                action: "resolve",
            }),
            ArbiterState::Ready => {
                let inputs = self.inputs(propagation);
                let decision = fuse(&self.entity_id, &inputs, &self.config)?;
                info!(
                    "Arbiter {} resolved {} (confidence {:.2}) from {} input(s)",
                    self.entity_id,
                    decision.direction,
                    decision.confidence,
                    inputs.len()
                );
                self.state = ArbiterState::Resolved;
                self.decision = Some(decision.clone());
                Ok(decision)
            }
        }
    }

    /// The signal set fusion would see
    pub fn inputs(&self, propagation: Option<&AnalyticSignal>) -> Vec<AnalyticSignal> {
        let mut inputs = self.signals.clone();
        inputs.extend(propagation.cloned());
        inputs
    }

    pub fn config(&self) -> &ArbiterConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Direction, SignalProducer, SourceError, StaticSignalProducer};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    fn config(deadline_ms: u64) -> ArbiterConfig {
        ArbiterConfig {
            collection_deadline_ms: deadline_ms,
            ..Default::default()
        }
    }

    struct SlowProducer;

    #[async_trait]
    impl SignalProducer for SlowProducer {
        fn source(&self) -> SignalSource {
            SignalSource::Temporal
        }

        async fn produce(&self, _entity_id: &str) -> Result<Vec<AnalyticSignal>, SourceError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(vec![AnalyticSignal::new("temporal", 0.9, 0.9)])
        }
    }

    struct FailingProducer;

    #[async_trait]
    impl SignalProducer for FailingProducer {
        fn source(&self) -> SignalSource {
            SignalSource::Topological
        }

        async fn produce(&self, _entity_id: &str) -> Result<Vec<AnalyticSignal>, SourceError> {
            Err(SourceError::Unavailable("index rebuilding".into()))
        }
    }

    #[test]
    fn test_ready_once_all_sources_report() {
        let mut arbiter = SignalArbiter::new("brand:acme", config(60_000));
        assert_eq!(arbiter.state(), ArbiterState::Collecting);

        arbiter.report(AnalyticSignal::new("causal", 0.5, 0.8)).unwrap();
        arbiter.report(AnalyticSignal::new("temporal", 0.4, 0.7)).unwrap();
        assert_eq!(arbiter.state(), ArbiterState::Collecting);

        let state = arbiter.report(AnalyticSignal::new("topological", 0.6, 0.9)).unwrap();
        assert_eq!(state, ArbiterState::Ready);

        // Late reports are rejected
        assert!(arbiter.report(AnalyticSignal::new("causal", -1.0, 1.0)).is_err());

        let decision = arbiter.resolve(None).unwrap();
        assert_eq!(decision.direction, Direction::Buy);
        assert_eq!(arbiter.state(), ArbiterState::Resolved);

        let again = arbiter.resolve(None).unwrap();
        assert_eq!(again.id, decision.id);
    }

    #[test]
    fn test_deadline_with_partial_input() {
        let mut arbiter = SignalArbiter::new("brand:acme", config(0));
        arbiter.report(AnalyticSignal::new("causal", -0.7, 0.9)).unwrap();

        assert_eq!(arbiter.poll(Instant::now()), ArbiterState::Ready);
        let decision = arbiter
            .resolve(Some(&AnalyticSignal::new("propagation", -0.5, 0.6)))
            .unwrap();
        assert_eq!(decision.direction, Direction::Sell);
        assert_eq!(decision.rationale.contributions.len(), 2);
    }

    #[test]
    fn test_expired_without_reports() {
        let mut arbiter = SignalArbiter::new("brand:acme", config(0));
        assert_eq!(arbiter.poll(Instant::now()), ArbiterState::Expired);

        let err = arbiter
            .resolve(Some(&AnalyticSignal::new("propagation", -0.5, 0.6)))
            .unwrap_err();
        assert!(matches!(err, ArbiterError::Core(CoreError::NoSignal(_))));
        assert_eq!(err.kind(), ErrorKind::InputInsufficiency);
    }

    #[test]
    fn test_cannot_resolve_while_collecting() {
        let mut arbiter = SignalArbiter::new("e", config(60_000));
        assert!(matches!(
            arbiter.resolve(None),
            Err(ArbiterError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_collect_zero_signals_expires() {
        let producers: Vec<SharedProducer> = vec![Arc::new(SlowProducer), Arc::new(FailingProducer)];
        let mut arbiter = SignalArbiter::new("brand:acme", config(50));

        let state = arbiter.collect(&producers).await;
        assert_eq!(state, ArbiterState::Expired);
        assert!(arbiter.resolve(None).is_err());
    }

    #[tokio::test]
    async fn test_collect_partial_past_deadline() {
        let producers: Vec<SharedProducer> = vec![
            Arc::new(StaticSignalProducer::new("causal").with_signal("brand:acme", 0.6, 0.9)),
            Arc::new(SlowProducer),
            Arc::new(FailingProducer),
        ];
        let mut arbiter = SignalArbiter::new("brand:acme", config(50));

        let state = arbiter.collect(&producers).await;
        assert_eq!(state, ArbiterState::Ready);
        assert_eq!(arbiter.signals().len(), 1);
        assert!(!arbiter.is_complete());
    }

    #[tokio::test]
    async fn test_collect_complete_before_deadline() {
        let producers: Vec<SharedProducer> = vec![
            Arc::new(StaticSignalProducer::new("causal").with_signal("e", 0.6, 0.9)),
            Arc::new(StaticSignalProducer::new("temporal").with_signal("e", 0.5, 0.8)),
            Arc::new(StaticSignalProducer::new("topological").with_signal("e", 0.1, 0.5)),
        ];
        let mut arbiter = SignalArbiter::new("e", config(60_000));

        let started = std::time::Instant::now();
        assert_eq!(arbiter.collect(&producers).await, ArbiterState::Ready);
        assert!(arbiter.is_complete());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
