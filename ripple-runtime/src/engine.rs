//! Evaluation Engine
//!
//! Runs one evaluation cycle over an immutable location snapshot:
//! - configuration is validated before any work starts
//! - every target scope is evaluated as its own task
//! - graph, diffusion and echo analysis run on the blocking pool
//! - analytic signals are collected, fused and put to a consensus vote
//! - a failing scope is reported, never aborting its siblings

use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use ripple_core::{
    CoreError, CriticalityClassifier, CriticalityReport, EchoAnalyzer, EngineConfig, ErrorKind,
    GraphBuilder, GraphStats, LocationSnapshot, OverflowReport, PerturbationSeed, Simulator,
};
use ripple_signals::{
    ArbiterError, ArbiterState, ConsensusCoordinator, SharedProducer, SignalArbiter,
};

use crate::{CycleReport, ScopeReport, ScopeStatus, TargetScope};

/// Errors that abort a whole cycle
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Cycle aborted: {0}")]
    Config(#[from] CoreError),

    #[error("Invalid scope {0}")]
    InvalidScope(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Config(e) => e.kind(),
            EngineError::InvalidScope(_) => ErrorKind::Configuration,
        }
    }
}

/// Graph and propagation results for one scope
#[derive(Debug, Clone)]
struct PropagationOutcome {
    selected: usize,
    seeds_placed: usize,
    graph: GraphStats,
    criticality: CriticalityReport,
    overflow: Option<OverflowReport>,
}

/// The evaluation engine
#[derive(Clone)]
pub struct Engine {
    config: Arc<EngineConfig>,
    producers: Vec<SharedProducer>,
}

impl Engine {
    pub fn new(config: EngineConfig, producers: Vec<SharedProducer>) -> Self {
        Self {
            config: Arc::new(config),
            producers,
        }
    }

    /// Register another analytic source
    pub fn with_producer(mut self, producer: SharedProducer) -> Self {
        self.producers.push(producer);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    /// Run one evaluation cycle over `snapshot`
    pub async fn run_cycle(
        &self,
        snapshot: Arc<LocationSnapshot>,
        seeds: Vec<PerturbationSeed>,
        scopes: Vec<TargetScope>,
    ) -> Result<CycleReport, EngineError> {
        // Misconfiguration aborts before any simulation work
        if let Err(e) = self.config.validate() {
            error!("Refusing to start cycle: {}", e);
            return Err(e.into());
        }

        let cycle_id = Uuid::new_v4();
        let started_at = Utc::now();
        let seed_count = seeds.len();
        let seeds = Arc::new(seeds);

        info!(
            "Cycle {} starting: {} scope(s), {} node(s), {} seed(s)",
            cycle_id,
            scopes.len(),
            snapshot.nodes().len(),
            seed_count
        );

        let handles: Vec<_> = scopes
            .into_iter()
            .map(|scope| {
                let engine = self.clone();
                let snapshot = snapshot.clone();
                let seeds = seeds.clone();
                let task_scope = scope.clone();
                let handle = tokio::spawn(async move {
                    engine.evaluate_scope(snapshot, seeds, task_scope).await
                });
                (scope, handle)
            })
            .collect();

        let scopes = join_all(handles.into_iter().map(|(scope, handle)| async move {
            match handle.await {
                Ok(report) => report,
                Err(e) => {
                    error!("Scope {} task failed: {}", scope, e);
                    skipped(&scope, "task_failed", None, e.to_string())
                }
            }
        }))
        .await;

        let report = CycleReport {
            cycle_id,
            started_at,
            completed_at: Utc::now(),
            snapshot_taken_at: snapshot.taken_at,
            snapshot_nodes: snapshot.nodes().len(),
            seeds: seed_count,
            scopes,
        };

        let (decided, undecided, skipped) = report.counts();
        info!(
            "Cycle {} complete: {} decided, {} without decision, {} skipped",
            cycle_id, decided, undecided, skipped
        );

        Ok(report)
    }

    /// Evaluate a single scope; every failure is folded into the report
    pub async fn evaluate_scope(
        &self,
        snapshot: Arc<LocationSnapshot>,
        seeds: Arc<Vec<PerturbationSeed>>,
        scope: TargetScope,
    ) -> ScopeReport {
        let started = Instant::now();
        let entity_id = scope.entity_id();
        debug!("Evaluating scope {}", entity_id);

        let config = self.config.clone();
        let stage_scope = scope.clone();
        let propagation = tokio::task::spawn_blocking(move || {
            propagate(&config, &snapshot, &seeds, &stage_scope)
        })
        .await;

        let outcome = match propagation {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!("Skipping scope {}: {}", entity_id, e);
                let mut report = skipped(&scope, e.name(), Some(e.kind()), e.to_string());
                report.elapsed_ms = elapsed_ms(started);
                return report;
            }
            Err(e) => {
                error!("Propagation task for {} failed: {}", entity_id, e);
                let mut report = skipped(&scope, "task_failed", None, e.to_string());
                report.elapsed_ms = elapsed_ms(started);
                return report;
            }
        };

        if let Some(overflow) = &outcome.overflow {
            warn!(
                "Scope {} overflowed at step {} ({} node(s)); classified {}",
                entity_id,
                overflow.step,
                overflow.nodes.len(),
                outcome.criticality.regime
            );
        }

        let mut arbiter = SignalArbiter::new(&entity_id, self.config.arbiter.clone());
        let state = arbiter.collect(&self.producers).await;
        let propagation_signal = outcome.criticality.signal.clone();

        let status = if state == ArbiterState::Expired {
            ScopeStatus::NoDecision {
                reason: format!("no analytic signal arrived for {entity_id} before the deadline"),
            }
        } else {
            match arbiter.resolve(propagation_signal.as_ref()) {
                Ok(base) => {
                    let coordinator = ConsensusCoordinator::new(
                        self.config.arbiter.clone(),
                        self.config.consensus.clone(),
                    );
                    let inputs = arbiter.inputs(propagation_signal.as_ref());
                    match coordinator.run(&entity_id, &inputs).await {
                        Ok(ensemble) => ScopeStatus::Decided {
                            decision: ensemble.decision(&base),
                            consensus: ensemble,
                        },
                        Err(e) => no_decision(&entity_id, e.into()),
                    }
                }
                Err(e) => no_decision(&entity_id, e),
            }
        };

        if let ScopeStatus::Decided { decision, consensus } = &status {
            info!(
                "Scope {}: {} (confidence {:.2}, agreement {:.2}, regime {})",
                entity_id,
                decision.direction,
                decision.confidence,
                consensus.agreement,
                outcome.criticality.regime
            );
        }

        ScopeReport {
            entity_id,
            scope,
            selected_nodes: outcome.selected,
            seeds_placed: outcome.seeds_placed,
            graph: Some(outcome.graph),
            overflow: outcome.overflow,
            criticality: Some(outcome.criticality),
            arbiter_state: Some(arbiter.state()),
            status,
            elapsed_ms: elapsed_ms(started),
        }
    }
}

/// Graph → diffusion/echo → criticality for one scope (CPU-bound)
fn propagate(
    config: &EngineConfig,
    snapshot: &LocationSnapshot,
    seeds: &[PerturbationSeed],
    scope: &TargetScope,
) -> Result<PropagationOutcome, CoreError> {
    let selected = scope.select(snapshot);
    let graph = GraphBuilder::new(config.graph.clone()).build(selected.iter().copied())?;
    let (_, seeds_placed) = Simulator::seed_vector(&graph, seeds);

    let classifier = CriticalityClassifier::new(config.criticality.clone());
    let analyzer = EchoAnalyzer::new(config.diffusion.clone(), config.echo.clone());

    let (criticality, overflow) = match analyzer.analyze(&graph, seeds) {
        Some(echo) => (classifier.assess(&graph, &echo), echo.overflow.clone()),
        None => {
            debug!("No seed reached scope {}; treating as quiescent", scope);
            (classifier.quiescent(&graph), None)
        }
    };

    Ok(PropagationOutcome {
        selected: selected.len(),
        seeds_placed,
        graph: graph.stats(),
        criticality,
        overflow,
    })
}

fn no_decision(entity_id: &str, error: ArbiterError) -> ScopeStatus {
    info!("No decision for {}: {}", entity_id, error);
    ScopeStatus::NoDecision {
        reason: error.to_string(),
    }
}

fn skipped(scope: &TargetScope, error: &str, kind: Option<ErrorKind>, message: String) -> ScopeReport {
    ScopeReport {
        scope: scope.clone(),
        entity_id: scope.entity_id(),
        selected_nodes: 0,
        seeds_placed: 0,
        graph: None,
        criticality: None,
        overflow: None,
        arbiter_state: None,
        status: ScopeStatus::Skipped {
            error: error.to_string(),
            kind,
            message,
        },
        elapsed_ms: 0,
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use ripple_core::{AnalyticSignal, Coordinates, LocationNode, SignalSource, StabilityRegime};
    use ripple_signals::{Direction, SignalProducer, SourceError, StaticSignalProducer};
    use std::time::Duration;

    fn snapshot() -> Arc<LocationSnapshot> {
        let now = Utc::now();
        // Same brand, far enough apart that only brand edges form
        Arc::new(LocationSnapshot::new(
            now,
            vec![
                LocationNode::new("a", Coordinates::new(40.0, -74.0), "acme", "cafe", 0.1, now),
                LocationNode::new("b", Coordinates::new(41.0, -74.0), "acme", "bar", 0.2, now),
                LocationNode::new("c", Coordinates::new(42.0, -74.0), "acme", "diner", 0.0, now),
                LocationNode::new("z", Coordinates::new(10.0, 10.0), "zest", "pub", 0.4, now),
            ],
        ))
    }

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.arbiter.collection_deadline_ms = 200;
        config.consensus.ensemble_size = 5;
        config
    }

    fn bearish_producers(entity: &str) -> Vec<SharedProducer> {
        vec![
            Arc::new(StaticSignalProducer::new("causal").with_signal(entity, -0.5, 0.8)),
            Arc::new(StaticSignalProducer::new("temporal").with_signal(entity, -0.4, 0.7)),
            Arc::new(StaticSignalProducer::new("topological").with_signal(entity, -0.3, 0.6)),
        ]
    }

    struct PanickingProducer;

    #[async_trait]
    impl SignalProducer for PanickingProducer {
        fn source(&self) -> SignalSource {
            SignalSource::Custom("broken".into())
        }

        async fn produce(&self, entity_id: &str) -> Result<Vec<AnalyticSignal>, SourceError> {
            if entity_id == "brand:zest" {
                panic!("producer bug");
            }
            Err(SourceError::NoData(entity_id.to_string()))
        }
    }

    #[tokio::test]
    async fn test_brand_scope_end_to_end() {
        let engine = Engine::new(config(), bearish_producers("brand:acme"));
        let report = engine
            .run_cycle(
                snapshot(),
                vec![PerturbationSeed::new("a", -0.8)],
                vec![TargetScope::brand("acme")],
            )
            .await
            .unwrap();

        assert_eq!(report.scopes.len(), 1);
        let scope = &report.scopes[0];
        assert_eq!(scope.entity_id, "brand:acme");
        assert_eq!(scope.selected_nodes, 3);
        assert_eq!(scope.seeds_placed, 1);
        assert_eq!(scope.graph.as_ref().map(|g| g.edges), Some(3));
        assert!(scope.overflow.is_none());

        let criticality = scope.criticality.as_ref().unwrap();
        assert!(!criticality.regime.is_volatile());
        let propagation = criticality.signal.as_ref().unwrap();
        assert!(propagation.value < 0.0);

        assert_eq!(scope.arbiter_state, Some(ArbiterState::Resolved));
        let decision = scope.decision().unwrap();
        assert_eq!(decision.direction, Direction::Sell);
        assert_eq!(decision.rationale.contributions.len(), 4);
        assert!(decision.rationale.consensus_agreement.is_some());

        match &scope.status {
            ScopeStatus::Decided { consensus, .. } => {
                assert_eq!(consensus.size, 5);
                assert_eq!(consensus.majority, Direction::Sell);
                assert!((consensus.agreement - 1.0).abs() < 1e-12);
            }
            other => panic!("expected a decision, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_no_signals_is_no_decision() {
        let engine = Engine::new(config(), Vec::new());
        let report = engine
            .run_cycle(
                snapshot(),
                vec![PerturbationSeed::new("a", -0.8)],
                vec![TargetScope::brand("acme")],
            )
            .await
            .unwrap();

        let scope = &report.scopes[0];
        assert!(matches!(scope.status, ScopeStatus::NoDecision { .. }));
        assert_eq!(scope.arbiter_state, Some(ArbiterState::Expired));
        assert!(scope.decision().is_none());
        // Propagation still ran
        assert!(scope.criticality.as_ref().unwrap().signal.is_some());
        assert_eq!(report.counts(), (0, 1, 0));
    }

    #[tokio::test]
    async fn test_failed_scope_does_not_affect_siblings() {
        let engine = Engine::new(config(), bearish_producers("brand:acme"))
            .with_producer(Arc::new(PanickingProducer));
        let report = engine
            .run_cycle(
                snapshot(),
                vec![PerturbationSeed::new("a", -0.8)],
                vec![
                    TargetScope::brand("acme"),
                    TargetScope::brand("ghost"),
                    TargetScope::brand("zest"),
                ],
            )
            .await
            .unwrap();

        assert_eq!(report.scopes.len(), 3);
        assert_eq!(
            report.scope("brand:acme").and_then(|s| s.direction()),
            Some(Direction::Sell)
        );

        let ghost = report.scope("brand:ghost").unwrap();
        match &ghost.status {
            ScopeStatus::Skipped { error, kind, .. } => {
                assert_eq!(error, "empty_graph");
                assert_eq!(*kind, Some(ErrorKind::InputInsufficiency));
            }
            other => panic!("expected skip, got {other:?}"),
        }

        // Single-location brand is also too small for a graph
        let zest = report.scope("brand:zest").unwrap();
        assert!(zest.is_skipped());
        assert_eq!(report.counts(), (1, 0, 2));
    }

    #[tokio::test]
    async fn test_producer_panic_is_contained() {
        let engine = Engine::new(config(), Vec::new()).with_producer(Arc::new(PanickingProducer));
        let snapshot = Arc::new(LocationSnapshot::new(
            Utc::now(),
            vec![
                LocationNode::new("y", Coordinates::new(10.0, 10.0), "zest", "pub", 0.1, Utc::now()),
                LocationNode::new("z", Coordinates::new(10.01, 10.0), "zest", "pub", 0.4, Utc::now()),
            ],
        ));

        let report = engine
            .run_cycle(snapshot, Vec::new(), vec![TargetScope::brand("zest"), TargetScope::All])
            .await
            .unwrap();

        let zest = report.scope("brand:zest").unwrap();
        match &zest.status {
            ScopeStatus::Skipped { error, .. } => assert_eq!(error, "task_failed"),
            other => panic!("expected skip, got {other:?}"),
        }
        let all = report.scope("all").unwrap();
        assert!(matches!(all.status, ScopeStatus::NoDecision { .. }));
    }

    #[tokio::test]
    async fn test_unseeded_scope_is_quiescent() {
        let engine = Engine::new(config(), bearish_producers("brand:acme"));
        let report = engine
            .run_cycle(snapshot(), Vec::new(), vec![TargetScope::brand("acme")])
            .await
            .unwrap();

        let scope = &report.scopes[0];
        let criticality = scope.criticality.as_ref().unwrap();
        assert_eq!(criticality.regime, StabilityRegime::Stable);
        assert!(criticality.signal.is_none());
        assert!(criticality.contagion.is_empty());

        let decision = scope.decision().unwrap();
        assert_eq!(decision.direction, Direction::Sell);
        assert_eq!(decision.rationale.contributions.len(), 3);
    }

    #[tokio::test]
    async fn test_invalid_config_aborts_cycle() {
        let mut config = config();
        config.consensus.ensemble_size = 0;
        let engine = Engine::new(config, bearish_producers("brand:acme"));

        let err = engine
            .run_cycle(snapshot(), Vec::new(), vec![TargetScope::brand("acme")])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Config(CoreError::InvalidEnsembleSize(0))
        ));
        assert!(err.kind().is_fatal());

        let mut config = EngineConfig::default();
        config.criticality.thresholds.watch = 1.0;
        let engine = Engine::new(config, Vec::new());
        let err = engine
            .run_cycle(snapshot(), Vec::new(), vec![TargetScope::All])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Config(CoreError::MalformedThresholds(_))
        ));
    }

    #[tokio::test]
    async fn test_overflow_is_chaotic_with_decision() {
        let mut config = config();
        config.diffusion.coupling = 3.0;
        config.diffusion.safety_bound = 2.0;
        let engine = Engine::new(config, bearish_producers("brand:acme"));

        let report = engine
            .run_cycle(
                snapshot(),
                vec![PerturbationSeed::new("a", -0.9)],
                vec![TargetScope::brand("acme")],
            )
            .await
            .unwrap();

        let scope = &report.scopes[0];
        assert!(scope.overflow.is_some());
        let criticality = scope.criticality.as_ref().unwrap();
        assert!(criticality.overflowed);
        assert_eq!(criticality.regime, StabilityRegime::Chaotic);
        assert_eq!(
            criticality.signal.as_ref().map(|s| s.confidence),
            Some(StabilityRegime::Chaotic.predictability())
        );
        assert_eq!(scope.direction(), Some(Direction::Sell));
    }

    #[tokio::test]
    async fn test_slow_source_is_cut_off() {
        struct Slow;

        #[async_trait]
        impl SignalProducer for Slow {
            fn source(&self) -> SignalSource {
                SignalSource::Topological
            }

            async fn produce(&self, _: &str) -> Result<Vec<AnalyticSignal>, SourceError> {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(vec![AnalyticSignal::new("topological", 1.0, 1.0)])
            }
        }

        let producers: Vec<SharedProducer> = vec![
            Arc::new(StaticSignalProducer::new("causal").with_signal("brand:acme", -0.6, 0.9)),
            Arc::new(Slow),
        ];
        let engine = Engine::new(config(), producers);

        let started = Instant::now();
        let report = engine
            .run_cycle(
                snapshot(),
                vec![PerturbationSeed::new("a", -0.8)],
                vec![TargetScope::brand("acme")],
            )
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        let decision = report.scopes[0].decision().unwrap();
        assert_eq!(decision.direction, Direction::Sell);
        assert_eq!(decision.rationale.contributions.len(), 2);
    }

    #[tokio::test]
    async fn test_report_serializes() {
        let engine = Engine::new(config(), bearish_producers("brand:acme"));
        let report = engine
            .run_cycle(
                snapshot(),
                vec![PerturbationSeed::new("a", -0.8)],
                vec![TargetScope::brand("acme"), TargetScope::brand("ghost")],
            )
            .await
            .unwrap();

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["scopes"][0]["status"]["status"], "decided");
        assert_eq!(json["scopes"][0]["status"]["decision"]["direction"], "SELL");
        assert_eq!(json["scopes"][1]["status"]["status"], "skipped");
    }
}
