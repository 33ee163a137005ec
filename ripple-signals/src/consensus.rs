//! Swarm Consensus Coordinator
//!
//! Re-runs fusion N times with independently perturbed inputs and votes:
//! - every member has its own RNG derived from (seed, entity, index)
//! - trust multipliers are jittered, signals optionally bootstrap-resampled
//! - members run on the blocking pool; nothing is shared between them
//! - votes are weighted by each member's confidence

use futures::future::join_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use ripple_core::{AnalyticSignal, ArbiterConfig, ConsensusConfig, CoreError, SignalSource};

use crate::{fuse, ArbitratedDecision, Direction};

/// One member's vote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberVote {
    pub direction: Direction,
    pub confidence: f64,
    pub fused_value: f64,
}

/// Result of evaluating one ensemble member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberOutcome {
    pub index: usize,
    pub seed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vote: Option<MemberVote>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MemberOutcome {
    pub fn succeeded(index: usize, seed: u64, vote: MemberVote) -> Self {
        Self {
            index,
            seed,
            vote: Some(vote),
            error: None,
        }
    }

    pub fn failed(index: usize, seed: u64, error: impl Into<String>) -> Self {
        Self {
            index,
            seed,
            vote: None,
            error: Some(error.into()),
        }
    }
}

/// Agreement between pairs of successful members
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairwiseStats {
    pub pairs: usize,
    /// Fraction of pairs with the same label
    pub label_agreement: f64,
    /// Mean |fused_a - fused_b|
    pub mean_value_spread: f64,
}

/// Aggregated outcome of one consensus run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleResult {
    pub size: usize,
    pub succeeded: usize,
    pub members: Vec<MemberOutcome>,
    /// Confidence-weighted vote per label
    pub tallies: BTreeMap<Direction, f64>,
    pub majority: Direction,
    /// Majority tally over total tally
    pub agreement: f64,
    pub confidence: f64,
    pub pairwise: PairwiseStats,
}

impl EnsembleResult {
    /// Final decision for the entity, superseding the single-pass `base`
    pub fn decision(&self, base: &ArbitratedDecision) -> ArbitratedDecision {
        ArbitratedDecision::with_consensus(base, self.majority, self.confidence, self.agreement)
    }

    pub fn failed(&self) -> usize {
        self.size - self.succeeded
    }
}

/// Runs and aggregates consensus ensembles
#[derive(Debug, Clone)]
pub struct ConsensusCoordinator {
    arbiter: ArbiterConfig,
    consensus: ConsensusConfig,
}

impl ConsensusCoordinator {
    pub fn new(arbiter: ArbiterConfig, consensus: ConsensusConfig) -> Self {
        Self { arbiter, consensus }
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.consensus
    }

    /// Deterministic per-member seed
    pub fn member_seed(base_seed: u64, entity_id: &str, index: usize) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(base_seed.to_le_bytes());
        hasher.update(entity_id.as_bytes());
        hasher.update((index as u64).to_le_bytes());
        let digest = hasher.finalize();

        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(bytes)
    }

    /// Evaluate a single member; pure function of its inputs and seed
    pub fn evaluate_member(
        &self,
        entity_id: &str,
        signals: &[AnalyticSignal],
        index: usize,
        seed: u64,
    ) -> MemberOutcome {
        let mut rng = StdRng::seed_from_u64(seed);
        let jitter = self.consensus.trust_jitter;

        let mut config = self.arbiter.clone();
        let sources: BTreeSet<SignalSource> = config
            .trust
            .keys()
            .cloned()
            .chain(signals.iter().map(|s| s.source.clone()))
            .collect();
        for source in sources {
            let factor = if jitter > 0.0 {
                rng.gen_range((1.0 - jitter)..=(1.0 + jitter))
            } else {
                1.0
            };
            let trust = config.trust_for(&source) * factor;
            config.trust.insert(source, trust);
        }

        let sample: Vec<AnalyticSignal> = if self.consensus.bootstrap && !signals.is_empty() {
            (0..signals.len())
                .map(|_| signals[rng.gen_range(0..signals.len())].clone())
                .collect()
        } else {
            signals.to_vec()
        };

        match fuse(entity_id, &sample, &config) {
            Ok(decision) => MemberOutcome::succeeded(
                index,
                seed,
                MemberVote {
                    direction: decision.direction,
                    confidence: decision.confidence,
                    fused_value: decision.rationale.fused_value,
                },
            ),
            Err(e) => MemberOutcome::failed(index, seed, e.to_string()),
        }
    }

    /// Evaluate all members in parallel and aggregate their votes
    pub async fn run(
        &self,
        entity_id: &str,
        signals: &[AnalyticSignal],
    ) -> Result<EnsembleResult, CoreError> {
        let size = self.consensus.ensemble_size;
        if size < 1 {
            return Err(CoreError::InvalidEnsembleSize(size));
        }

        info!("Running consensus ensemble of {} for {}", size, entity_id);

        let signals: Arc<Vec<AnalyticSignal>> = Arc::new(signals.to_vec());
        let handles: Vec<_> = (0..size)
            .map(|index| {
                let coordinator = self.clone();
                let signals = signals.clone();
                let entity = entity_id.to_string();
                let seed = Self::member_seed(self.consensus.seed, entity_id, index);
                let handle = tokio::task::spawn_blocking(move || {
                    coordinator.evaluate_member(&entity, &signals, index, seed)
                });
                (index, seed, handle)
            })
            .collect();

        let outcomes: Vec<MemberOutcome> = join_all(handles.into_iter().map(
            |(index, seed, handle)| async move {
                match handle.await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!("Consensus member {} task failed: {}", index, e);
                        MemberOutcome::failed(index, seed, format!("task failed: {e}"))
                    }
                }
            },
        ))
        .await;

        let result = Self::aggregate(entity_id, outcomes)?;
        info!(
            "Consensus for {}: {} with agreement {:.2} ({}/{} members)",
            entity_id, result.majority, result.agreement, result.succeeded, result.size
        );
        Ok(result)
    }

    /// Aggregate member outcomes into a collective decision
    pub fn aggregate(
        entity_id: &str,
        mut members: Vec<MemberOutcome>,
    ) -> Result<EnsembleResult, CoreError> {
        members.sort_by_key(|m| m.index);
        let size = members.len();
        if size < 1 {
            return Err(CoreError::InvalidEnsembleSize(size));
        }

        let votes: Vec<&MemberVote> = members.iter().filter_map(|m| m.vote.as_ref()).collect();
        for member in members.iter().filter(|m| m.vote.is_none()) {
            debug!(
                "Member {} of {} failed: {}",
                member.index,
                entity_id,
                member.error.as_deref().unwrap_or("unknown")
            );
        }
        if votes.is_empty() {
            return Err(CoreError::NoSignal(format!(
                "all {size} consensus member(s) failed for {entity_id}"
            )));
        }

        let mut tallies: BTreeMap<Direction, f64> = BTreeMap::new();
        let mut counts: BTreeMap<Direction, usize> = BTreeMap::new();
        for vote in &votes {
            *tallies.entry(vote.direction).or_insert(0.0) += vote.confidence;
            *counts.entry(vote.direction).or_insert(0) += 1;
        }

        let count_of = |d: &Direction| counts.get(d).copied().unwrap_or(0);
        let majority = tallies
            .iter()
            .max_by(|(da, ta), (db, tb)| {
                ta.total_cmp(tb)
                    .then_with(|| count_of(da).cmp(&count_of(db)))
                    .then_with(|| da.caution().cmp(&db.caution()))
            })
            .map(|(d, _)| *d)
            .unwrap_or(Direction::Hold);

        let total: f64 = tallies.values().sum();
        let agreement = if total > 0.0 {
            tallies.get(&majority).copied().unwrap_or(0.0) / total
        } else {
            count_of(&majority) as f64 / votes.len() as f64
        };

        let majority_confidences: Vec<f64> = votes
            .iter()
            .filter(|v| v.direction == majority)
            .map(|v| v.confidence)
            .collect();
        let mean_confidence =
            majority_confidences.iter().sum::<f64>() / majority_confidences.len().max(1) as f64;

        Ok(EnsembleResult {
            size,
            succeeded: votes.len(),
            pairwise: pairwise(&votes),
            tallies,
            majority,
            agreement,
            confidence: (agreement * mean_confidence).clamp(0.0, 1.0),
            members,
        })
    }
}

fn pairwise(votes: &[&MemberVote]) -> PairwiseStats {
    let mut pairs = 0usize;
    let mut same = 0usize;
    let mut spread = 0.0;

    for (i, a) in votes.iter().enumerate() {
        for b in &votes[i + 1..] {
            pairs += 1;
            if a.direction == b.direction {
                same += 1;
            }
            spread += (a.fused_value - b.fused_value).abs();
        }
    }

    if pairs == 0 {
        return PairwiseStats {
            pairs,
            label_agreement: 1.0,
            mean_value_spread: 0.0,
        };
    }

    PairwiseStats {
        pairs,
        label_agreement: same as f64 / pairs as f64,
        mean_value_spread: spread / pairs as f64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vote(index: usize, direction: Direction, confidence: f64, fused_value: f64) -> MemberOutcome {
        MemberOutcome::succeeded(
            index,
            index as u64,
            MemberVote {
                direction,
                confidence,
                fused_value,
            },
        )
    }

    fn coordinator(size: usize, seed: u64) -> ConsensusCoordinator {
        ConsensusCoordinator::new(
            ArbiterConfig::default(),
            ConsensusConfig {
                ensemble_size: size,
                seed,
                ..Default::default()
            },
        )
    }

    fn mixed_signals() -> Vec<AnalyticSignal> {
        vec![
            AnalyticSignal::new("causal", 0.7, 0.9),
            AnalyticSignal::new("temporal", 0.6, 0.8),
            AnalyticSignal::new("topological", 0.5, 0.8),
            AnalyticSignal::new("propagation", -0.6, 0.3),
        ]
    }

    #[test]
    fn test_confidence_weighted_majority() {
        let members = vec![
            vote(0, Direction::Buy, 0.6, 0.4),
            vote(1, Direction::Buy, 0.6, 0.5),
            vote(2, Direction::Buy, 0.6, 0.3),
            vote(3, Direction::Buy, 0.6, 0.45),
            vote(4, Direction::Sell, 0.9, -0.6),
        ];
        let result = ConsensusCoordinator::aggregate("brand:acme", members).unwrap();

        assert_eq!(result.majority, Direction::Buy);
        assert_eq!(result.succeeded, 5);
        // 2.4 / 3.3
        assert!((result.agreement - 2.4 / 3.3).abs() < 1e-12);
        assert!(result.agreement < 1.0);
        assert!((result.confidence - 2.4 / 3.3 * 0.6).abs() < 1e-12);

        assert_eq!(result.pairwise.pairs, 10);
        assert!((result.pairwise.label_agreement - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_confident_minority_can_win() {
        let members = vec![
            vote(0, Direction::Buy, 0.2, 0.3),
            vote(1, Direction::Buy, 0.2, 0.3),
            vote(2, Direction::Sell, 0.9, -0.7),
        ];
        let result = ConsensusCoordinator::aggregate("e", members).unwrap();
        assert_eq!(result.majority, Direction::Sell);
    }

    #[test]
    fn test_tie_breaks() {
        // Equal tallies, more members wins
        let result = ConsensusCoordinator::aggregate(
            "e",
            vec![
                vote(0, Direction::Buy, 0.3, 0.3),
                vote(1, Direction::Buy, 0.3, 0.3),
                vote(2, Direction::Sell, 0.6, -0.3),
            ],
        )
        .unwrap();
        assert_eq!(result.majority, Direction::Buy);

        // Full tie, the cautious label wins
        let result = ConsensusCoordinator::aggregate(
            "e",
            vec![
                vote(0, Direction::Buy, 0.5, 0.3),
                vote(1, Direction::Hold, 0.5, 0.0),
            ],
        )
        .unwrap();
        assert_eq!(result.majority, Direction::Hold);
        assert!((result.agreement - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_failed_members_excluded() {
        let result = ConsensusCoordinator::aggregate(
            "e",
            vec![
                vote(0, Direction::Sell, 0.7, -0.5),
                MemberOutcome::failed(1, 1, "task failed"),
            ],
        )
        .unwrap();
        assert_eq!(result.size, 2);
        assert_eq!(result.succeeded, 1);
        assert_eq!(result.failed(), 1);
        assert_eq!(result.agreement, 1.0);

        let err = ConsensusCoordinator::aggregate(
            "e",
            vec![MemberOutcome::failed(0, 0, "no weight")],
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::NoSignal(_)));
    }

    #[tokio::test]
    async fn test_invalid_ensemble_size() {
        let err = coordinator(0, 1).run("e", &mixed_signals()).await.unwrap_err();
        assert_eq!(err, CoreError::InvalidEnsembleSize(0));
    }

    #[tokio::test]
    async fn test_no_signals_is_no_signal() {
        let err = coordinator(3, 1).run("e", &[]).await.unwrap_err();
        assert!(matches!(err, CoreError::NoSignal(_)));
    }

    #[tokio::test]
    async fn test_deterministic_for_fixed_seed() {
        let signals = mixed_signals();
        let first = coordinator(8, 42).run("brand:acme", &signals).await.unwrap();
        let second = coordinator(8, 42).run("brand:acme", &signals).await.unwrap();

        assert_eq!(first.members, second.members);
        assert_eq!(first.majority, second.majority);
        assert_eq!(first.agreement, second.agreement);

        assert_ne!(
            ConsensusCoordinator::member_seed(42, "brand:acme", 0),
            ConsensusCoordinator::member_seed(42, "brand:acme", 1)
        );
        assert_ne!(
            ConsensusCoordinator::member_seed(42, "brand:acme", 0),
            ConsensusCoordinator::member_seed(42, "brand:other", 0)
        );
    }

    #[tokio::test]
    async fn test_members_differ() {
        let result = coordinator(20, 7).run("e", &mixed_signals()).await.unwrap();
        let values: BTreeSet<u64> = result
            .members
            .iter()
            .filter_map(|m| m.vote.as_ref())
            .map(|v| v.fused_value.to_bits())
            .collect();
        assert!(values.len() > 1);
    }

    #[tokio::test]
    async fn test_larger_ensembles_are_steadier() {
        let signals = mixed_signals();
        let mut small = Vec::new();
        let mut large = Vec::new();
        let mut small_buy = 0;

        for seed in 0..40u64 {
            let a = coordinator(5, seed).run("brand:acme", &signals).await.unwrap();
            let b = coordinator(50, seed).run("brand:acme", &signals).await.unwrap();

            if a.majority == Direction::Buy {
                small_buy += 1;
            }
            assert_eq!(b.majority, Direction::Buy);
            small.push(a.agreement);
            large.push(b.agreement);
        }

        let variance = |xs: &[f64]| {
            let mean = xs.iter().sum::<f64>() / xs.len() as f64;
            xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / xs.len() as f64
        };

        assert!(small_buy >= 36, "small ensembles voted BUY {small_buy}/40");
        assert!(variance(&large) <= variance(&small));
    }
}
