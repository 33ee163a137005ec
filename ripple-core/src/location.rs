//! Locations, observations and immutable snapshots
//!
//! The store is the only mutable piece of state in the engine. Evaluation
//! cycles never touch it directly: they read an `Arc<LocationSnapshot>` taken
//! at cycle start, so scopes can run concurrently without coordination.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{EARTH_RADIUS_KM, MAX_SENTIMENT, MIN_SENTIMENT};

/// Geographic position in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }

    /// Great-circle distance in kilometres (haversine)
    pub fn distance_km(&self, other: &Coordinates) -> f64 {
        let (lat1, lat2) = (self.lat.to_radians(), other.lat.to_radians());
        let dlat = lat2 - lat1;
        let dlon = (other.lon - self.lon).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().min(1.0).asin()
    }
}

/// A tracked business location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationNode {
    pub id: String,
    pub coordinates: Coordinates,
    pub brand: String,
    pub category: String,
    /// Current sentiment in [-1, 1]
    pub sentiment: f64,
    pub last_observed: DateTime<Utc>,
    /// Set by snapshots when no observation arrived within the staleness window
    #[serde(default)]
    pub stale: bool,
}

impl LocationNode {
    pub fn new(
        id: &str,
        coordinates: Coordinates,
        brand: &str,
        category: &str,
        sentiment: f64,
        last_observed: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.to_string(),
            coordinates,
            brand: brand.to_string(),
            category: category.to_string(),
            sentiment: clamp_sentiment(sentiment),
            last_observed,
            stale: false,
        }
    }

    /// Whether this node may take part in graph building
    pub fn is_eligible(&self) -> bool {
        !self.stale && self.coordinates.is_valid() && self.sentiment.is_finite()
    }
}

/// A single sentiment observation from the upstream data layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub location_id: String,
    pub sentiment: f64,
    pub observed_at: DateTime<Utc>,
}

/// An observed sentiment shock used to initialise a simulation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerturbationSeed {
    pub node_id: String,
    /// Signed shock magnitude
    pub magnitude: f64,
    #[serde(default)]
    pub observed_at: Option<DateTime<Utc>>,
}

impl PerturbationSeed {
    pub fn new(node_id: &str, magnitude: f64) -> Self {
        Self {
            node_id: node_id.to_string(),
            magnitude,
            observed_at: None,
        }
    }

    pub fn at(mut self, observed_at: DateTime<Utc>) -> Self {
        self.observed_at = Some(observed_at);
        self
    }
}

/// Outcome of applying an observation batch
#[derive(Debug, Clone, Default)]
pub struct ObservationBatchResult {
    /// Shocks derived from sentiment changes
    pub seeds: Vec<PerturbationSeed>,
    pub applied: usize,
    pub unknown: usize,
    pub out_of_order: usize,
}

/// In-memory registry of locations keyed by id
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocationStore {
    nodes: BTreeMap<String, LocationNode>,
}

impl LocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from an upstream node list (later duplicates win)
    pub fn from_nodes(nodes: impl IntoIterator<Item = LocationNode>) -> Self {
        let mut store = Self::new();
        for node in nodes {
            store.upsert(node);
        }
        store
    }

    /// Insert a new location or replace its attributes
    pub fn upsert(&mut self, mut node: LocationNode) {
        node.sentiment = clamp_sentiment(node.sentiment);
        node.stale = false;
        self.nodes.insert(node.id.clone(), node);
    }

    pub fn get(&self, id: &str) -> Option<&LocationNode> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Apply a batch of observations, returning the resulting shocks.
    ///
    /// Each accepted observation replaces the stored sentiment; the change is
    /// emitted as a seed. Unchanged sentiment emits nothing.
    pub fn apply_observations(&mut self, batch: &[Observation]) -> ObservationBatchResult {
        let mut result = ObservationBatchResult::default();

        for obs in batch {
            let Some(node) = self.nodes.get_mut(&obs.location_id) else {
                debug!("Observation for unknown location {}", obs.location_id);
                result.unknown += 1;
                continue;
            };

            if !obs.sentiment.is_finite() {
                warn!("Dropping non-finite observation for {}", obs.location_id);
                continue;
            }

            if obs.observed_at < node.last_observed {
                result.out_of_order += 1;
                continue;
            }

            let sentiment = clamp_sentiment(obs.sentiment);
            let shock = sentiment - node.sentiment;
            node.sentiment = sentiment;
            node.last_observed = obs.observed_at;
            node.stale = false;
            result.applied += 1;

            if shock != 0.0 {
                result
                    .seeds
                    .push(PerturbationSeed::new(&obs.location_id, shock).at(obs.observed_at));
            }
        }

        result
    }

    /// Take an immutable snapshot, flagging nodes not observed within `staleness`
    pub fn snapshot(&self, now: DateTime<Utc>, staleness: Duration) -> Arc<LocationSnapshot> {
        let nodes = self
            .nodes
            .values()
            .map(|node| {
                let mut node = node.clone();
                node.stale = now - node.last_observed > staleness;
                node
            })
            .collect();

        Arc::new(LocationSnapshot { taken_at: now, nodes })
    }
}

/// Read-only view of all locations at cycle start, ordered by id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationSnapshot {
    pub taken_at: DateTime<Utc>,
    nodes: Vec<LocationNode>,
}

impl LocationSnapshot {
    /// Build a snapshot from already-materialised nodes, keeping stale flags as given.
    ///
    /// A repeated id keeps its last occurrence, as [`LocationStore::from_nodes`] does.
    pub fn new(taken_at: DateTime<Utc>, mut nodes: Vec<LocationNode>) -> Self {
        // Stable sort on the reversed input puts the last duplicate first
        nodes.reverse();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes.dedup_by(|later, earlier| later.id == earlier.id);
        Self { taken_at, nodes }
    }

    pub fn nodes(&self) -> &[LocationNode] {
        &self.nodes
    }

    pub fn get(&self, id: &str) -> Option<&LocationNode> {
        self.nodes
            .binary_search_by(|n| n.id.as_str().cmp(id))
            .ok()
            .map(|idx| &self.nodes[idx])
    }

    pub fn stale_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.stale).count()
    }
}

fn clamp_sentiment(value: f64) -> f64 {
    value.clamp(MIN_SENTIMENT, MAX_SENTIMENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, sentiment: f64, at: DateTime<Utc>) -> LocationNode {
        LocationNode::new(id, Coordinates::new(40.0, -74.0), "acme", "cafe", sentiment, at)
    }

    #[test]
    fn test_haversine_distance() {
        // Paris to London, roughly 344 km
        let paris = Coordinates::new(48.8566, 2.3522);
        let london = Coordinates::new(51.5074, -0.1278);
        let d = paris.distance_km(&london);
        assert!((d - 343.5).abs() < 2.0, "got {d}");
        assert_eq!(paris.distance_km(&paris), 0.0);
    }

    #[test]
    fn test_later_duplicate_wins() {
        let t0 = Utc::now();
        let nodes = vec![node("a", 0.1, t0), node("b", 0.0, t0), node("a", 0.7, t0)];

        let snapshot = LocationSnapshot::new(t0, nodes.clone());
        assert_eq!(snapshot.nodes().len(), 2);
        assert_eq!(snapshot.get("a").unwrap().sentiment, 0.7);

        let store = LocationStore::from_nodes(nodes);
        let from_store = store.snapshot(t0, Duration::hours(1));
        assert_eq!(from_store.get("a").unwrap().sentiment, snapshot.get("a").unwrap().sentiment);
    }

    #[test]
    fn test_sentiment_is_clamped() {
        let n = node("a", 3.0, Utc::now());
        assert_eq!(n.sentiment, 1.0);
    }

    #[test]
    fn test_observations_emit_seeds() {
        let t0 = Utc::now();
        let mut store = LocationStore::from_nodes([node("a", 0.5, t0), node("b", 0.0, t0)]);

        let batch = vec![
            Observation {
                location_id: "a".into(),
                sentiment: -0.3,
                observed_at: t0 + Duration::hours(1),
            },
            Observation {
                location_id: "b".into(),
                sentiment: 0.0,
                observed_at: t0 + Duration::hours(1),
            },
            Observation {
                location_id: "ghost".into(),
                sentiment: 0.9,
                observed_at: t0,
            },
        ];

        let result = store.apply_observations(&batch);
        assert_eq!(result.applied, 2);
        assert_eq!(result.unknown, 1);
        assert_eq!(result.seeds.len(), 1);
        assert_eq!(result.seeds[0].node_id, "a");
        assert!((result.seeds[0].magnitude + 0.8).abs() < 1e-12);
        assert_eq!(store.get("a").unwrap().sentiment, -0.3);
    }

    #[test]
    fn test_out_of_order_observation_ignored() {
        let t0 = Utc::now();
        let mut store = LocationStore::from_nodes([node("a", 0.5, t0)]);

        let result = store.apply_observations(&[Observation {
            location_id: "a".into(),
            sentiment: -1.0,
            observed_at: t0 - Duration::hours(2),
        }]);

        assert_eq!(result.out_of_order, 1);
        assert!(result.seeds.is_empty());
        assert_eq!(store.get("a").unwrap().sentiment, 0.5);
    }

    #[test]
    fn test_snapshot_marks_stale() {
        let now = Utc::now();
        let store = LocationStore::from_nodes([
            node("fresh", 0.1, now - Duration::days(1)),
            node("old", 0.1, now - Duration::days(90)),
        ]);

        let snapshot = store.snapshot(now, Duration::days(30));
        assert_eq!(snapshot.stale_count(), 1);
        assert!(snapshot.get("old").unwrap().stale);
        assert!(!snapshot.get("old").unwrap().is_eligible());
        assert!(snapshot.get("fresh").unwrap().is_eligible());
        assert!(snapshot.get("missing").is_none());
    }
}
