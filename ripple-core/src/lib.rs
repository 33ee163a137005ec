//! Ripple Core - location graph and propagation analysis
//!
//! This crate provides the deterministic half of the engine:
//! - Location nodes, observation batches and immutable snapshots
//! - Weighted, typed relationship graphs over locations
//! - Discrete-step diffusion of sentiment shocks
//! - Echo (perturbation sensitivity) analysis of trajectories
//! - Stability regimes and contagion candidates
//! - Engine configuration and the shared error taxonomy

pub mod config;
pub mod criticality;
pub mod diffusion;
pub mod echo;
pub mod error;
pub mod graph;
pub mod location;
pub mod signal;

pub use config::*;
pub use criticality::*;
pub use diffusion::*;
pub use echo::*;
pub use error::*;
pub use graph::*;
pub use location::*;
pub use signal::*;

/// Lower bound of the sentiment scale
pub const MIN_SENTIMENT: f64 = -1.0;

/// Upper bound of the sentiment scale
pub const MAX_SENTIMENT: f64 = 1.0;

/// Mean Earth radius used for haversine distances (km)
pub const EARTH_RADIUS_KM: f64 = 6371.0088;

/// Discrepancies below this are treated as "not reached"
pub const DISCREPANCY_FLOOR: f64 = 1e-12;
