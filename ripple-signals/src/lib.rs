//! Ripple Signals
//!
//! Turns analytic signals and the propagation signal into decisions:
//! - **Producers**: pluggable analytic sources behind one async trait
//! - **Arbiter**: deadline-bounded collection and weighted fusion
//! - **Consensus**: seeded ensembles of perturbed fusions, aggregated by vote
//!
//! ## Decisions
//!
//! Every fused result is an [`ArbitratedDecision`] carrying its direction,
//! confidence and a full [`Rationale`] of per-source contributions.

pub mod arbiter;
pub mod consensus;
pub mod decision;
pub mod producer;

pub use arbiter::*;
pub use consensus::*;
pub use decision::*;
pub use producer::*;
