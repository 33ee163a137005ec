//! Ripple Runtime
//!
//! Drives evaluation cycles over location snapshots:
//! - **Scopes**: brand, category, region, neighbourhood or everything
//! - **Engine**: per-scope propagation, arbitration and consensus
//! - **Reports**: JSON-serialisable cycle and scope outcomes

pub mod engine;
pub mod report;
pub mod scope;

pub use engine::*;
pub use report::*;
pub use scope::*;
