//! Purchase-sequence fingerprinting
//!
//! Pure functions: size clustering over an aggregate's purchase amounts and
//! the additive suspicion/confidence model built on top of it.

pub mod similarity;
pub mod suspicion;

pub use similarity::{cluster_amounts, SimilarityResult};
pub use suspicion::{score, RiskTier, ScoreInput, SuspicionScore};
