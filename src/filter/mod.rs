//! Pre-aggregation filtering
//!
//! Amount bounds and actor reputation checks applied to every purchase
//! event before it may touch an aggregate, plus the reputation providers
//! and the TTL cache in front of them.

pub mod admission;
pub mod cache;
pub mod reputation;

pub use admission::{AdmissionFilter, RejectReason, Reputation};
pub use cache::{ReputationCache, ReputationEntry, ReputationFacts};
pub use reputation::{HttpReputationProvider, ReputationProvider, StaticReputationProvider};
