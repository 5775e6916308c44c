//! Mutable detector state
//!
//! The position book and the reputation caches sit behind one mutex. No
//! collaborator I/O is performed while the guard is held.

use tokio::sync::Mutex;

use crate::config::Config;
use crate::filter::cache::ReputationCache;
use crate::position::book::PositionBook;

#[derive(Debug)]
pub struct DetectorState {
    pub positions: PositionBook,
    pub reputation: ReputationCache,
}

impl DetectorState {
    pub fn new(config: &Config) -> Self {
        Self {
            positions: PositionBook::new(),
            reputation: ReputationCache::from_config(&config.cache),
        }
    }
}

pub type SharedState = Mutex<DetectorState>;
