//! Load-spreading node selection.

use std::sync::{Mutex, PoisonError};

use mdk_core::Node;
use rand::{Rng, SeedableRng, rngs::StdRng};

/// Picks uniformly at random among equally good candidates.
///
/// Seeded selectors produce the same sequence of picks for the same inputs,
/// which keeps resolution deterministic under test.
#[derive(Debug)]
pub struct NodeSelector {
    rng: Mutex<StdRng>,
}

impl NodeSelector {
    /// Create a selector seeded from OS entropy.
    #[must_use]
    pub fn from_entropy() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Create a deterministic selector.
    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Create a selector from an optional seed.
    #[must_use]
    pub fn new(seed: Option<u64>) -> Self {
        seed.map_or_else(Self::from_entropy, Self::seeded)
    }

    /// Pick one candidate, or `None` if there are none.
    pub fn pick<'a>(&self, candidates: &[&'a Node]) -> Option<&'a Node> {
        match candidates {
            [] => None,
            [only] => Some(*only),
            _ => {
                let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
                Some(candidates[rng.gen_range(0..candidates.len())])
            }
        }
    }
}

impl Default for NodeSelector {
    fn default() -> Self {
        Self::from_entropy()
    }
}
