// Copyright 2025 foyer Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use itertools::Itertools;
use pagecache_common::page::PageId;
use serde::{Deserialize, Serialize};

use super::{take_until_covered, Candidate, EvictionPolicy};

/// Fifo eviction algorithm config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FifoConfig {}

/// First-in-first-out eviction. Accesses do not affect the order.
#[derive(Debug)]
pub struct Fifo {
    _config: FifoConfig,
}

impl Fifo {
    /// Create a fifo policy.
    pub fn new(config: FifoConfig) -> Self {
        Self { _config: config }
    }
}

impl EvictionPolicy for Fifo {
    fn select_victims(&self, candidates: &[Candidate], bytes_needed: u64) -> Vec<PageId> {
        if bytes_needed == 0 {
            return vec![];
        }
        let ordered = candidates.iter().sorted_by_key(|c| c.sequence);
        take_until_covered(ordered, bytes_needed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eviction::test_utils::{assert_policy_contract, candidate, indices};

    #[test]
    fn test_fifo_contract() {
        assert_policy_contract(&Fifo::new(FifoConfig::default()));
    }

    #[test]
    fn test_fifo_ignores_recency() {
        let fifo = Fifo::new(FifoConfig::default());

        let candidates = vec![candidate("f", 0, 4, 9, 2), candidate("f", 1, 4, 1, 1), candidate("f", 2, 4, 5, 0)];

        assert_eq!(indices(&fifo.select_victims(&candidates, 8)), vec![2, 1]);
    }
}
