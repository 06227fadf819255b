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

/// Lru eviction algorithm config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LruConfig {}

/// Least-recently-used eviction.
///
/// Victims are taken in ascending recency. Equal recency falls back to admission order, so the order is stable.
#[derive(Debug)]
pub struct Lru {
    _config: LruConfig,
}

impl Lru {
    /// Create a lru policy.
    pub fn new(config: LruConfig) -> Self {
        Self { _config: config }
    }
}

impl EvictionPolicy for Lru {
    fn select_victims(&self, candidates: &[Candidate], bytes_needed: u64) -> Vec<PageId> {
        if bytes_needed == 0 {
            return vec![];
        }
        let ordered = candidates.iter().sorted_by_key(|c| (c.recency, c.sequence));
        take_until_covered(ordered, bytes_needed)
    }
}
