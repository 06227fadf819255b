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

use std::fmt::Debug;

use pagecache_common::page::PageId;
use serde::{Deserialize, Serialize};

pub use self::{
    fifo::{Fifo, FifoConfig},
    lru::{Lru, LruConfig},
};

/// A resident page offered to an [`EvictionPolicy`].
///
/// Candidates are a read-only snapshot taken by the metadata store. The snapshot may be stale by the time victims
/// are evicted; the metadata store re-validates each victim before removing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Page id.
    pub page_id: PageId,
    /// Page size in bytes.
    pub size: u64,
    /// Logical clock tick of the last access. Larger is more recent.
    pub recency: u64,
    /// Admission order. Larger is newer.
    pub sequence: u64,
    /// Pinned pages are being read or written and must not be selected.
    pub pinned: bool,
}

/// Strategy deciding which resident pages to evict when space is needed.
///
/// Implementations must be pure: they only read the candidates and must not keep state derived from them.
///
/// Any implementation must:
///
/// - never select a pinned candidate;
/// - select at least one victim if an unpinned candidate exists and `bytes_needed > 0`.
pub trait EvictionPolicy: Send + Sync + Debug + 'static {
    /// Select victims in eviction order until their sizes cover `bytes_needed` or candidates run out.
    fn select_victims(&self, candidates: &[Candidate], bytes_needed: u64) -> Vec<PageId>;
}

/// Take unpinned candidates in the given order until `bytes_needed` is covered.
fn take_until_covered<'a>(ordered: impl Iterator<Item = &'a Candidate>, bytes_needed: u64) -> Vec<PageId> {
    let mut victims = vec![];
    let mut covered = 0;
    for candidate in ordered.filter(|c| !c.pinned) {
        if covered >= bytes_needed {
            break;
        }
        covered += candidate.size;
        victims.push(candidate.page_id.clone());
    }
    victims
}

/// Eviction algorithm config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EvictionConfig {
    /// Least-recently-used.
    Lru(LruConfig),
    /// First-in-first-out.
    Fifo(FifoConfig),
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self::Lru(LruConfig::default())
    }
}

impl From<LruConfig> for EvictionConfig {
    fn from(value: LruConfig) -> EvictionConfig {
        EvictionConfig::Lru(value)
    }
}

impl From<FifoConfig> for EvictionConfig {
    fn from(value: FifoConfig) -> EvictionConfig {
        EvictionConfig::Fifo(value)
    }
}

impl EvictionConfig {
    /// Build the configured policy.
    pub fn build(&self) -> Box<dyn EvictionPolicy> {
        match self {
            EvictionConfig::Lru(config) => Box::new(Lru::new(config.clone())),
            EvictionConfig::Fifo(config) => Box::new(Fifo::new(config.clone())),
        }
    }
}

pub mod fifo;
pub mod lru;
