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

use std::sync::atomic::{AtomicU64, Ordering};

/// A fixed-size bloom filter whose bits can be set and read concurrently without locks.
#[derive(Debug)]
pub struct AtomicBloomFilter {
    words: Box<[AtomicU64]>,
    hashes: usize,
}

impl AtomicBloomFilter {
    /// Create a filter of at least `bits` bits indexed by `hashes` hash functions.
    pub fn new(bits: usize, hashes: usize) -> Self {
        let words = bits.div_ceil(u64::BITS as usize).max(1);
        Self {
            words: (0..words).map(|_| AtomicU64::new(0)).collect(),
            hashes: hashes.max(1),
        }
    }

    /// Count of bits.
    pub fn bits(&self) -> usize {
        self.words.len() * u64::BITS as usize
    }

    /// Count of hash functions.
    pub fn hashes(&self) -> usize {
        self.hashes
    }

    fn positions(&self, hash: u64) -> impl Iterator<Item = (usize, u64)> + '_ {
        let bits = self.bits() as u64;
        (0..self.hashes).map(move |i| {
            let bit = combine_hashes(hash, twang_mix64(i as _)) % bits;
            ((bit / u64::BITS as u64) as usize, 1 << (bit % u64::BITS as u64))
        })
    }

    /// Insert a hash. Returns `true` if any bit was newly set.
    pub fn insert(&self, hash: u64) -> bool {
        let mut fresh = false;
        for (word, mask) in self.positions(hash) {
            fresh |= self.words[word].fetch_or(mask, Ordering::Relaxed) & mask == 0;
        }
        fresh
    }

    /// Returns `true` if the hash may have been inserted.
    pub fn contains(&self, hash: u64) -> bool {
        self.positions(hash)
            .all(|(word, mask)| self.words[word].load(Ordering::Relaxed) & mask != 0)
    }

    /// Reset all bits.
    pub fn clear(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }

    /// Count of set bits.
    pub fn ones(&self) -> u64 {
        self.words
            .iter()
            .map(|word| word.load(Ordering::Relaxed).count_ones() as u64)
            .sum()
    }
}

/// Count of set bits in the union of equally sized filters.
pub fn union_ones(filters: &[AtomicBloomFilter]) -> u64 {
    let Some(first) = filters.first() else {
        return 0;
    };
    (0..first.words.len())
        .map(|i| {
            filters
                .iter()
                .fold(0, |acc, f| acc | f.words[i].load(Ordering::Relaxed))
                .count_ones() as u64
        })
        .sum()
}

/// Estimate the count of distinct items inserted into a filter of `bits` bits and `hashes` hash functions with
/// `ones` bits set.
///
/// Swamidass & Baldi: `n = -(m / k) * ln(1 - X / m)`.
pub fn estimate_cardinality(bits: usize, hashes: usize, ones: u64) -> u64 {
    let m = bits as f64;
    let x = (ones as f64).min(m - 1.0);
    if x <= 0.0 {
        return 0;
    }
    (-(m / hashes as f64) * (1.0 - x / m).ln()).round() as u64
}

/// Reduce two 64-bit hashes into one.
///
/// Ported from CacheLib, which uses the `Hash128to64` function from Google's city hash.
#[inline(always)]
fn combine_hashes(upper: u64, lower: u64) -> u64 {
    const MUL: u64 = 0x9ddfea08eb382d69;

    let mut a = (lower ^ upper).wrapping_mul(MUL);
    a ^= a >> 47;
    let mut b = (upper ^ a).wrapping_mul(MUL);
    b ^= b >> 47;
    b = b.wrapping_mul(MUL);
    b
}

#[inline(always)]
fn twang_mix64(val: u64) -> u64 {
    let mut val = (!val).wrapping_add(val << 21);
    val = val ^ (val >> 24);
    val = val.wrapping_add(val << 3).wrapping_add(val << 8);
    val = val ^ (val >> 14);
    val = val.wrapping_add(val << 2).wrapping_add(val << 4);
    val = val ^ (val >> 28);
    val = val.wrapping_add(val << 31);
    val
}
