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

//! Shadow cache.
//!
//! A shadow cache stores no page bytes. It remembers which pages were accessed within a sliding time window and
//! reports how many reads would have been hits for a cache large enough to hold the whole window's working set.

use std::{
    fmt::Debug,
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use pagecache_common::{
    error::Result,
    metrics::Metrics,
    page::{CacheContext, CacheScope, PageId},
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use twox_hash::XxHash64;

use self::bloom::{estimate_cardinality, union_ones, AtomicBloomFilter};
use crate::{
    engine::{CacheState, CacheUsage, Loader, PageCache},
    meta::{PageInfo, QuotaUsage},
    store::DataFileChannel,
};

pub mod bloom;

/// Config of the [`ShadowCache`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowCacheConfig {
    /// Length of the sliding window.
    pub window: Duration,
    /// Count of bloom filters the window is split into.
    pub filters: usize,
    /// Bits of each bloom filter.
    pub bits_per_filter: usize,
    /// Hash functions of each bloom filter.
    pub hashes: usize,
}

impl Default for ShadowCacheConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(24 * 60 * 60),
            filters: 4,
            bits_per_filter: 1 << 23,
            hashes: 3,
        }
    }
}

/// Snapshot of the shadow cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ShadowStats {
    /// Pages read.
    pub read_pages: u64,
    /// Bytes read.
    pub read_bytes: u64,
    /// Pages read that were seen within the window.
    pub hit_pages: u64,
    /// Bytes read from pages seen within the window.
    pub hit_bytes: u64,
    /// Estimated distinct pages within the window.
    pub working_set_pages: u64,
    /// Estimated distinct bytes within the window.
    pub working_set_bytes: u64,
}

impl ShadowStats {
    /// Ratio of page hits to page reads.
    pub fn hit_ratio(&self) -> f64 {
        if self.read_pages == 0 {
            return 0.0;
        }
        self.hit_pages as f64 / self.read_pages as f64
    }

    /// Ratio of hit bytes to read bytes.
    pub fn byte_hit_ratio(&self) -> f64 {
        if self.read_bytes == 0 {
            return 0.0;
        }
        self.hit_bytes as f64 / self.read_bytes as f64
    }
}

/// Records page accesses in a ring of bloom filters, each covering `window / filters`.
///
/// All updates are lock-free. Rotation is attempted lazily on access and is skipped when another caller is already
/// rotating.
pub struct ShadowCache {
    filters: Box<[AtomicBloomFilter]>,
    current: AtomicUsize,
    period: Duration,
    rotated_at: Mutex<Instant>,

    read_pages: AtomicU64,
    read_bytes: AtomicU64,
    hit_pages: AtomicU64,
    hit_bytes: AtomicU64,
    // Sizes of pages new to the window, for the average page size.
    sampled_pages: AtomicU64,
    sampled_bytes: AtomicU64,

    metrics: Arc<Metrics>,
}

impl Debug for ShadowCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShadowCache")
            .field("filters", &self.filters.len())
            .field("current", &self.current.load(Ordering::Relaxed))
            .field("period", &self.period)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ShadowCache {
    /// Create an empty shadow cache.
    pub fn new(config: &ShadowCacheConfig, metrics: Arc<Metrics>) -> Self {
        let filters = config.filters.max(1);
        Self {
            filters: (0..filters)
                .map(|_| AtomicBloomFilter::new(config.bits_per_filter, config.hashes))
                .collect(),
            current: AtomicUsize::new(0),
            period: config.window / filters as u32,
            rotated_at: Mutex::new(Instant::now()),
            read_pages: AtomicU64::new(0),
            read_bytes: AtomicU64::new(0),
            hit_pages: AtomicU64::new(0),
            hit_bytes: AtomicU64::new(0),
            sampled_pages: AtomicU64::new(0),
            sampled_bytes: AtomicU64::new(0),
            metrics,
        }
    }

    fn hash(page_id: &PageId) -> u64 {
        let mut hasher = XxHash64::with_seed(0);
        page_id.hash(&mut hasher);
        hasher.finish()
    }

    fn maybe_rotate(&self) {
        let Some(mut rotated_at) = self.rotated_at.try_lock() else {
            return;
        };
        let now = Instant::now();
        if now.duration_since(*rotated_at) >= self.period {
            *rotated_at = now;
            self.rotate();
        }
    }

    fn rotate(&self) {
        let next = (self.current.load(Ordering::Relaxed) + 1) % self.filters.len();
        self.filters[next].clear();
        self.current.store(next, Ordering::Relaxed);
        self.report();
    }

    /// Age out the oldest filter now.
    pub fn aging(&self) {
        let mut rotated_at = self.rotated_at.lock();
        *rotated_at = Instant::now();
        self.rotate();
    }

    /// Record that a page of `size` bytes was seen.
    pub fn record(&self, page_id: &PageId, size: usize) {
        self.maybe_rotate();
        self.insert(Self::hash(page_id), size);
    }

    fn insert(&self, hash: u64, size: usize) {
        let seen = self.filters.iter().any(|f| f.contains(hash));
        self.filters[self.current.load(Ordering::Relaxed)].insert(hash);
        if !seen && size > 0 {
            self.sampled_pages.fetch_add(1, Ordering::Relaxed);
            self.sampled_bytes.fetch_add(size as u64, Ordering::Relaxed);
        }
    }

    /// Record a read of `bytes` bytes from a page. Returns `true` if the page was seen within the window.
    pub fn access(&self, page_id: &PageId, bytes: usize) -> bool {
        self.maybe_rotate();
        let hash = Self::hash(page_id);
        let hit = self.filters.iter().any(|f| f.contains(hash));

        self.read_pages.fetch_add(1, Ordering::Relaxed);
        self.read_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.metrics.shadow_read_pages.increase(1);
        self.metrics.shadow_read_bytes.increase(bytes as u64);
        if hit {
            self.hit_pages.fetch_add(1, Ordering::Relaxed);
            self.hit_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
            self.metrics.shadow_hit_pages.increase(1);
            self.metrics.shadow_hit_bytes.increase(bytes as u64);
        }

        self.insert(hash, bytes);
        hit
    }

    /// Estimated distinct pages within the window.
    pub fn working_set_pages(&self) -> u64 {
        let first = &self.filters[0];
        estimate_cardinality(first.bits(), first.hashes(), union_ones(&self.filters))
    }

    /// Estimated distinct bytes within the window.
    pub fn working_set_bytes(&self) -> u64 {
        let pages = self.sampled_pages.load(Ordering::Relaxed);
        if pages == 0 {
            return 0;
        }
        let average = self.sampled_bytes.load(Ordering::Relaxed) / pages;
        self.working_set_pages() * average
    }

    fn report(&self) {
        self.metrics.shadow_working_set_pages.absolute(self.working_set_pages());
        self.metrics.shadow_working_set_bytes.absolute(self.working_set_bytes());
    }

    /// Snapshot the statistics.
    pub fn stats(&self) -> ShadowStats {
        ShadowStats {
            read_pages: self.read_pages.load(Ordering::Relaxed),
            read_bytes: self.read_bytes.load(Ordering::Relaxed),
            hit_pages: self.hit_pages.load(Ordering::Relaxed),
            hit_bytes: self.hit_bytes.load(Ordering::Relaxed),
            working_set_pages: self.working_set_pages(),
            working_set_bytes: self.working_set_bytes(),
        }
    }
}

/// A page cache decorator feeding every access into a [`ShadowCache`].
///
/// Results of the wrapped cache are returned unchanged.
#[derive(Debug)]
pub struct ShadowPageCache<C> {
    inner: C,
    shadow: Arc<ShadowCache>,
}

impl<C: PageCache> ShadowPageCache<C> {
    /// Wrap a page cache.
    pub fn new(inner: C, shadow: Arc<ShadowCache>) -> Self {
        Self { inner, shadow }
    }

    /// The shadow cache.
    pub fn shadow(&self) -> &Arc<ShadowCache> {
        &self.shadow
    }

    /// The wrapped page cache.
    pub fn inner(&self) -> &C {
        &self.inner
    }
}

impl<C: PageCache> PageCache for ShadowPageCache<C> {
    fn put(&self, page_id: &PageId, page: Bytes, ctx: &CacheContext) -> Result<bool> {
        if ctx.is_cacheable() {
            self.shadow.record(page_id, page.len());
        }
        self.inner.put(page_id, page, ctx)
    }

    fn get(&self, page_id: &PageId, page_offset: usize, buf: &mut [u8], ctx: &CacheContext) -> Result<usize> {
        if ctx.is_cacheable() {
            self.shadow.access(page_id, buf.len());
        }
        self.inner.get(page_id, page_offset, buf, ctx)
    }

    fn get_and_load(
        &self,
        page_id: &PageId,
        page_offset: usize,
        buf: &mut [u8],
        ctx: &CacheContext,
        loader: Loader<'_>,
    ) -> Result<usize> {
        if ctx.is_cacheable() {
            self.shadow.access(page_id, buf.len());
        }
        self.inner.get_and_load(page_id, page_offset, buf, ctx, loader)
    }

    fn append(&self, page_id: &PageId, append_at: usize, page: Bytes, ctx: &CacheContext) -> Result<bool> {
        if ctx.is_cacheable() {
            self.shadow.record(page_id, append_at + page.len());
        }
        self.inner.append(page_id, append_at, page, ctx)
    }

    fn delete(&self, page_id: &PageId) -> Result<bool> {
        self.inner.delete(page_id)
    }

    fn delete_file(&self, file_id: &str) -> Result<()> {
        self.inner.delete_file(file_id)
    }

    fn delete_temp_file(&self, file_id: &str) -> Result<()> {
        self.inner.delete_temp_file(file_id)
    }

    fn commit_file(&self, file_id: &str) -> Result<()> {
        self.inner.commit_file(file_id)
    }

    fn invalidate(&self, predicate: &dyn Fn(&PageInfo) -> bool) -> Result<usize> {
        self.inner.invalidate(predicate)
    }

    fn data_file_channel(
        &self,
        page_id: &PageId,
        page_offset: usize,
        len: usize,
        ctx: &CacheContext,
    ) -> Result<DataFileChannel> {
        self.inner.data_file_channel(page_id, page_offset, len, ctx)
    }

    fn state(&self) -> CacheState {
        self.inner.state()
    }

    fn usage(&self) -> Option<CacheUsage> {
        self.inner.usage()
    }

    fn scope_usage(&self, scope: &CacheScope) -> Option<QuotaUsage> {
        self.inner.scope_usage(scope)
    }

    fn cached_page_ids(&self, file_id: &str) -> Vec<PageId> {
        self.inner.cached_page_ids(file_id)
    }

    fn has_page_unsafe(&self, page_id: &PageId) -> bool {
        self.inner.has_page_unsafe(page_id)
    }

    fn close(&self) -> Result<()> {
        self.shadow.report();
        self.inner.close()
    }
}
