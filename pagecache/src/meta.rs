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

//! Page metadata store.
//!
//! The single source of truth for residency and quota. Pages live in hash-sharded maps; each shard lock is the
//! mutual exclusion domain of its pages. The quota table sits under one mutex held only for the charge or release,
//! and the per-file index sits under its own lock.
//!
//! Lock order: shard, committing files, quota, file index. No lock is held across a page store call.

use std::{
    collections::BTreeMap,
    fmt::Debug,
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use hashbrown::{HashMap, HashSet};
use itertools::Itertools;
use pagecache_common::{
    error::{Error, ErrorKind, Result},
    metrics::Metrics,
    page::{CacheScope, PageId},
};
use parking_lot::{Mutex, RwLock};
use twox_hash::XxHash64;

use crate::{
    eviction::{Candidate, EvictionPolicy},
    store::PageStore,
};

/// Durability of a resident page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    /// The page store holds the page bytes.
    Clean,
    /// The page bytes are staged in memory and queued for a background write.
    PendingAsyncWrite,
}

/// Metadata of a resident page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageInfo {
    /// Page id.
    pub page_id: PageId,
    /// Scope the page is charged to.
    pub scope: CacheScope,
    /// Page size in bytes.
    pub size: u64,
    /// Logical clock tick of the last access.
    pub recency: u64,
    /// Admission order.
    pub sequence: u64,
    /// Durability state.
    pub write_state: WriteState,
    /// Whether the page belongs to an uncommitted file.
    pub temporary: bool,
}

/// Why a reservation was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    /// The page is larger than a capacity on its scope chain.
    #[error("page of {size} bytes exceeds the capacity of scope {scope}")]
    TooLarge {
        /// The scope whose capacity is exceeded.
        scope: CacheScope,
        /// The page size.
        size: u64,
    },
    /// Nothing evictable frees enough space.
    #[error("no evictable space in scope {scope}")]
    NoSpace {
        /// The scope that needed space.
        scope: CacheScope,
    },
    /// The retry budget is exhausted while racing with other admissions or evictions.
    #[error("contended")]
    Contended,
}

/// Result of [`PageMetadataStore::reserve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Space is charged and the page is `Reserving`. Finalize with [`PageMetadataStore::commit`] or
    /// [`PageMetadataStore::abort`].
    Admitted {
        /// Admission order of the reserved page.
        sequence: u64,
    },
    /// The page is already resident.
    Present,
    /// The reservation is refused.
    Rejected(Rejection),
}

/// Result of [`PageMetadataStore::grow`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Growth {
    /// The delta is charged. Finalize with [`PageMetadataStore::finish_grow`].
    Granted,
    /// The page is not resident.
    Missing,
    /// The growth is refused.
    Rejected(Rejection),
}

/// Result of [`PageMetadataStore::finish_flush`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flushed {
    /// The pending page is clean now.
    Clean,
    /// The write failed and the pending page is dropped.
    Dropped,
    /// The page was removed while the write was in flight. The written bytes are deleted.
    Gone,
    /// No admission matches the write.
    Superseded,
}

/// Usage of a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaUsage {
    /// Bytes charged to the scope and its descendants.
    pub used: u64,
    /// Configured capacity. `None` if the scope is bounded only by its ancestors.
    pub capacity: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Residency {
    Reserving,
    Resident,
    Evicting,
    /// Removed while its background write is in flight. Holds no space, and blocks admission of the page id until
    /// the write settles.
    Orphaned,
}

#[derive(Debug)]
struct Entry {
    scope: CacheScope,
    size: u64,
    sequence: u64,
    recency: AtomicU64,
    temporary: bool,
    residency: Residency,
    appending: bool,
    committing: bool,
    staged: Option<Bytes>,
    pins: Arc<AtomicUsize>,
}

impl Entry {
    fn info(&self, page_id: &PageId) -> PageInfo {
        PageInfo {
            page_id: page_id.clone(),
            scope: self.scope.clone(),
            size: self.size,
            recency: self.recency.load(Ordering::Relaxed),
            sequence: self.sequence,
            write_state: if self.staged.is_some() {
                WriteState::PendingAsyncWrite
            } else {
                WriteState::Clean
            },
            temporary: self.temporary,
        }
    }

    fn evictable(&self) -> bool {
        self.residency == Residency::Resident && self.staged.is_none() && !self.busy()
    }

    /// An append or a file commit holds the page.
    fn busy(&self) -> bool {
        self.appending || self.committing
    }
}

/// A resident page that cannot be evicted or removed while the guard is held.
#[derive(Debug)]
pub struct PinnedPage {
    info: PageInfo,
    staged: Option<Bytes>,
    pins: Arc<AtomicUsize>,
}

impl PinnedPage {
    /// Metadata of the page at the time it was pinned.
    pub fn info(&self) -> &PageInfo {
        &self.info
    }

    /// Page bytes not yet written to the page store.
    pub fn staged(&self) -> Option<&Bytes> {
        self.staged.as_ref()
    }
}

impl Drop for PinnedPage {
    fn drop(&mut self) {
        self.pins.fetch_sub(1, Ordering::Release);
    }
}

enum Charge {
    Charged,
    TooLarge(CacheScope),
    Shortfall { domain: CacheScope, needed: u64 },
}

#[derive(Debug, Default)]
struct Quotas {
    capacities: HashMap<CacheScope, u64>,
    used: HashMap<CacheScope, u64>,
    pages: u64,
}

impl Quotas {
    fn used(&self, scope: &CacheScope) -> u64 {
        self.used.get(scope).copied().unwrap_or_default()
    }

    /// Charge `amount` bytes to `scope` and all its ancestors if every capacity on the chain allows it.
    ///
    /// `footprint` is the size the page will have after the charge.
    fn try_charge(&mut self, scope: &CacheScope, amount: u64, footprint: u64) -> Charge {
        let chain = scope.ancestors().collect_vec();

        for s in chain.iter() {
            if let Some(&capacity) = self.capacities.get(s) {
                if footprint > capacity {
                    return Charge::TooLarge(s.clone());
                }
            }
        }

        // Innermost violation first.
        for s in chain.iter() {
            if let Some(&capacity) = self.capacities.get(s) {
                let used = self.used(s);
                if used + amount > capacity {
                    return Charge::Shortfall {
                        domain: s.clone(),
                        needed: used + amount - capacity,
                    };
                }
            }
        }

        for s in chain {
            *self.used.entry(s).or_default() += amount;
        }
        Charge::Charged
    }

    fn release(&mut self, scope: &CacheScope, amount: u64) {
        for s in scope.ancestors() {
            if let Some(used) = self.used.get_mut(&s) {
                debug_assert!(*used >= amount, "quota underflow on scope {s}: {used} < {amount}");
                *used = used.saturating_sub(amount);
            }
        }
    }

    fn total(&self) -> u64 {
        self.used(&CacheScope::global())
    }
}

/// Config of the [`PageMetadataStore`].
#[derive(Debug, Clone)]
pub struct MetaConfig {
    /// Total capacity in bytes, the capacity of the global scope.
    pub capacity: u64,
    /// Capacities of non-global scopes.
    pub quotas: Vec<(CacheScope, u64)>,
    /// Count of page map shards.
    pub shards: usize,
    /// Attempts before a racing reservation gives up.
    pub retry_budget: usize,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            capacity: 0,
            quotas: vec![],
            shards: 64,
            retry_budget: 8,
        }
    }
}

/// The page metadata store.
pub struct PageMetadataStore {
    shards: Vec<RwLock<HashMap<PageId, Entry>>>,
    quotas: Mutex<Quotas>,
    files: RwLock<HashMap<Arc<str>, BTreeMap<u64, bool>>>,
    committing: Mutex<HashSet<Arc<str>>>,

    clock: AtomicU64,
    sequence: AtomicU64,
    retry_budget: usize,

    policy: Box<dyn EvictionPolicy>,
    store: Arc<dyn PageStore>,
    metrics: Arc<Metrics>,
}

impl Debug for PageMetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageMetadataStore")
            .field("shards", &self.shards.len())
            .field("policy", &self.policy)
            .field("usage", &self.total_usage())
            .finish()
    }
}

impl PageMetadataStore {
    /// Create an empty metadata store.
    ///
    /// Evicted pages are deleted from `store`.
    pub fn new(
        config: MetaConfig,
        policy: Box<dyn EvictionPolicy>,
        store: Arc<dyn PageStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        assert!(config.shards > 0, "shards must be greater than zero.");

        let mut capacities = config.quotas.into_iter().collect::<HashMap<_, _>>();
        capacities.insert(CacheScope::global(), config.capacity);

        Self {
            shards: (0..config.shards).map(|_| RwLock::default()).collect(),
            quotas: Mutex::new(Quotas {
                capacities,
                ..Default::default()
            }),
            files: RwLock::default(),
            committing: Mutex::default(),
            clock: AtomicU64::new(0),
            sequence: AtomicU64::new(0),
            retry_budget: config.retry_budget.max(1),
            policy,
            store,
            metrics,
        }
    }

    fn shard(&self, page_id: &PageId) -> &RwLock<HashMap<PageId, Entry>> {
        let mut hasher = XxHash64::with_seed(0);
        page_id.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % self.shards.len()]
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn report(&self, quotas: &Quotas) {
        self.metrics.usage_bytes.absolute(quotas.total());
        self.metrics.resident_pages.absolute(quotas.pages);
    }

    /// Reserve `size` bytes for a page charged to `scope`, evicting other pages if needed.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "pagecache::meta::reserve"))]
    pub fn reserve(&self, page_id: &PageId, scope: &CacheScope, size: u64, temporary: bool) -> Admission {
        for attempt in 0..self.retry_budget {
            let shortfall = {
                let mut shard = self.shard(page_id).write();
                match shard.get(page_id).map(|e| e.residency) {
                    Some(Residency::Resident) => return Admission::Present,
                    Some(Residency::Reserving | Residency::Evicting | Residency::Orphaned) => None,
                    // Temporary pages of a file cannot join it while it is being committed.
                    None if temporary && self.committing.lock().contains(page_id.file_id()) => None,
                    None => {
                        let mut quotas = self.quotas.lock();
                        match quotas.try_charge(scope, size, size) {
                            Charge::TooLarge(scope) => return Admission::Rejected(Rejection::TooLarge { scope, size }),
                            Charge::Shortfall { domain, needed } => Some((domain, needed)),
                            Charge::Charged => {
                                quotas.pages += 1;
                                self.report(&quotas);
                                let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
                                shard.insert(
                                    page_id.clone(),
                                    Entry {
                                        scope: scope.clone(),
                                        size,
                                        sequence,
                                        recency: AtomicU64::new(self.tick()),
                                        temporary,
                                        residency: Residency::Reserving,
                                        appending: false,
                                        committing: false,
                                        staged: None,
                                        pins: Arc::default(),
                                    },
                                );
                                self.files
                                    .write()
                                    .entry(Arc::from(page_id.file_id()))
                                    .or_default()
                                    .insert(page_id.page_index(), temporary);
                                return Admission::Admitted { sequence };
                            }
                        }
                    }
                }
            };

            match shortfall {
                // Another caller is admitting, removing or committing the page.
                None => backoff(attempt),
                Some((domain, needed)) => {
                    if self.evict(&domain, needed, None).is_none() {
                        return Admission::Rejected(Rejection::NoSpace { scope: domain });
                    }
                }
            }
        }

        Admission::Rejected(Rejection::Contended)
    }

    /// Finalize a `Reserving` page as resident.
    ///
    /// With `staged` bytes the page is resident as [`WriteState::PendingAsyncWrite`] and readers are served from
    /// the staged bytes until [`PageMetadataStore::finish_flush`].
    ///
    /// Returns `false` if the page is not `Reserving`.
    pub fn commit(&self, page_id: &PageId, staged: Option<Bytes>) -> bool {
        let mut shard = self.shard(page_id).write();
        match shard.get_mut(page_id) {
            Some(entry) if entry.residency == Residency::Reserving => {
                entry.residency = Residency::Resident;
                entry.staged = staged;
                true
            }
            _ => false,
        }
    }

    /// Roll back a `Reserving` page and release its space.
    pub fn abort(&self, page_id: &PageId) {
        let mut shard = self.shard(page_id).write();
        if shard.get(page_id).map(|e| e.residency) == Some(Residency::Reserving) {
            if let Some(entry) = shard.remove(page_id) {
                self.forget(page_id, &entry);
            }
        }
    }

    /// Release the space and the file index slot of a dropped entry. Called with its shard lock held.
    fn forget(&self, page_id: &PageId, entry: &Entry) {
        let mut quotas = self.quotas.lock();
        quotas.release(&entry.scope, entry.size);
        quotas.pages = quotas.pages.saturating_sub(1);
        self.report(&quotas);

        let mut files = self.files.write();
        if let Some(pages) = files.get_mut(page_id.file_id()) {
            pages.remove(&page_id.page_index());
            if pages.is_empty() {
                files.remove(page_id.file_id());
            }
        }
    }

    /// Metadata of a resident page.
    pub fn lookup(&self, page_id: &PageId) -> Option<PageInfo> {
        self.shard(page_id)
            .read()
            .get(page_id)
            .filter(|e| e.residency == Residency::Resident)
            .map(|e| e.info(page_id))
    }

    /// Mark a resident page as most recently used.
    pub fn touch(&self, page_id: &PageId) {
        if let Some(entry) = self.shard(page_id).read().get(page_id) {
            entry.recency.store(self.tick(), Ordering::Relaxed);
        }
    }

    /// Pin a resident page whose namespace matches `temporary`, and mark it as most recently used.
    ///
    /// Pages of a file being committed are not pinned, their bytes are moving between namespaces.
    pub fn pin(&self, page_id: &PageId, temporary: bool) -> Option<PinnedPage> {
        let shard = self.shard(page_id).read();
        let entry = shard
            .get(page_id)
            .filter(|e| e.residency == Residency::Resident && e.temporary == temporary && !e.committing)?;
        entry.pins.fetch_add(1, Ordering::Acquire);
        entry.recency.store(self.tick(), Ordering::Relaxed);
        Some(PinnedPage {
            info: entry.info(page_id),
            staged: entry.staged.clone(),
            pins: entry.pins.clone(),
        })
    }

    /// Best-effort residency check without waiting for locks. May report `false` for a resident page.
    pub fn contains_unsafe(&self, page_id: &PageId) -> bool {
        self.shard(page_id)
            .try_read()
            .is_some_and(|shard| shard.get(page_id).is_some_and(|e| e.residency == Residency::Resident))
    }

    /// Remove a resident page: mark it `Evicting`, wait for readers to unpin it, delete its bytes, then drop its
    /// metadata.
    ///
    /// Waits for an append or a file commit holding the page to finish first. A page whose background write is in
    /// flight releases its space at once and stays `Orphaned` until [`PageMetadataStore::finish_flush`] deletes the
    /// written bytes.
    ///
    /// Returns `Ok(false)` if the page is not resident or is already being removed.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "pagecache::meta::remove"))]
    pub fn remove(&self, page_id: &PageId) -> Result<bool> {
        let mut attempt = 0;
        let (pins, temporary) = loop {
            {
                let mut shard = self.shard(page_id).write();
                let Some(entry) = shard.get_mut(page_id) else {
                    return Ok(false);
                };
                match entry.residency {
                    Residency::Resident if entry.busy() => {}
                    Residency::Resident if entry.staged.is_some() => {
                        entry.residency = Residency::Orphaned;
                        entry.staged = None;
                        self.forget(page_id, entry);
                        return Ok(true);
                    }
                    Residency::Resident => {
                        entry.residency = Residency::Evicting;
                        break (entry.pins.clone(), entry.temporary);
                    }
                    Residency::Reserving | Residency::Evicting | Residency::Orphaned => return Ok(false),
                }
            }
            backoff(attempt);
            attempt += 1;
        };

        let mut spins = 0;
        while pins.load(Ordering::Acquire) > 0 {
            backoff(spins);
            spins += 1;
        }

        match self.store.delete_page(page_id, temporary) {
            Ok(()) => {}
            Err(e) if e.is_page_not_found() => {}
            Err(e) => {
                if let Some(entry) = self.shard(page_id).write().get_mut(page_id) {
                    entry.residency = Residency::Resident;
                }
                return Err(e);
            }
        }

        self.drop_evicting(page_id);
        Ok(true)
    }

    fn drop_evicting(&self, page_id: &PageId) {
        let mut shard = self.shard(page_id).write();
        if shard.get(page_id).map(|e| e.residency) == Some(Residency::Evicting) {
            if let Some(entry) = shard.remove(page_id) {
                self.forget(page_id, &entry);
            }
        }
    }

    /// Evict pages within `domain` to free `needed` bytes, never touching `exclude`.
    ///
    /// Returns the bytes freed, or `None` if the policy found nothing to evict.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "pagecache::meta::evict"))]
    fn evict(&self, domain: &CacheScope, needed: u64, exclude: Option<&PageId>) -> Option<u64> {
        let mut candidates = vec![];
        for shard in self.shards.iter() {
            let shard = shard.read();
            candidates.extend(
                shard
                    .iter()
                    .filter(|(id, e)| e.evictable() && domain.contains(&e.scope) && Some(*id) != exclude)
                    .map(|(id, e)| Candidate {
                        page_id: id.clone(),
                        size: e.size,
                        recency: e.recency.load(Ordering::Relaxed),
                        sequence: e.sequence,
                        pinned: e.pins.load(Ordering::Acquire) > 0,
                    }),
            );
        }

        let victims = self.policy.select_victims(&candidates, needed);
        if victims.is_empty() {
            return None;
        }

        let mut freed = 0;
        for victim in victims {
            // Re-validate, the snapshot may be stale.
            let temporary = {
                let mut shard = self.shard(&victim).write();
                match shard.get_mut(&victim) {
                    Some(e) if e.evictable() && e.pins.load(Ordering::Acquire) == 0 && domain.contains(&e.scope) => {
                        e.residency = Residency::Evicting;
                        e.temporary
                    }
                    _ => continue,
                }
            };

            match self.store.delete_page(&victim, temporary) {
                Ok(()) => {}
                Err(e) if e.is_page_not_found() => {}
                Err(e) => {
                    tracing::warn!("[page meta]: failed to delete evicted page {victim}, keep it resident: {e}");
                    if let Some(entry) = self.shard(&victim).write().get_mut(&victim) {
                        entry.residency = Residency::Resident;
                    }
                    continue;
                }
            }

            let size = {
                let mut shard = self.shard(&victim).write();
                match shard.remove(&victim) {
                    Some(entry) => {
                        self.forget(&victim, &entry);
                        entry.size
                    }
                    None => 0,
                }
            };
            freed += size;
            self.metrics.evict.increase(1);
            tracing::trace!("[page meta]: evicted page {victim} ({size} bytes) from scope {domain}");
        }

        Some(freed)
    }

    /// Charge `delta` more bytes to a resident page of `expected_len` bytes before appending to it.
    ///
    /// The page cannot be evicted until [`PageMetadataStore::finish_grow`]. Returns
    /// [`ErrorKind::InvalidArgument`] if the page size differs from `expected_len`.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "pagecache::meta::grow"))]
    pub fn grow(&self, page_id: &PageId, expected_len: u64, delta: u64) -> Result<Growth> {
        for attempt in 0..self.retry_budget {
            let shortfall = {
                let mut shard = self.shard(page_id).write();
                let Some(entry) = shard.get_mut(page_id) else {
                    return Ok(Growth::Missing);
                };
                match entry.residency {
                    Residency::Evicting | Residency::Orphaned => return Ok(Growth::Missing),
                    Residency::Reserving => None,
                    // Wait for concurrent appends, commits and the background write to settle.
                    Residency::Resident if entry.busy() || entry.staged.is_some() => None,
                    Residency::Resident => {
                        if entry.size != expected_len {
                            return Err(Error::new(ErrorKind::InvalidArgument, "append is not contiguous")
                                .with_context("page", page_id)
                                .with_context("size", entry.size)
                                .with_context("append_at", expected_len));
                        }
                        let mut quotas = self.quotas.lock();
                        match quotas.try_charge(&entry.scope, delta, entry.size + delta) {
                            Charge::TooLarge(scope) => {
                                return Ok(Growth::Rejected(Rejection::TooLarge {
                                    scope,
                                    size: entry.size + delta,
                                }))
                            }
                            Charge::Shortfall { domain, needed } => Some((domain, needed)),
                            Charge::Charged => {
                                self.report(&quotas);
                                entry.appending = true;
                                return Ok(Growth::Granted);
                            }
                        }
                    }
                }
            };

            match shortfall {
                None => backoff(attempt),
                Some((domain, needed)) => {
                    if self.evict(&domain, needed, Some(page_id)).is_none() {
                        return Ok(Growth::Rejected(Rejection::NoSpace { scope: domain }));
                    }
                }
            }
        }

        Ok(Growth::Rejected(Rejection::Contended))
    }

    /// Finish an append granted by [`PageMetadataStore::grow`].
    ///
    /// On success the page size grows by `delta`, otherwise the charged delta is released.
    pub fn finish_grow(&self, page_id: &PageId, delta: u64, ok: bool) {
        let mut shard = self.shard(page_id).write();
        let Some(entry) = shard.get_mut(page_id).filter(|e| e.appending) else {
            return;
        };
        entry.appending = false;
        if ok {
            entry.size += delta;
            entry.recency.store(self.tick(), Ordering::Relaxed);
        } else {
            let mut quotas = self.quotas.lock();
            quotas.release(&entry.scope, delta);
            self.report(&quotas);
        }
    }

    /// Settle the background write of admission `sequence`. `written` tells whether the page store holds the
    /// bytes now.
    ///
    /// A written page turns clean. A page whose write failed is dropped. A page removed while the write was in
    /// flight has the written bytes deleted before its id can be admitted again.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "pagecache::meta::finish_flush"))]
    pub fn finish_flush(&self, page_id: &PageId, sequence: u64, written: bool) -> Flushed {
        let temporary = {
            let mut shard = self.shard(page_id).write();
            let Some((residency, temporary)) = shard
                .get(page_id)
                .filter(|e| e.sequence == sequence)
                .map(|e| (e.residency, e.temporary))
            else {
                return Flushed::Superseded;
            };
            match (residency, written) {
                (Residency::Resident, true) => {
                    if let Some(entry) = shard.get_mut(page_id) {
                        entry.staged = None;
                    }
                    return Flushed::Clean;
                }
                (Residency::Resident, false) => {
                    if let Some(entry) = shard.remove(page_id) {
                        self.forget(page_id, &entry);
                    }
                    return Flushed::Dropped;
                }
                (Residency::Orphaned, false) => {
                    shard.remove(page_id);
                    return Flushed::Dropped;
                }
                (Residency::Orphaned, true) => temporary,
                (Residency::Reserving | Residency::Evicting, _) => return Flushed::Superseded,
            }
        };

        match self.store.delete_page(page_id, temporary) {
            Ok(()) => {}
            Err(e) if e.is_page_not_found() => {}
            Err(e) => tracing::warn!("[page meta]: failed to delete the bytes of removed page {page_id}: {e}"),
        }

        let mut shard = self.shard(page_id).write();
        if shard
            .get(page_id)
            .is_some_and(|e| e.residency == Residency::Orphaned && e.sequence == sequence)
        {
            shard.remove(page_id);
        }
        Flushed::Gone
    }

    /// Freeze the temporary pages of a file before moving them to the committed namespace.
    ///
    /// Waits until no page of the file is being admitted, written behind, appended to or removed, and until every
    /// reader has unpinned the frozen pages. Until [`PageMetadataStore::end_commit`], frozen pages are neither
    /// served, evicted nor removed, and no temporary page of the file is admitted.
    ///
    /// Returns the frozen pages, ordered by page index.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "pagecache::meta::begin_commit"))]
    pub fn begin_commit(&self, file_id: &str) -> Vec<PageId> {
        let file: Arc<str> = Arc::from(file_id);
        let mut attempt = 0;
        while !self.committing.lock().insert(file.clone()) {
            backoff(attempt);
            attempt += 1;
        }

        let mut frozen = vec![];
        let mut pins = vec![];
        let mut attempt = 0;
        loop {
            let mut busy = false;
            for shard in self.shards.iter() {
                let mut shard = shard.write();
                for (page_id, entry) in shard.iter_mut() {
                    if page_id.file_id() != file_id || !entry.temporary || entry.committing {
                        continue;
                    }
                    match entry.residency {
                        Residency::Resident if !entry.appending && entry.staged.is_none() => {
                            entry.committing = true;
                            frozen.push(page_id.clone());
                            pins.push(entry.pins.clone());
                        }
                        _ => busy = true,
                    }
                }
            }
            if !busy {
                break;
            }
            backoff(attempt);
            attempt += 1;
        }

        let mut spins = 0;
        while pins.iter().any(|pins| pins.load(Ordering::Acquire) > 0) {
            backoff(spins);
            spins += 1;
        }

        frozen.sort();
        frozen
    }

    /// Release the pages frozen by [`PageMetadataStore::begin_commit`].
    ///
    /// With `committed` the pages move to the committed namespace, otherwise they stay temporary.
    pub fn end_commit(&self, file_id: &str, frozen: &[PageId], committed: bool) {
        for page_id in frozen {
            let mut shard = self.shard(page_id).write();
            if let Some(entry) = shard.get_mut(page_id).filter(|e| e.committing) {
                entry.committing = false;
                if committed {
                    entry.temporary = false;
                    if let Some(pages) = self.files.write().get_mut(file_id) {
                        pages.insert(page_id.page_index(), false);
                    }
                }
            }
        }
        self.committing.lock().remove(file_id);
    }

    fn list_indices(&self, file_id: &str, temporary: bool) -> Vec<u64> {
        self.files
            .read()
            .get(file_id)
            .map(|pages| {
                pages
                    .iter()
                    .filter(|(_, t)| **t == temporary)
                    .map(|(index, _)| *index)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Resident pages of a file in the namespace selected by `temporary`, ordered by page index.
    pub fn list_by_file(&self, file_id: &str, temporary: bool) -> Vec<PageId> {
        self.list_indices(file_id, temporary)
            .into_iter()
            .map(|index| PageId::new(file_id, index))
            .filter(|page_id| self.lookup(page_id).is_some())
            .collect()
    }

    /// Metadata of all resident pages.
    pub fn snapshot(&self) -> Vec<PageInfo> {
        let mut infos = vec![];
        for shard in self.shards.iter() {
            let shard = shard.read();
            infos.extend(
                shard
                    .iter()
                    .filter(|(_, e)| e.residency == Residency::Resident)
                    .map(|(id, e)| e.info(id)),
            );
        }
        infos
    }

    /// Usage of a scope.
    pub fn usage(&self, scope: &CacheScope) -> QuotaUsage {
        let quotas = self.quotas.lock();
        QuotaUsage {
            used: quotas.used(scope),
            capacity: quotas.capacities.get(scope).copied(),
        }
    }

    /// Bytes charged to the global scope.
    pub fn total_usage(&self) -> u64 {
        self.quotas.lock().total()
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.quotas
            .lock()
            .capacities
            .get(&CacheScope::global())
            .copied()
            .unwrap_or_default()
    }

    /// Count of pages holding space, including pages being admitted.
    pub fn pages(&self) -> u64 {
        self.quotas.lock().pages
    }
}

fn backoff(attempt: usize) {
    if attempt < 4 {
        std::thread::yield_now();
    } else {
        std::thread::sleep(Duration::from_micros(10 << attempt.min(10)));
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use rand::Rng;

    use super::*;
    use crate::{eviction::LruConfig, store::MemoryPageStore};

    fn meta(capacity: u64, quotas: Vec<(CacheScope, u64)>) -> (Arc<PageMetadataStore>, Arc<MemoryPageStore>) {
        let store = Arc::new(MemoryPageStore::new());
        let meta = PageMetadataStore::new(
            MetaConfig {
                capacity,
                quotas,
                shards: 4,
                ..Default::default()
            },
            crate::eviction::EvictionConfig::from(LruConfig::default()).build(),
            store.clone(),
            Arc::new(Metrics::noop()),
        );
        (Arc::new(meta), store)
    }

    fn admit(meta: &PageMetadataStore, store: &MemoryPageStore, id: &PageId, scope: &CacheScope, size: u64) -> bool {
        match meta.reserve(id, scope, size, false) {
            Admission::Admitted { .. } => {
                store.write_page(id, false, Bytes::from(vec![0; size as usize])).unwrap();
                assert!(meta.commit(id, None));
                true
            }
            Admission::Present => true,
            Admission::Rejected(_) => false,
        }
    }

    fn page(index: u64) -> PageId {
        PageId::new("f", index)
    }

    #[test]
    fn test_is_send_sync_static() {
        fn is_send_sync_static<T: Send + Sync + 'static>() {}
        is_send_sync_static::<PageMetadataStore>();
        is_send_sync_static::<PinnedPage>();
    }

    #[test_log::test]
    fn test_lru_eviction_order() {
        let (meta, store) = meta(3, vec![]);
        let global = CacheScope::global();

        for i in 0..3 {
            assert!(admit(&meta, &store, &page(i), &global, 1));
        }
        meta.touch(&page(0));
        assert!(admit(&meta, &store, &page(3), &global, 1));

        assert!(meta.lookup(&page(0)).is_some());
        assert!(meta.lookup(&page(1)).is_none());
        assert!(meta.lookup(&page(2)).is_some());
        assert!(meta.lookup(&page(3)).is_some());
        assert_eq!(meta.total_usage(), 3);
        assert_eq!(store.len(), 3);
    }

    #[test_log::test]
    fn test_reserve_present_and_abort() {
        let (meta, store) = meta(10, vec![]);
        let global = CacheScope::global();

        assert!(matches!(meta.reserve(&page(0), &global, 4, false), Admission::Admitted { .. }));
        meta.abort(&page(0));
        assert_eq!(meta.total_usage(), 0);
        assert!(meta.lookup(&page(0)).is_none());

        assert!(admit(&meta, &store, &page(0), &global, 4));
        assert_eq!(meta.reserve(&page(0), &global, 4, false), Admission::Present);
        assert_eq!(meta.total_usage(), 4);
    }

    #[test_log::test]
    fn test_too_large() {
        let scope = CacheScope::new("db.t");
        let (meta, _) = meta(100, vec![(CacheScope::new("db"), 10)]);

        assert_eq!(
            meta.reserve(&page(0), &scope, 11, false),
            Admission::Rejected(Rejection::TooLarge {
                scope: CacheScope::new("db"),
                size: 11
            })
        );
        assert!(matches!(
            meta.reserve(&page(1), &CacheScope::global(), 101, false),
            Admission::Rejected(Rejection::TooLarge { .. })
        ));
        assert_eq!(meta.total_usage(), 0);
    }

    #[test_log::test]
    fn test_scope_quota_evicts_within_scope() {
        let db = CacheScope::new("db");
        let other = CacheScope::new("other");
        let (meta, store) = meta(100, vec![(db.clone(), 10)]);

        assert!(admit(&meta, &store, &PageId::new("o", 0), &other, 50));
        for i in 0..2 {
            assert!(admit(&meta, &store, &page(i), &CacheScope::new("db.t"), 5));
        }
        assert!(admit(&meta, &store, &page(2), &db, 5));

        // The page of the other scope survives the eviction inside `db`.
        assert!(meta.lookup(&PageId::new("o", 0)).is_some());
        assert!(meta.lookup(&page(0)).is_none());
        assert_eq!(meta.usage(&db), QuotaUsage { used: 10, capacity: Some(10) });
        assert_eq!(meta.usage(&CacheScope::new("db.t")).used, 5);
        assert_eq!(meta.total_usage(), 60);
    }

    #[test_log::test]
    fn test_no_space_when_everything_pinned() {
        let (meta, store) = meta(2, vec![]);
        let global = CacheScope::global();
        assert!(admit(&meta, &store, &page(0), &global, 2));

        let pinned = meta.pin(&page(0), false).unwrap();
        assert_eq!(
            meta.reserve(&page(1), &global, 1, false),
            Admission::Rejected(Rejection::NoSpace { scope: global.clone() })
        );
        drop(pinned);
        assert!(admit(&meta, &store, &page(1), &global, 1));
        assert!(meta.lookup(&page(0)).is_none());
    }

    #[test_log::test]
    fn test_pending_pages_are_not_evicted() {
        let (meta, _) = meta(2, vec![]);
        let global = CacheScope::global();

        let Admission::Admitted { sequence } = meta.reserve(&page(0), &global, 2, false) else {
            panic!("not admitted");
        };
        assert!(meta.commit(&page(0), Some(Bytes::from_static(b"ab"))));
        assert_eq!(meta.lookup(&page(0)).unwrap().write_state, WriteState::PendingAsyncWrite);
        assert!(matches!(
            meta.reserve(&page(1), &global, 1, false),
            Admission::Rejected(Rejection::NoSpace { .. })
        ));

        assert_eq!(meta.finish_flush(&page(0), sequence + 1, true), Flushed::Superseded);
        assert_eq!(meta.finish_flush(&page(9), sequence, true), Flushed::Superseded);
        assert_eq!(meta.finish_flush(&page(0), sequence, true), Flushed::Clean);
        assert_eq!(meta.lookup(&page(0)).unwrap().write_state, WriteState::Clean);
        assert!(matches!(meta.reserve(&page(1), &global, 1, false), Admission::Admitted { .. }));
    }

    #[test_log::test]
    fn test_failed_flush_drops_page() {
        let (meta, _) = meta(10, vec![]);
        let global = CacheScope::global();

        let Admission::Admitted { sequence } = meta.reserve(&page(0), &global, 2, false) else {
            panic!("not admitted");
        };
        assert!(meta.commit(&page(0), Some(Bytes::from_static(b"ab"))));
        assert_eq!(meta.finish_flush(&page(0), sequence, false), Flushed::Dropped);
        assert!(meta.lookup(&page(0)).is_none());
        assert!(meta.list_by_file("f", false).is_empty());
        assert_eq!(meta.total_usage(), 0);
        assert_eq!(meta.pages(), 0);
    }

    #[test_log::test]
    fn test_removed_pending_page_blocks_admission_until_flushed() {
        let (meta, store) = meta(10, vec![]);
        let global = CacheScope::global();

        let Admission::Admitted { sequence } = meta.reserve(&page(0), &global, 3, false) else {
            panic!("not admitted");
        };
        assert!(meta.commit(&page(0), Some(Bytes::from_static(b"old"))));

        // The space is released at once, the page id stays taken.
        assert!(meta.remove(&page(0)).unwrap());
        assert!(!meta.remove(&page(0)).unwrap());
        assert_eq!(meta.total_usage(), 0);
        assert!(meta.lookup(&page(0)).is_none());
        assert!(meta.pin(&page(0), false).is_none());
        assert!(meta.snapshot().is_empty());
        assert_eq!(meta.reserve(&page(0), &global, 3, false), Admission::Rejected(Rejection::Contended));
        assert_eq!(meta.grow(&page(0), 3, 1).unwrap(), Growth::Missing);

        // The in-flight write lands, then is deleted when it settles.
        store.write_page(&page(0), false, Bytes::from_static(b"old")).unwrap();
        assert_eq!(meta.finish_flush(&page(0), sequence, true), Flushed::Gone);
        assert!(store.is_empty());

        assert!(admit(&meta, &store, &page(0), &global, 3));
        assert_eq!(meta.total_usage(), 3);
    }

    #[test_log::test]
    fn test_remove_waits_for_append() {
        let (meta, store) = meta(10, vec![]);
        assert!(admit(&meta, &store, &page(0), &CacheScope::global(), 4));
        assert_eq!(meta.grow(&page(0), 4, 2).unwrap(), Growth::Granted);

        let handle = {
            let meta = meta.clone();
            thread::spawn(move || meta.remove(&page(0)).unwrap())
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());
        assert!(meta.lookup(&page(0)).is_some());

        store.write_page(&page(0), false, Bytes::from(vec![0; 6])).unwrap();
        meta.finish_grow(&page(0), 2, true);
        assert!(handle.join().unwrap());
        assert_eq!(meta.total_usage(), 0);
        assert_eq!(meta.pages(), 0);
        assert!(store.is_empty());
    }

    #[test_log::test]
    fn test_remove_idempotent() {
        let (meta, store) = meta(10, vec![]);
        assert!(admit(&meta, &store, &page(0), &CacheScope::global(), 4));

        assert!(meta.remove(&page(0)).unwrap());
        assert!(!meta.remove(&page(0)).unwrap());
        assert_eq!(meta.total_usage(), 0);
        assert!(store.is_empty());
    }

    #[test_log::test]
    fn test_remove_waits_for_pins() {
        let (meta, store) = meta(10, vec![]);
        assert!(admit(&meta, &store, &page(0), &CacheScope::global(), 4));

        let pinned = meta.pin(&page(0), false).unwrap();
        let handle = {
            let meta = meta.clone();
            thread::spawn(move || meta.remove(&page(0)).unwrap())
        };

        thread::sleep(Duration::from_millis(50));
        // New pins are refused while the page is being removed.
        assert!(meta.pin(&page(0), false).is_none());
        assert_eq!(store.len(), 1);

        drop(pinned);
        assert!(handle.join().unwrap());
        assert!(store.is_empty());
    }

    #[test_log::test]
    fn test_grow() {
        let (meta, store) = meta(10, vec![]);
        let global = CacheScope::global();
        assert!(admit(&meta, &store, &page(0), &global, 4));
        assert!(admit(&meta, &store, &page(1), &global, 4));

        assert_eq!(
            meta.grow(&page(0), 3, 1).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(meta.grow(&page(9), 0, 1).unwrap(), Growth::Missing);

        // Growing evicts the other page but never the growing one.
        assert_eq!(meta.grow(&page(0), 4, 4).unwrap(), Growth::Granted);
        meta.finish_grow(&page(0), 4, true);
        assert_eq!(meta.lookup(&page(0)).unwrap().size, 8);
        assert!(meta.lookup(&page(1)).is_none());
        assert_eq!(meta.total_usage(), 8);

        assert_eq!(meta.grow(&page(0), 8, 1).unwrap(), Growth::Granted);
        meta.finish_grow(&page(0), 1, false);
        assert_eq!(meta.total_usage(), 8);

        assert!(matches!(
            meta.grow(&page(0), 8, 3).unwrap(),
            Growth::Rejected(Rejection::TooLarge { .. })
        ));
    }

    #[test_log::test]
    fn test_file_index() {
        let (meta, store) = meta(100, vec![]);
        let global = CacheScope::global();
        for i in [3, 1, 2] {
            assert!(admit(&meta, &store, &page(i), &global, 1));
        }
        assert!(matches!(
            meta.reserve(&page(7), &global, 1, true),
            Admission::Admitted { .. }
        ));
        assert!(meta.commit(&page(7), None));

        assert_eq!(meta.list_by_file("f", false), vec![page(1), page(2), page(3)]);
        assert_eq!(meta.list_by_file("f", true), vec![page(7)]);
        let frozen = meta.begin_commit("f");
        assert_eq!(frozen, vec![page(7)]);
        meta.end_commit("f", &frozen, true);
        assert_eq!(meta.list_by_file("f", false).len(), 4);
        assert!(meta.list_by_file("f", true).is_empty());
        assert!(meta.list_by_file("g", false).is_empty());
    }

    #[test_log::test]
    fn test_commit_freezes_pages() {
        let (meta, _) = meta(10, vec![]);
        let global = CacheScope::global();
        for i in 0..2 {
            assert!(matches!(meta.reserve(&page(i), &global, 2, true), Admission::Admitted { .. }));
            assert!(meta.commit(&page(i), None));
        }

        let frozen = meta.begin_commit("f");
        assert_eq!(frozen, vec![page(0), page(1)]);
        // Frozen pages are neither served nor evicted, and no temporary page joins the file.
        assert!(meta.pin(&page(0), true).is_none());
        assert!(matches!(
            meta.reserve(&PageId::new("g", 0), &global, 8, false),
            Admission::Rejected(Rejection::NoSpace { .. })
        ));
        assert_eq!(meta.reserve(&page(2), &global, 1, true), Admission::Rejected(Rejection::Contended));
        assert_eq!(meta.total_usage(), 4);

        // A failed commit leaves the pages temporary.
        meta.end_commit("f", &frozen, false);
        assert!(meta.pin(&page(0), true).is_some());
        assert_eq!(meta.list_by_file("f", true), vec![page(0), page(1)]);

        let frozen = meta.begin_commit("f");
        meta.end_commit("f", &frozen, true);
        assert!(meta.pin(&page(0), false).is_some());
        assert_eq!(meta.list_by_file("f", false), vec![page(0), page(1)]);
        assert!(matches!(meta.reserve(&page(2), &global, 1, true), Admission::Admitted { .. }));
    }

    #[test_log::test]
    fn test_concurrent_quota_invariant() {
        const CAPACITY: u64 = 64;
        let scopes = [CacheScope::new("a"), CacheScope::new("a.b"), CacheScope::new("c")];
        let (meta, store) = meta(CAPACITY, vec![(CacheScope::new("a"), 32)]);

        let handles = (0..8)
            .map(|_| {
                let meta = meta.clone();
                let store = store.clone();
                let scopes = scopes.clone();
                thread::spawn(move || {
                    let mut rng = rand::rng();
                    for _ in 0..500 {
                        let id = page(rng.random_range(0..64));
                        let scope = &scopes[rng.random_range(0..scopes.len())];
                        match rng.random_range(0..4) {
                            0 => {
                                let _ = meta.remove(&id).unwrap();
                            }
                            1 => {
                                let _ = meta.pin(&id, false);
                            }
                            _ => {
                                admit(&meta, &store, &id, scope, rng.random_range(1..8));
                            }
                        }
                        assert!(meta.total_usage() <= CAPACITY);
                        assert!(meta.usage(&CacheScope::new("a")).used <= 32);
                    }
                })
            })
            .collect_vec();
        for handle in handles {
            handle.join().unwrap();
        }

        let infos = meta.snapshot();
        assert_eq!(infos.iter().map(|i| i.size).sum::<u64>(), meta.total_usage());
        let a = infos
            .iter()
            .filter(|i| CacheScope::new("a").contains(&i.scope))
            .map(|i| i.size)
            .sum::<u64>();
        assert_eq!(a, meta.usage(&CacheScope::new("a")).used);
    }
}
