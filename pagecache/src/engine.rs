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

use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use bytes::{Bytes, BytesMut};
use pagecache_common::{
    error::{Error, ErrorKind, Result},
    metrics::Metrics,
    page::{CacheContext, CacheScope, PageId},
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    flusher::{Flusher, QueueFullPolicy, Submission, WriteBehindConfig},
    meta::{Admission, Flushed, Growth, MetaConfig, PageInfo, PageMetadataStore, QuotaUsage},
    eviction::EvictionPolicy,
    store::{clamp, DataFileChannel, PageStore},
};

/// Operating state of a page cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum CacheState {
    /// Every operation returns a miss or `false` immediately.
    NotInUse = 0,
    /// Reads are served. Mutations return `false` without side effects.
    ReadOnly = 1,
    /// Fully operational.
    ReadWrite = 2,
}

impl CacheState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::NotInUse,
            1 => Self::ReadOnly,
            _ => Self::ReadWrite,
        }
    }
}

/// Usage summary of a page cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheUsage {
    /// Bytes held.
    pub used: u64,
    /// Total capacity in bytes.
    pub capacity: u64,
    /// Pages holding space.
    pub pages: u64,
}

impl CacheUsage {
    /// Bytes still free.
    pub fn available(&self) -> u64 {
        self.capacity.saturating_sub(self.used)
    }
}

/// Whether and how to re-admit the pages found in the page store on startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestoreMode {
    /// Start empty. Pages left in the page store are not tracked.
    #[default]
    Disabled,
    /// Restore before the cache is returned.
    Sync,
    /// Restore on a background thread. The cache is [`CacheState::NotInUse`] until it finishes.
    Async,
}

/// Callback producing the whole page on a miss.
pub type Loader<'a> = &'a mut dyn FnMut() -> anyhow::Result<Bytes>;

/// The operation contract shared by the page cache engine and its decorators.
///
/// Methods report misses as `Ok(0)`/`Ok(false)` and failures as `Err`. Callers that need a cache which never fails
/// wrap it with [`crate::guard::GuardedPageCache`].
pub trait PageCache: Send + Sync + Debug + 'static {
    /// Cache a whole page. Best effort.
    ///
    /// Returns `true` if the page is admitted or already resident.
    fn put(&self, page_id: &PageId, page: Bytes, ctx: &CacheContext) -> Result<bool>;

    /// Read a page from `page_offset` into `buf`.
    ///
    /// Returns the count of bytes copied, `0` on a miss.
    fn get(&self, page_id: &PageId, page_offset: usize, buf: &mut [u8], ctx: &CacheContext) -> Result<usize>;

    /// Read a page, loading and caching it on a miss.
    ///
    /// The loader is called at most once and its error is not retried. The requested slice is served from the
    /// loaded page even if caching it is refused.
    fn get_and_load(
        &self,
        page_id: &PageId,
        page_offset: usize,
        buf: &mut [u8],
        ctx: &CacheContext,
        loader: Loader<'_>,
    ) -> Result<usize>;

    /// Append bytes to a page at `append_at`, which must be the current page length.
    fn append(&self, page_id: &PageId, append_at: usize, page: Bytes, ctx: &CacheContext) -> Result<bool>;

    /// Delete a page. Returns `true` if a resident page is removed.
    fn delete(&self, page_id: &PageId) -> Result<bool>;

    /// Delete all committed pages of a file.
    fn delete_file(&self, file_id: &str) -> Result<()>;

    /// Delete all temporary pages of a file.
    fn delete_temp_file(&self, file_id: &str) -> Result<()>;

    /// Move all temporary pages of a file to the committed namespace.
    fn commit_file(&self, file_id: &str) -> Result<()>;

    /// Remove every resident page matching the predicate. Returns the count of removed pages.
    ///
    /// A failure does not stop the sweep. The first one is returned once every matching page was tried.
    fn invalidate(&self, predicate: &dyn Fn(&PageInfo) -> bool) -> Result<usize>;

    /// Open a transferable handle onto `len` bytes of a page from `page_offset`.
    ///
    /// Returns [`ErrorKind::PageNotFound`] if the page is not resident.
    fn data_file_channel(
        &self,
        page_id: &PageId,
        page_offset: usize,
        len: usize,
        ctx: &CacheContext,
    ) -> Result<DataFileChannel>;

    /// Operating state.
    fn state(&self) -> CacheState;

    /// Usage summary, `None` if the cache is not in use.
    fn usage(&self) -> Option<CacheUsage>;

    /// Usage of a scope, `None` if the cache is not in use.
    fn scope_usage(&self, scope: &CacheScope) -> Option<QuotaUsage>;

    /// Committed resident pages of a file, ordered by page index.
    fn cached_page_ids(&self, file_id: &str) -> Vec<PageId>;

    /// Best-effort residency hint. May disagree with a concurrent `get`.
    fn has_page_unsafe(&self, page_id: &PageId) -> bool;

    /// Drain pending writes and stop serving.
    fn close(&self) -> Result<()>;
}

impl<C: PageCache + ?Sized> PageCache for Arc<C> {
    fn put(&self, page_id: &PageId, page: Bytes, ctx: &CacheContext) -> Result<bool> {
        self.as_ref().put(page_id, page, ctx)
    }

    fn get(&self, page_id: &PageId, page_offset: usize, buf: &mut [u8], ctx: &CacheContext) -> Result<usize> {
        self.as_ref().get(page_id, page_offset, buf, ctx)
    }

    fn get_and_load(
        &self,
        page_id: &PageId,
        page_offset: usize,
        buf: &mut [u8],
        ctx: &CacheContext,
        loader: Loader<'_>,
    ) -> Result<usize> {
        self.as_ref().get_and_load(page_id, page_offset, buf, ctx, loader)
    }

    fn append(&self, page_id: &PageId, append_at: usize, page: Bytes, ctx: &CacheContext) -> Result<bool> {
        self.as_ref().append(page_id, append_at, page, ctx)
    }

    fn delete(&self, page_id: &PageId) -> Result<bool> {
        self.as_ref().delete(page_id)
    }

    fn delete_file(&self, file_id: &str) -> Result<()> {
        self.as_ref().delete_file(file_id)
    }

    fn delete_temp_file(&self, file_id: &str) -> Result<()> {
        self.as_ref().delete_temp_file(file_id)
    }

    fn commit_file(&self, file_id: &str) -> Result<()> {
        self.as_ref().commit_file(file_id)
    }

    fn invalidate(&self, predicate: &dyn Fn(&PageInfo) -> bool) -> Result<usize> {
        self.as_ref().invalidate(predicate)
    }

    fn data_file_channel(
        &self,
        page_id: &PageId,
        page_offset: usize,
        len: usize,
        ctx: &CacheContext,
    ) -> Result<DataFileChannel> {
        self.as_ref().data_file_channel(page_id, page_offset, len, ctx)
    }

    fn state(&self) -> CacheState {
        self.as_ref().state()
    }

    fn usage(&self) -> Option<CacheUsage> {
        self.as_ref().usage()
    }

    fn scope_usage(&self, scope: &CacheScope) -> Option<QuotaUsage> {
        self.as_ref().scope_usage(scope)
    }

    fn cached_page_ids(&self, file_id: &str) -> Vec<PageId> {
        self.as_ref().cached_page_ids(file_id)
    }

    fn has_page_unsafe(&self, page_id: &PageId) -> bool {
        self.as_ref().has_page_unsafe(page_id)
    }

    fn close(&self) -> Result<()> {
        self.as_ref().close()
    }
}

/// Copy the requested slice of a loaded page into `buf`.
pub(crate) fn serve(page: &Bytes, page_offset: usize, buf: &mut [u8]) -> usize {
    let range = clamp(page.len(), page_offset, buf.len());
    let len = range.len();
    buf[..len].copy_from_slice(&page[range]);
    len
}

pub(crate) struct LocalPageCacheConfig {
    pub name: String,
    pub page_size: usize,
    pub meta: MetaConfig,
    pub policy: Box<dyn EvictionPolicy>,
    pub store: Arc<dyn PageStore>,
    pub write_behind: Option<WriteBehindConfig>,
    pub restore: RestoreMode,
    pub metrics: Arc<Metrics>,
}

struct Inner {
    name: String,
    page_size: usize,
    state: AtomicU8,

    meta: Arc<PageMetadataStore>,
    store: Arc<dyn PageStore>,
    flusher: Option<Flusher>,
    restorer: Mutex<Option<JoinHandle<()>>>,

    metrics: Arc<Metrics>,
}

/// The local page cache engine.
///
/// Admission and eviction decisions are made by the [`PageMetadataStore`], page bytes live in a [`PageStore`].
#[derive(Clone)]
pub struct LocalPageCache {
    inner: Arc<Inner>,
}

impl Debug for LocalPageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalPageCache")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("page_size", &self.inner.page_size)
            .field("meta", &self.inner.meta)
            .field("store", &self.inner.store)
            .field("flusher", &self.inner.flusher)
            .finish()
    }
}

impl LocalPageCache {
    pub(crate) fn open(config: LocalPageCacheConfig) -> Result<Self> {
        let meta = Arc::new(PageMetadataStore::new(
            config.meta,
            config.policy,
            config.store.clone(),
            config.metrics.clone(),
        ));
        let flusher = config
            .write_behind
            .as_ref()
            .map(|wb| Flusher::open(wb, meta.clone(), config.store.clone(), config.metrics.clone()))
            .transpose()?;

        let cache = Self {
            inner: Arc::new(Inner {
                name: config.name,
                page_size: config.page_size,
                state: AtomicU8::new(CacheState::NotInUse as u8),
                meta,
                store: config.store,
                flusher,
                restorer: Mutex::new(None),
                metrics: config.metrics,
            }),
        };

        match config.restore {
            RestoreMode::Disabled => cache.set_state(CacheState::ReadWrite),
            RestoreMode::Sync => cache.restore_or_reset(),
            RestoreMode::Async => {
                let c = cache.clone();
                let handle = std::thread::Builder::new()
                    .name(format!("pagecache-restore-{}", cache.inner.name))
                    .spawn(move || c.restore_or_reset())
                    .map_err(|e| Error::new(ErrorKind::Io, "spawn restorer failed").with_source(e))?;
                *cache.inner.restorer.lock() = Some(handle);
            }
        }

        tracing::info!(
            "[page cache]: {} opened, capacity: {}, state: {:?}",
            cache.inner.name,
            cache.inner.meta.capacity(),
            cache.state()
        );
        Ok(cache)
    }

    /// Name of the cache, used as the metrics label.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Switch the operating state.
    pub fn set_state(&self, state: CacheState) {
        self.inner.state.store(state as u8, Ordering::Release);
    }

    /// The metadata store.
    pub fn meta(&self) -> &Arc<PageMetadataStore> {
        &self.inner.meta
    }

    /// Wait until every queued background write lands.
    pub fn flush(&self) {
        if let Some(flusher) = self.inner.flusher.as_ref() {
            flusher.wait();
        }
    }

    /// Wait for an asynchronous restore to finish.
    pub fn wait_restored(&self) {
        let handle = self.inner.restorer.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("[page cache]: restorer of {} panicked", self.inner.name);
            }
        }
    }

    fn restore_or_reset(&self) {
        match self.restore() {
            Ok(pages) => {
                tracing::info!("[page cache]: {} restored {pages} pages", self.inner.name);
            }
            Err(e) => {
                tracing::error!("[page cache]: restore of {} failed, start empty: {e}", self.inner.name);
                for info in self.inner.meta.snapshot() {
                    if let Err(e) = self.inner.meta.remove(&info.page_id) {
                        tracing::warn!("[page cache]: drop restored page {} failed: {e}", info.page_id);
                    }
                }
            }
        }
        self.set_state(CacheState::ReadWrite);
    }

    #[cfg_attr(feature = "tracing", fastrace::trace(name = "pagecache::engine::restore"))]
    fn restore(&self) -> Result<usize> {
        let global = CacheScope::global();
        let mut restored = 0;
        for page in self.inner.store.scan()? {
            let admitted = page.size <= self.inner.page_size as u64
                && match self.inner.meta.reserve(&page.page_id, &global, page.size, page.temporary) {
                    Admission::Admitted { .. } => self.inner.meta.commit(&page.page_id, None),
                    Admission::Present => false,
                    Admission::Rejected(_) => false,
                };
            if admitted {
                restored += 1;
            } else {
                self.inner.store.delete_page(&page.page_id, page.temporary)?;
            }
        }
        Ok(restored)
    }

    fn writable(&self, ctx: &CacheContext) -> bool {
        self.state() == CacheState::ReadWrite && ctx.materializes()
    }

    fn write_sync(&self, page_id: &PageId, temporary: bool, page: Bytes) -> bool {
        match self.inner.store.write_page(page_id, temporary, page) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("[page cache]: write page {page_id} failed: {e}");
                false
            }
        }
    }

    /// Hand an admitted page to the write-behind path. Returns `false` if the admission is rolled back.
    fn write_behind(&self, flusher: &Flusher, page_id: &PageId, temporary: bool, sequence: u64, page: Bytes) -> bool {
        self.inner.meta.commit(page_id, Some(page.clone()));
        let submission = Submission {
            page_id: page_id.clone(),
            temporary,
            sequence,
            page,
        };
        let Err(submission) = flusher.submit(submission) else {
            self.inner.metrics.async_enqueue.increase(1);
            return true;
        };

        let written = match flusher.policy() {
            QueueFullPolicy::Reject => false,
            QueueFullPolicy::Block(_) | QueueFullPolicy::Fallback => {
                self.inner.metrics.async_fallback.increase(1);
                self.write_sync(page_id, temporary, submission.page)
            }
        };
        // A page deleted by another caller meanwhile still counts as admitted.
        matches!(
            self.inner.meta.finish_flush(page_id, sequence, written),
            Flushed::Clean | Flushed::Gone
        )
    }

    /// Serve a read of a resident page. Returns `None` on a miss.
    fn read(&self, page_id: &PageId, page_offset: usize, buf: &mut [u8], ctx: &CacheContext) -> Result<Option<usize>> {
        if self.state() == CacheState::NotInUse || !ctx.materializes() {
            return Ok(None);
        }

        let Some(pinned) = self.inner.meta.pin(page_id, ctx.is_temporary()) else {
            self.inner.metrics.miss.increase(1);
            return Ok(None);
        };

        let page = match pinned.staged() {
            Some(staged) => staged.slice(clamp(staged.len(), page_offset, buf.len())),
            None => match self.inner.store.read_page(page_id, ctx.is_temporary(), page_offset, buf.len()) {
                Ok(page) => page,
                Err(e) => {
                    drop(pinned);
                    self.inner.metrics.read_error.increase(1);
                    if !e.is_page_not_found() {
                        return Err(e);
                    }
                    // Forget the page so later reads miss instead of failing again.
                    if let Err(e) = self.inner.meta.remove(page_id) {
                        tracing::warn!("[page cache]: drop inconsistent page {page_id} failed: {e}");
                    }
                    return Err(Error::new(
                        ErrorKind::Inconsistent,
                        "page is resident in metadata but missing in page store",
                    )
                    .with_context("page", page_id)
                    .with_source(e));
                }
            },
        };
        drop(pinned);

        buf[..page.len()].copy_from_slice(&page);
        self.inner.metrics.hit.increase(1);
        Ok(Some(page.len()))
    }
}

impl PageCache for LocalPageCache {
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "pagecache::engine::put"))]
    fn put(&self, page_id: &PageId, page: Bytes, ctx: &CacheContext) -> Result<bool> {
        if !self.writable(ctx) {
            return Ok(false);
        }
        if page.len() > self.inner.page_size {
            tracing::debug!(
                "[page cache]: page {page_id} of {} bytes exceeds page size {}",
                page.len(),
                self.inner.page_size
            );
            self.inner.metrics.put_rejected.increase(1);
            return Ok(false);
        }

        let temporary = ctx.is_temporary();
        let sequence = match self.inner.meta.reserve(page_id, ctx.scope(), page.len() as u64, temporary) {
            Admission::Admitted { sequence } => sequence,
            Admission::Present => return Ok(true),
            Admission::Rejected(rejection) => {
                tracing::debug!("[page cache]: put page {page_id} rejected: {rejection}");
                self.inner.metrics.put_rejected.increase(1);
                return Ok(false);
            }
        };

        let admitted = match self.inner.flusher.as_ref() {
            Some(flusher) => self.write_behind(flusher, page_id, temporary, sequence, page),
            None => {
                let written = self.write_sync(page_id, temporary, page);
                if written {
                    self.inner.meta.commit(page_id, None);
                } else {
                    self.inner.meta.abort(page_id);
                }
                written
            }
        };

        if admitted {
            self.inner.metrics.put.increase(1);
        } else {
            self.inner.metrics.put_rejected.increase(1);
        }
        Ok(admitted)
    }

    #[cfg_attr(feature = "tracing", fastrace::trace(name = "pagecache::engine::get"))]
    fn get(&self, page_id: &PageId, page_offset: usize, buf: &mut [u8], ctx: &CacheContext) -> Result<usize> {
        Ok(self.read(page_id, page_offset, buf, ctx)?.unwrap_or(0))
    }

    #[cfg_attr(feature = "tracing", fastrace::trace(name = "pagecache::engine::get_and_load"))]
    fn get_and_load(
        &self,
        page_id: &PageId,
        page_offset: usize,
        buf: &mut [u8],
        ctx: &CacheContext,
        loader: Loader<'_>,
    ) -> Result<usize> {
        // A read past the end of a resident page is a hit of no bytes.
        if let Some(read) = self.read(page_id, page_offset, buf, ctx)? {
            return Ok(read);
        }

        self.inner.metrics.load.increase(1);
        let page = loader().map_err(|e| Error::external(e).with_context("page", page_id))?;
        if let Err(e) = self.put(page_id, page.clone(), ctx) {
            tracing::warn!("[page cache]: cache loaded page {page_id} failed: {e}");
        }
        Ok(serve(&page, page_offset, buf))
    }

    #[cfg_attr(feature = "tracing", fastrace::trace(name = "pagecache::engine::append"))]
    fn append(&self, page_id: &PageId, append_at: usize, page: Bytes, ctx: &CacheContext) -> Result<bool> {
        if !self.writable(ctx) {
            return Ok(false);
        }
        if append_at == 0 && self.inner.meta.lookup(page_id).is_none() {
            return self.put(page_id, page, ctx);
        }
        if append_at + page.len() > self.inner.page_size {
            self.inner.metrics.put_rejected.increase(1);
            return Ok(false);
        }

        let delta = page.len() as u64;
        match self.inner.meta.grow(page_id, append_at as u64, delta)? {
            Growth::Granted => {}
            Growth::Missing => {
                return Err(Error::new(ErrorKind::InvalidArgument, "append to an absent page at a non-zero offset")
                    .with_context("page", page_id)
                    .with_context("append_at", append_at))
            }
            Growth::Rejected(rejection) => {
                tracing::debug!("[page cache]: append to page {page_id} rejected: {rejection}");
                self.inner.metrics.put_rejected.increase(1);
                return Ok(false);
            }
        }

        // The page is neither evictable nor pending while growing.
        let temporary = self
            .inner
            .meta
            .lookup(page_id)
            .map(|info| info.temporary)
            .unwrap_or(ctx.is_temporary());
        let existing = match self.inner.store.read_page(page_id, temporary, 0, append_at) {
            Ok(existing) if existing.len() == append_at => existing,
            Ok(existing) => {
                self.inner.meta.finish_grow(page_id, delta, false);
                return Err(Error::new(ErrorKind::Inconsistent, "page store holds a different page length")
                    .with_context("page", page_id)
                    .with_context("expected", append_at)
                    .with_context("actual", existing.len()));
            }
            Err(e) => {
                self.inner.meta.finish_grow(page_id, delta, false);
                return Err(e);
            }
        };

        let mut merged = BytesMut::with_capacity(append_at + page.len());
        merged.extend_from_slice(&existing);
        merged.extend_from_slice(&page);
        let written = self.write_sync(page_id, temporary, merged.freeze());
        self.inner.meta.finish_grow(page_id, delta, written);

        if written {
            self.inner.metrics.append.increase(1);
        }
        Ok(written)
    }

    #[cfg_attr(feature = "tracing", fastrace::trace(name = "pagecache::engine::delete"))]
    fn delete(&self, page_id: &PageId) -> Result<bool> {
        if self.state() != CacheState::ReadWrite {
            return Ok(false);
        }
        let removed = self.inner.meta.remove(page_id)?;
        if removed {
            self.inner.metrics.delete.increase(1);
        }
        Ok(removed)
    }

    fn delete_file(&self, file_id: &str) -> Result<()> {
        if self.state() != CacheState::ReadWrite {
            return Ok(());
        }
        remove_all(self, self.inner.meta.list_by_file(file_id, false))
    }

    fn delete_temp_file(&self, file_id: &str) -> Result<()> {
        if self.state() != CacheState::ReadWrite {
            return Ok(());
        }
        remove_all(self, self.inner.meta.list_by_file(file_id, true))
    }

    fn commit_file(&self, file_id: &str) -> Result<()> {
        if self.state() != CacheState::ReadWrite {
            return Ok(());
        }
        let frozen = self.inner.meta.begin_commit(file_id);
        let res = self.inner.store.commit_file(file_id);
        self.inner.meta.end_commit(file_id, &frozen, res.is_ok());
        if let Err(e) = res {
            tracing::warn!("[page cache]: commit file {file_id} failed, drop its {} pages: {e}", frozen.len());
            // A failed commit may leave the bytes in either namespace.
            for page_id in frozen.iter() {
                if let Err(e) = self.inner.store.delete_page(page_id, false) {
                    if !e.is_page_not_found() {
                        tracing::warn!("[page cache]: delete committed copy of page {page_id} failed: {e}");
                    }
                }
            }
            if let Err(e) = remove_all(self, frozen) {
                tracing::warn!("[page cache]: drop pages of file {file_id} failed: {e}");
            }
            return Err(e);
        }
        tracing::debug!("[page cache]: committed {} pages of file {file_id}", frozen.len());
        Ok(())
    }

    #[cfg_attr(feature = "tracing", fastrace::trace(name = "pagecache::engine::invalidate"))]
    fn invalidate(&self, predicate: &dyn Fn(&PageInfo) -> bool) -> Result<usize> {
        if self.state() != CacheState::ReadWrite {
            return Ok(0);
        }
        let mut removed = 0;
        let mut first = None;
        for info in self.inner.meta.snapshot().into_iter().filter(|info| predicate(info)) {
            match self.inner.meta.remove(&info.page_id) {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!("[page cache]: invalidate page {} failed: {e}", info.page_id);
                    first.get_or_insert(e);
                }
            }
        }
        self.inner.metrics.invalidate.increase(removed as u64);
        match first {
            Some(e) => Err(e.with_context("removed", removed)),
            None => Ok(removed),
        }
    }

    fn data_file_channel(
        &self,
        page_id: &PageId,
        page_offset: usize,
        len: usize,
        ctx: &CacheContext,
    ) -> Result<DataFileChannel> {
        let pinned = match self.state() {
            CacheState::NotInUse => None,
            _ => self.inner.meta.pin(page_id, ctx.is_temporary()),
        };
        let Some(pinned) = pinned else {
            return Err(Error::page_not_found(page_id));
        };
        match pinned.staged() {
            Some(staged) => Ok(DataFileChannel::Memory(
                staged.slice(clamp(staged.len(), page_offset, len)),
            )),
            None => self
                .inner
                .store
                .channel(page_id, ctx.is_temporary(), page_offset, len),
        }
    }

    fn state(&self) -> CacheState {
        CacheState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    fn usage(&self) -> Option<CacheUsage> {
        if self.state() == CacheState::NotInUse {
            return None;
        }
        Some(CacheUsage {
            used: self.inner.meta.total_usage(),
            capacity: self.inner.meta.capacity(),
            pages: self.inner.meta.pages(),
        })
    }

    fn scope_usage(&self, scope: &CacheScope) -> Option<QuotaUsage> {
        if self.state() == CacheState::NotInUse {
            return None;
        }
        Some(self.inner.meta.usage(scope))
    }

    fn cached_page_ids(&self, file_id: &str) -> Vec<PageId> {
        if self.state() == CacheState::NotInUse {
            return vec![];
        }
        self.inner.meta.list_by_file(file_id, false)
    }

    fn has_page_unsafe(&self, page_id: &PageId) -> bool {
        self.inner.meta.contains_unsafe(page_id)
    }

    fn close(&self) -> Result<()> {
        self.wait_restored();
        self.set_state(CacheState::NotInUse);
        if let Some(flusher) = self.inner.flusher.as_ref() {
            flusher.close();
        }
        tracing::info!("[page cache]: {} closed", self.inner.name);
        Ok(())
    }
}

/// Remove pages one by one, reporting the first failure after trying all of them.
fn remove_all(cache: &LocalPageCache, page_ids: Vec<PageId>) -> Result<()> {
    let mut first = None;
    for page_id in page_ids {
        match cache.inner.meta.remove(&page_id) {
            Ok(true) => cache.inner.metrics.delete.increase(1),
            Ok(false) => {}
            Err(e) => {
                tracing::warn!("[page cache]: delete page {page_id} failed: {e}");
                first.get_or_insert(e);
            }
        }
    }
    match first {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{eviction::EvictionConfig, meta::WriteState, store::MemoryPageStore, test_utils::FaultyPageStore};

    fn open(
        capacity: u64,
        store: Arc<dyn PageStore>,
        restore: RestoreMode,
        write_behind: Option<WriteBehindConfig>,
    ) -> LocalPageCache {
        LocalPageCache::open(LocalPageCacheConfig {
            name: "test".to_string(),
            page_size: 64,
            meta: MetaConfig {
                capacity,
                ..Default::default()
            },
            policy: EvictionConfig::default().build(),
            store,
            write_behind,
            restore,
            metrics: Arc::new(Metrics::noop()),
        })
        .unwrap()
    }

    fn cache(capacity: u64, store: Arc<dyn PageStore>, restore: RestoreMode) -> LocalPageCache {
        open(capacity, store, restore, None)
    }

    fn page(index: u64) -> PageId {
        PageId::new("f", index)
    }

    #[test]
    fn test_is_send_sync_static() {
        fn is_send_sync_static<T: Send + Sync + 'static>() {}
        is_send_sync_static::<LocalPageCache>();
    }

    #[test_log::test]
    fn test_put_get() {
        let cache = cache(1024, Arc::new(MemoryPageStore::new()), RestoreMode::Disabled);
        let ctx = CacheContext::default();

        assert!(cache.put(&page(0), Bytes::from_static(b"hello world"), &ctx).unwrap());
        let mut buf = [0; 5];
        assert_eq!(cache.get(&page(0), 6, &mut buf, &ctx).unwrap(), 5);
        assert_eq!(&buf, b"world");

        let mut buf = [0; 16];
        assert_eq!(cache.get(&page(0), 8, &mut buf, &ctx).unwrap(), 3);
        assert_eq!(cache.get(&page(1), 0, &mut buf, &ctx).unwrap(), 0);

        // Oversized pages are refused.
        assert!(!cache.put(&page(2), Bytes::from(vec![0; 65]), &ctx).unwrap());
    }

    #[test_log::test]
    fn test_inconsistent_read() {
        let store = Arc::new(MemoryPageStore::new());
        let cache = cache(1024, store.clone(), RestoreMode::Disabled);
        let ctx = CacheContext::default();

        assert!(cache.put(&page(0), Bytes::from_static(b"abc"), &ctx).unwrap());
        store.delete_page(&page(0), false).unwrap();

        let mut buf = [0; 3];
        let e = cache.get(&page(0), 0, &mut buf, &ctx).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Inconsistent);
        assert_eq!(cache.get(&page(0), 0, &mut buf, &ctx).unwrap(), 0);
    }

    #[test_log::test]
    fn test_restore() {
        let store = Arc::new(MemoryPageStore::new());
        for i in 0..4 {
            store.write_page(&page(i), false, Bytes::from(vec![i as u8; 16])).unwrap();
        }
        store.write_page(&page(9), false, Bytes::from(vec![0; 128])).unwrap();

        // Only three pages fit.
        let cache = cache(48, store.clone(), RestoreMode::Sync);
        assert_eq!(cache.state(), CacheState::ReadWrite);
        assert_eq!(cache.usage().unwrap().used, 48);
        assert_eq!(cache.usage().unwrap().pages, 3);
        assert_eq!(store.len(), 3);

        let mut buf = [0; 16];
        let hits = (0..4)
            .filter(|i| cache.get(&page(*i), 0, &mut buf, &CacheContext::default()).unwrap() == 16)
            .count();
        assert_eq!(hits, 3);
    }

    #[test_log::test]
    fn test_restore_async() {
        let store = Arc::new(MemoryPageStore::new());
        store.write_page(&page(0), false, Bytes::from_static(b"abc")).unwrap();

        let cache = cache(1024, store, RestoreMode::Async);
        cache.wait_restored();
        assert_eq!(cache.state(), CacheState::ReadWrite);
        assert_eq!(cache.cached_page_ids("f"), vec![page(0)]);
    }

    #[test_log::test]
    fn test_not_in_use() {
        let cache = cache(1024, Arc::new(MemoryPageStore::new()), RestoreMode::Disabled);
        let ctx = CacheContext::default();
        assert!(cache.put(&page(0), Bytes::from_static(b"abc"), &ctx).unwrap());

        cache.set_state(CacheState::NotInUse);
        let mut buf = [0; 3];
        assert_eq!(cache.get(&page(0), 0, &mut buf, &ctx).unwrap(), 0);
        assert!(!cache.put(&page(1), Bytes::from_static(b"abc"), &ctx).unwrap());
        assert!(cache.usage().is_none());
        assert!(cache
            .data_file_channel(&page(0), 0, 3, &ctx)
            .unwrap_err()
            .is_page_not_found());
    }

    #[test_log::test]
    fn test_failed_write_rolls_back() {
        let store = Arc::new(FaultyPageStore::new());
        let cache = cache(1024, store.clone(), RestoreMode::Disabled);
        let ctx = CacheContext::default();

        store.fail_writes(true);
        assert!(!cache.put(&page(0), Bytes::from_static(b"abc"), &ctx).unwrap());
        assert_eq!(cache.usage().unwrap().used, 0);
        assert!(cache.meta().lookup(&page(0)).is_none());

        store.fail_writes(false);
        assert!(cache.put(&page(0), Bytes::from_static(b"abc"), &ctx).unwrap());

        store.fail_reads(true);
        let mut buf = [0; 3];
        assert_eq!(cache.get(&page(0), 0, &mut buf, &ctx).unwrap_err().kind(), ErrorKind::Io);
    }

    #[test_log::test]
    fn test_write_behind() {
        let store = Arc::new(FaultyPageStore::new());
        let cache = open(1024, store.clone(), RestoreMode::Disabled, Some(WriteBehindConfig::default()));
        let ctx = CacheContext::default();

        for i in 0..8 {
            assert!(cache.put(&page(i), Bytes::from(vec![i as u8; 32]), &ctx).unwrap());
            // Served whether or not the background write has landed.
            let mut buf = [0; 32];
            assert_eq!(cache.get(&page(i), 0, &mut buf, &ctx).unwrap(), 32);
            assert_eq!(buf, [i as u8; 32]);
        }
        cache.flush();
        assert_eq!(store.writes(), 8);
        for i in 0..8 {
            assert_eq!(cache.meta().lookup(&page(i)).unwrap().write_state, WriteState::Clean);
        }

        // A failed background write drops the page.
        store.fail_writes(true);
        assert!(cache.put(&page(8), Bytes::from_static(b"lost"), &ctx).unwrap());
        cache.flush();
        assert!(cache.meta().lookup(&page(8)).is_none());
        assert_eq!(cache.usage().unwrap().used, 8 * 32);

        cache.close().unwrap();
    }

    #[test_log::test]
    fn test_append() {
        let cache = cache(1024, Arc::new(MemoryPageStore::new()), RestoreMode::Disabled);
        let ctx = CacheContext::default();

        assert!(cache.append(&page(0), 0, Bytes::from_static(b"abc"), &ctx).unwrap());
        assert!(cache.append(&page(0), 3, Bytes::from_static(b"def"), &ctx).unwrap());
        assert_eq!(
            cache
                .append(&page(0), 4, Bytes::from_static(b"x"), &ctx)
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            cache
                .append(&page(1), 2, Bytes::from_static(b"x"), &ctx)
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidArgument
        );
        // Beyond the page size.
        assert!(!cache.append(&page(0), 6, Bytes::from(vec![0; 59]), &ctx).unwrap());

        let mut buf = [0; 8];
        assert_eq!(cache.get(&page(0), 0, &mut buf, &ctx).unwrap(), 6);
        assert_eq!(&buf[..6], b"abcdef");
        assert_eq!(cache.usage().unwrap().used, 6);
    }

    #[test_log::test]
    fn test_get_and_load_past_end_of_resident_page() {
        let cache = cache(1024, Arc::new(MemoryPageStore::new()), RestoreMode::Disabled);
        let ctx = CacheContext::default();
        assert!(cache.put(&page(0), Bytes::from(vec![7; 10]), &ctx).unwrap());

        let mut loads = 0;
        let mut buf = [0; 4];
        let read = cache
            .get_and_load(&page(0), 20, &mut buf, &ctx, &mut || {
                loads += 1;
                Ok::<_, anyhow::Error>(Bytes::from(vec![0; 32]))
            })
            .unwrap();
        assert_eq!(read, 0);
        assert_eq!(loads, 0);
        assert_eq!(cache.meta().lookup(&page(0)).unwrap().size, 10);
    }

    #[test_log::test]
    fn test_invalidate_tries_every_page() {
        let store = Arc::new(FaultyPageStore::new());
        let cache = cache(1024, store.clone(), RestoreMode::Disabled);
        let ctx = CacheContext::default();
        for i in 0..4 {
            assert!(cache.put(&PageId::new("bad", i), Bytes::from_static(b"abc"), &ctx).unwrap());
            assert!(cache.put(&PageId::new("good", i), Bytes::from_static(b"abc"), &ctx).unwrap());
        }

        store.fail_deletes_of(Some("bad"));
        let e = cache.invalidate(&|_| true).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Io);
        assert!(cache.cached_page_ids("good").is_empty());
        assert_eq!(cache.cached_page_ids("bad").len(), 4);
        assert_eq!(cache.usage().unwrap().pages, 4);
        assert_eq!(cache.usage().unwrap().used, 12);

        store.fail_deletes_of(None);
        assert_eq!(cache.invalidate(&|_| true).unwrap(), 4);
        assert_eq!(cache.usage().unwrap().used, 0);
    }

    #[test_log::test]
    fn test_failed_commit_drops_pages() {
        let store = Arc::new(FaultyPageStore::new());
        let cache = cache(1024, store.clone(), RestoreMode::Disabled);
        let temp = CacheContext::default().with_temporary(true);
        for i in 0..2 {
            assert!(cache.put(&page(i), Bytes::from_static(b"abc"), &temp).unwrap());
        }

        store.fail_commits(true);
        assert_eq!(cache.commit_file("f").unwrap_err().kind(), ErrorKind::Io);
        assert!(cache.cached_page_ids("f").is_empty());
        assert!(cache.meta().list_by_file("f", true).is_empty());
        assert_eq!(cache.usage().unwrap().used, 0);
        assert!(store.inner().is_empty());

        // The file can be written and committed again.
        store.fail_commits(false);
        assert!(cache.put(&page(0), Bytes::from_static(b"abc"), &temp).unwrap());
        cache.commit_file("f").unwrap();
        assert_eq!(cache.cached_page_ids("f"), vec![page(0)]);
    }
}
