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
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use pagecache_common::{
    error::{Error, ErrorKind, Result},
    metrics::Metrics,
    page::{CacheContext, CacheScope, PageId},
};

use crate::{
    engine::{CacheState, CacheUsage, Loader, PageCache},
    meta::{PageInfo, QuotaUsage},
    store::DataFileChannel,
};

/// The outermost page cache layer. Never fails and never panics.
///
/// Every failure of the wrapped cache is logged, counted and collapsed into the degraded result of the operation:
///
/// | operation           | degraded result |
/// |---------------------|-----------------|
/// | `put`, `append`, `delete` | `false`   |
/// | `get`, `get_and_load` | `-1`          |
/// | `data_file_channel` | `None`          |
/// | `invalidate`        | `0`             |
/// | file operations     | nothing         |
#[derive(Debug)]
pub struct GuardedPageCache<C> {
    inner: C,
    contained: AtomicU64,
    metrics: Arc<Metrics>,
}

impl<C: PageCache> GuardedPageCache<C> {
    /// Wrap a page cache.
    pub fn new(inner: C, metrics: Arc<Metrics>) -> Self {
        Self {
            inner,
            contained: AtomicU64::new(0),
            metrics,
        }
    }

    /// The wrapped page cache.
    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// Count of failures collapsed so far.
    pub fn contained(&self) -> u64 {
        self.contained.load(Ordering::Relaxed)
    }

    fn collapse(&self, op: &'static str, page: &dyn std::fmt::Display, cause: &dyn std::fmt::Display) {
        self.contained.fetch_add(1, Ordering::Relaxed);
        self.metrics.containment.increase(1);
        tracing::warn!("[guarded page cache]: {op} {page} failed, degrade: {cause}");
    }

    fn contain<T>(&self, op: &'static str, page: &dyn std::fmt::Display, degraded: T, f: impl FnOnce() -> Result<T>) -> T {
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => {
                self.collapse(op, page, &e);
                degraded
            }
            Err(payload) => {
                self.collapse(op, page, &panic_message(payload.as_ref()));
                degraded
            }
        }
    }

    /// Cache a whole page. See [`PageCache::put`].
    pub fn put(&self, page_id: &PageId, page: Bytes, ctx: &CacheContext) -> bool {
        self.contain("put", page_id, false, || self.inner.put(page_id, page, ctx))
    }

    /// Read a page. Returns the count of bytes copied, `0` on a miss and `-1` on a failure.
    pub fn get(&self, page_id: &PageId, page_offset: usize, buf: &mut [u8], ctx: &CacheContext) -> isize {
        self.contain("get", page_id, -1, || {
            self.inner
                .get(page_id, page_offset, buf, ctx)
                .map(|read| read as isize)
        })
    }

    /// Read a page, loading it on a miss. Returns the count of bytes copied and `-1` on a failure, including a
    /// failed load.
    pub fn get_and_load(
        &self,
        page_id: &PageId,
        page_offset: usize,
        buf: &mut [u8],
        ctx: &CacheContext,
        loader: Loader<'_>,
    ) -> isize {
        self.contain("get_and_load", page_id, -1, || {
            self.inner
                .get_and_load(page_id, page_offset, buf, ctx, loader)
                .map(|read| read as isize)
        })
    }

    /// Append to a page. See [`PageCache::append`].
    pub fn append(&self, page_id: &PageId, append_at: usize, page: Bytes, ctx: &CacheContext) -> bool {
        self.contain("append", page_id, false, || self.inner.append(page_id, append_at, page, ctx))
    }

    /// Delete a page. See [`PageCache::delete`].
    pub fn delete(&self, page_id: &PageId) -> bool {
        self.contain("delete", page_id, false, || self.inner.delete(page_id))
    }

    /// Delete all committed pages of a file.
    pub fn delete_file(&self, file_id: &str) {
        self.contain("delete_file", &file_id, (), || self.inner.delete_file(file_id))
    }

    /// Delete all temporary pages of a file.
    pub fn delete_temp_file(&self, file_id: &str) {
        self.contain("delete_temp_file", &file_id, (), || self.inner.delete_temp_file(file_id))
    }

    /// Commit the temporary pages of a file.
    pub fn commit_file(&self, file_id: &str) {
        self.contain("commit_file", &file_id, (), || self.inner.commit_file(file_id))
    }

    /// Remove every resident page matching the predicate.
    pub fn invalidate(&self, predicate: &dyn Fn(&PageInfo) -> bool) -> usize {
        self.contain("invalidate", &"pages", 0, || self.inner.invalidate(predicate))
    }

    /// Open a transferable handle onto a page region. `None` if the page is not resident or on a failure.
    pub fn data_file_channel(
        &self,
        page_id: &PageId,
        page_offset: usize,
        len: usize,
        ctx: &CacheContext,
    ) -> Option<DataFileChannel> {
        self.contain("data_file_channel", page_id, None, || {
            match self.inner.data_file_channel(page_id, page_offset, len, ctx) {
                Ok(channel) => Ok(Some(channel)),
                Err(e) if e.is_page_not_found() => Ok(None),
                Err(e) => Err(e),
            }
        })
    }

    /// Operating state.
    pub fn state(&self) -> CacheState {
        self.contain("state", &"cache", CacheState::NotInUse, || Ok(self.inner.state()))
    }

    /// Usage summary.
    pub fn usage(&self) -> Option<CacheUsage> {
        self.contain("usage", &"cache", None, || Ok(self.inner.usage()))
    }

    /// Usage of a scope.
    pub fn scope_usage(&self, scope: &CacheScope) -> Option<QuotaUsage> {
        self.contain("scope_usage", scope, None, || Ok(self.inner.scope_usage(scope)))
    }

    /// Committed resident pages of a file.
    pub fn cached_page_ids(&self, file_id: &str) -> Vec<PageId> {
        self.contain("cached_page_ids", &file_id, vec![], || Ok(self.inner.cached_page_ids(file_id)))
    }

    /// Best-effort residency hint.
    pub fn has_page_unsafe(&self, page_id: &PageId) -> bool {
        self.contain("has_page_unsafe", page_id, false, || Ok(self.inner.has_page_unsafe(page_id)))
    }

    /// Drain pending writes and stop serving.
    pub fn close(&self) {
        self.contain("close", &"cache", (), || self.inner.close())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> Error {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };
    Error::new(ErrorKind::Inconsistent, format!("panicked: {message}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{builder::PageCacheBuilder, store::MemoryPageStore};

    #[derive(Debug)]
    struct Panicking;

    impl PageCache for Panicking {
        fn put(&self, _: &PageId, _: Bytes, _: &CacheContext) -> Result<bool> {
            panic!("put exploded")
        }

        fn get(&self, _: &PageId, _: usize, _: &mut [u8], _: &CacheContext) -> Result<usize> {
            panic!("get exploded")
        }

        fn get_and_load(&self, _: &PageId, _: usize, _: &mut [u8], _: &CacheContext, _: Loader<'_>) -> Result<usize> {
            unimplemented!()
        }

        fn append(&self, _: &PageId, _: usize, _: Bytes, _: &CacheContext) -> Result<bool> {
            unimplemented!()
        }

        fn delete(&self, _: &PageId) -> Result<bool> {
            unimplemented!()
        }

        fn delete_file(&self, _: &str) -> Result<()> {
            unimplemented!()
        }

        fn delete_temp_file(&self, _: &str) -> Result<()> {
            unimplemented!()
        }

        fn commit_file(&self, _: &str) -> Result<()> {
            unimplemented!()
        }

        fn invalidate(&self, _: &dyn Fn(&PageInfo) -> bool) -> Result<usize> {
            unimplemented!()
        }

        fn data_file_channel(&self, _: &PageId, _: usize, _: usize, _: &CacheContext) -> Result<DataFileChannel> {
            unimplemented!()
        }

        fn state(&self) -> CacheState {
            CacheState::ReadWrite
        }

        fn usage(&self) -> Option<CacheUsage> {
            None
        }

        fn scope_usage(&self, _: &CacheScope) -> Option<QuotaUsage> {
            None
        }

        fn cached_page_ids(&self, _: &str) -> Vec<PageId> {
            vec![]
        }

        fn has_page_unsafe(&self, _: &PageId) -> bool {
            false
        }

        fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test_log::test]
    fn test_contain_panics() {
        let guarded = GuardedPageCache::new(Panicking, Arc::new(Metrics::noop()));
        let ctx = CacheContext::default();

        assert!(!guarded.put(&PageId::new("f", 0), Bytes::new(), &ctx));
        assert_eq!(guarded.get(&PageId::new("f", 0), 0, &mut [0; 4], &ctx), -1);
        assert_eq!(guarded.contained(), 2);
    }

    #[test_log::test]
    fn test_contain_loader_failure() {
        let guarded = PageCacheBuilder::new(1024)
            .with_page_size(16)
            .build_guarded(Arc::new(MemoryPageStore::new()))
            .unwrap();
        let ctx = CacheContext::default();
        let mut buf = [0; 4];

        let read = guarded.get_and_load(&PageId::new("f", 0), 0, &mut buf, &ctx, &mut || {
            Err(anyhow::anyhow!("remote unavailable"))
        });
        assert_eq!(read, -1);
        assert_eq!(guarded.contained(), 1);

        // A missing page is a miss, not a failure.
        assert!(guarded.data_file_channel(&PageId::new("f", 0), 0, 4, &ctx).is_none());
        assert_eq!(guarded.get(&PageId::new("f", 0), 0, &mut buf, &ctx), 0);
        assert_eq!(guarded.contained(), 1);
    }
}
