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

//! Utilities for testing.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytes::Bytes;
use pagecache_common::{
    error::{Error, ErrorKind, Result},
    page::PageId,
};
use parking_lot::RwLock;

use crate::store::{DataFileChannel, MemoryPageStore, PageStore, StoredPage};

/// A memory page store whose operations can be switched to fail.
#[derive(Debug, Default)]
pub struct FaultyPageStore {
    inner: MemoryPageStore,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    fail_deletes: AtomicBool,
    fail_commits: AtomicBool,
    failing_file: RwLock<Option<String>>,
    writes: AtomicUsize,
}

impl FaultyPageStore {
    /// Create a page store that does not fail yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make writes fail or succeed.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Make reads fail or succeed.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }

    /// Make deletes fail or succeed.
    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::Relaxed);
    }

    /// Make file commits fail or succeed.
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::Relaxed);
    }

    /// Make deletes of the pages of one file fail, or of no file with `None`.
    pub fn fail_deletes_of(&self, file_id: Option<&str>) {
        *self.failing_file.write() = file_id.map(str::to_string);
    }

    /// Count of successful writes.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// The backing memory store.
    pub fn inner(&self) -> &MemoryPageStore {
        &self.inner
    }

    fn check(&self, flag: &AtomicBool, op: &'static str, page_id: &PageId) -> Result<()> {
        if flag.load(Ordering::Relaxed) {
            return Err(Error::new(ErrorKind::Io, format!("injected {op} failure")).with_context("page", page_id));
        }
        Ok(())
    }
}

impl PageStore for FaultyPageStore {
    fn write_page(&self, page_id: &PageId, temporary: bool, page: Bytes) -> Result<()> {
        self.check(&self.fail_writes, "write", page_id)?;
        self.inner.write_page(page_id, temporary, page)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn read_page(&self, page_id: &PageId, temporary: bool, offset: usize, len: usize) -> Result<Bytes> {
        self.check(&self.fail_reads, "read", page_id)?;
        self.inner.read_page(page_id, temporary, offset, len)
    }

    fn delete_page(&self, page_id: &PageId, temporary: bool) -> Result<()> {
        self.check(&self.fail_deletes, "delete", page_id)?;
        if self.failing_file.read().as_deref() == Some(page_id.file_id()) {
            return Err(Error::new(ErrorKind::Io, "injected delete failure").with_context("page", page_id));
        }
        self.inner.delete_page(page_id, temporary)
    }

    fn enumerate(&self, file_id: &str) -> Result<Vec<PageId>> {
        self.inner.enumerate(file_id)
    }

    fn commit_file(&self, file_id: &str) -> Result<()> {
        if self.fail_commits.load(Ordering::Relaxed) {
            return Err(Error::new(ErrorKind::Io, "injected commit failure").with_context("file", file_id));
        }
        self.inner.commit_file(file_id)
    }

    fn scan(&self) -> Result<Vec<StoredPage>> {
        self.inner.scan()
    }

    fn channel(&self, page_id: &PageId, temporary: bool, offset: usize, len: usize) -> Result<DataFileChannel> {
        self.check(&self.fail_reads, "channel", page_id)?;
        self.inner.channel(page_id, temporary, offset, len)
    }
}
