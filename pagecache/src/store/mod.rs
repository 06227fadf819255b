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
    fs::File,
    io::{Read, Seek, SeekFrom, Write},
};

use bytes::Bytes;
use pagecache_common::{
    error::{Error, ErrorKind, Result},
    page::PageId,
};

pub use self::{fs::FsPageStore, memory::MemoryPageStore};

/// A page found in a page store by [`PageStore::scan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPage {
    /// Page id.
    pub page_id: PageId,
    /// Page size in bytes.
    pub size: u64,
    /// Whether the page belongs to an uncommitted file.
    pub temporary: bool,
}

/// A transferable handle onto a byte range of a cached page.
///
/// The handle stays valid after the page is evicted: a file handle keeps the unlinked file alive and memory
/// handles share the page buffer.
#[derive(Debug)]
pub enum DataFileChannel {
    /// A region of an open file, suitable for `sendfile`-like transfers.
    File {
        /// The page file.
        file: File,
        /// Start of the region within the file.
        offset: u64,
        /// Length of the region.
        len: usize,
    },
    /// A region of an in-memory page.
    Memory(Bytes),
}

impl DataFileChannel {
    /// Length of the region in bytes.
    pub fn len(&self) -> usize {
        match self {
            DataFileChannel::File { len, .. } => *len,
            DataFileChannel::Memory(bytes) => bytes.len(),
        }
    }

    /// Returns `true` if the region is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Transfer the whole region into `writer`, returning the number of bytes transferred.
    pub fn transfer_to<W: Write>(&mut self, writer: &mut W) -> Result<u64> {
        match self {
            DataFileChannel::File { file, offset, len } => {
                file.seek(SeekFrom::Start(*offset))?;
                let copied = std::io::copy(&mut file.take(*len as u64), writer)?;
                Ok(copied)
            }
            DataFileChannel::Memory(bytes) => {
                writer.write_all(bytes)?;
                Ok(bytes.len() as u64)
            }
        }
    }
}

/// Physical storage of page bytes.
///
/// The page store knows nothing about capacity, scopes or eviction. Every failure is reported to the caller.
/// A missing page is reported as [`ErrorKind::PageNotFound`].
///
/// `temporary` selects the namespace of pages that belong to files which have not been committed yet.
pub trait PageStore: Send + Sync + Debug + 'static {
    /// Write the whole page, replacing previous content.
    ///
    /// A concurrent reader observes either the old or the new content, never a mix.
    fn write_page(&self, page_id: &PageId, temporary: bool, page: Bytes) -> Result<()>;

    /// Read up to `len` bytes starting at `offset`.
    ///
    /// Returns fewer bytes if the page is shorter, and no bytes if `offset` is beyond the end of the page.
    fn read_page(&self, page_id: &PageId, temporary: bool, offset: usize, len: usize) -> Result<Bytes>;

    /// Delete the page.
    fn delete_page(&self, page_id: &PageId, temporary: bool) -> Result<()>;

    /// List the committed pages of a file, ordered by page index.
    ///
    /// Serves tools that inspect a store directly. The cache engine never calls it: the metadata file index is the
    /// authority on which pages of a file are cached, and a store may hold bytes the cache has already forgotten.
    fn enumerate(&self, file_id: &str) -> Result<Vec<PageId>>;

    /// Move all temporary pages of a file to the committed namespace.
    fn commit_file(&self, file_id: &str) -> Result<()> {
        Err(Error::new(ErrorKind::Unsupported, "page store does not support committing files").with_context("file", file_id))
    }

    /// List every page held by the store. Used to restore the cache on startup.
    fn scan(&self) -> Result<Vec<StoredPage>> {
        Err(Error::new(ErrorKind::Unsupported, "page store does not support scanning"))
    }

    /// Open a transferable handle onto a byte range of the page.
    fn channel(&self, page_id: &PageId, temporary: bool, offset: usize, len: usize) -> Result<DataFileChannel> {
        let _ = (temporary, offset, len);
        Err(Error::new(ErrorKind::Unsupported, "page store does not support data file channels").with_context("page", page_id))
    }
}

/// Clamp a `(offset, len)` read to a page of `size` bytes.
pub(crate) fn clamp(size: usize, offset: usize, len: usize) -> std::ops::Range<usize> {
    let start = offset.min(size);
    let end = start.saturating_add(len).min(size);
    start..end
}

pub mod fs;
pub mod memory;
