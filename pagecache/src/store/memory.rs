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

use bytes::Bytes;
use hashbrown::HashMap;
use itertools::Itertools;
use pagecache_common::{
    error::{Error, Result},
    page::PageId,
};
use parking_lot::RwLock;

use super::{clamp, DataFileChannel, PageStore, StoredPage};

/// A page store that keeps page bytes in memory.
#[derive(Debug, Default)]
pub struct MemoryPageStore {
    pages: RwLock<HashMap<(PageId, bool), Bytes>>,
}

impl MemoryPageStore {
    /// Create an empty memory page store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pages held, temporary pages included.
    pub fn len(&self) -> usize {
        self.pages.read().len()
    }

    /// Returns `true` if the store holds no pages.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, page_id: &PageId, temporary: bool) -> Result<Bytes> {
        self.pages
            .read()
            .get(&(page_id.clone(), temporary))
            .cloned()
            .ok_or_else(|| Error::page_not_found(page_id))
    }
}

impl PageStore for MemoryPageStore {
    fn write_page(&self, page_id: &PageId, temporary: bool, page: Bytes) -> Result<()> {
        self.pages.write().insert((page_id.clone(), temporary), page);
        Ok(())
    }

    fn read_page(&self, page_id: &PageId, temporary: bool, offset: usize, len: usize) -> Result<Bytes> {
        let page = self.get(page_id, temporary)?;
        Ok(page.slice(clamp(page.len(), offset, len)))
    }

    fn delete_page(&self, page_id: &PageId, temporary: bool) -> Result<()> {
        self.pages
            .write()
            .remove(&(page_id.clone(), temporary))
            .map(|_| ())
            .ok_or_else(|| Error::page_not_found(page_id))
    }

    fn enumerate(&self, file_id: &str) -> Result<Vec<PageId>> {
        Ok(self
            .pages
            .read()
            .keys()
            .filter(|(id, temporary)| !temporary && id.file_id() == file_id)
            .map(|(id, _)| id.clone())
            .sorted()
            .collect())
    }

    fn commit_file(&self, file_id: &str) -> Result<()> {
        let mut pages = self.pages.write();
        let keys = pages
            .keys()
            .filter(|(id, temporary)| *temporary && id.file_id() == file_id)
            .cloned()
            .collect_vec();
        for key in keys {
            if let Some(page) = pages.remove(&key) {
                pages.insert((key.0, false), page);
            }
        }
        Ok(())
    }

    fn scan(&self) -> Result<Vec<StoredPage>> {
        Ok(self
            .pages
            .read()
            .iter()
            .map(|((page_id, temporary), page)| StoredPage {
                page_id: page_id.clone(),
                size: page.len() as u64,
                temporary: *temporary,
            })
            .collect())
    }

    fn channel(&self, page_id: &PageId, temporary: bool, offset: usize, len: usize) -> Result<DataFileChannel> {
        self.read_page(page_id, temporary, offset, len).map(DataFileChannel::Memory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_read_write_delete() {
        let store = MemoryPageStore::new();
        let id = PageId::new("f", 0);

        store.write_page(&id, false, Bytes::from_static(b"0123456789")).unwrap();
        assert_eq!(&store.read_page(&id, false, 2, 3).unwrap()[..], b"234");
        assert_eq!(&store.read_page(&id, false, 8, 10).unwrap()[..], b"89");
        assert!(store.read_page(&id, true, 0, 1).unwrap_err().is_page_not_found());

        store.delete_page(&id, false).unwrap();
        assert!(store.read_page(&id, false, 0, 1).unwrap_err().is_page_not_found());
        assert!(store.delete_page(&id, false).unwrap_err().is_page_not_found());
    }

    #[test]
    fn test_memory_store_commit_file() {
        let store = MemoryPageStore::new();
        for i in 0..3 {
            store.write_page(&PageId::new("f", i), true, Bytes::from(vec![i as u8])).unwrap();
        }
        store.write_page(&PageId::new("g", 0), true, Bytes::from_static(b"g")).unwrap();
        assert!(store.enumerate("f").unwrap().is_empty());

        store.commit_file("f").unwrap();
        assert_eq!(
            store.enumerate("f").unwrap(),
            (0..3).map(|i| PageId::new("f", i)).collect_vec()
        );
        assert!(store.enumerate("g").unwrap().is_empty());
        assert_eq!(store.scan().unwrap().len(), 4);
    }
}
