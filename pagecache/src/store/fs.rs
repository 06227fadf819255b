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
    fs::{create_dir_all, read_dir, remove_file, rename, File, OpenOptions},
    hash::{Hash, Hasher},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use bytes::Bytes;
use itertools::Itertools;
use pagecache_common::{
    error::{Error, ErrorKind, Result},
    page::PageId,
};
use twox_hash::XxHash64;

use super::{clamp, DataFileChannel, PageStore, StoredPage};

const PAGES_DIR: &str = "pages";
const TEMP_DIR: &str = "temp";
const STAGING_SUFFIX: &str = ".staging";

/// A page store upon a directory in a filesystem.
///
/// Layout:
///
/// ```text
/// <dir>/pages/<bucket>/<file>/<page index>
/// <dir>/temp/<file>/<page index>
/// ```
///
/// `<file>` is the hex-encoded file id and `<bucket>` spreads files over a fixed number of directories. Pages are
/// written to a staging file and renamed into place, so readers never see a partially written page.
#[derive(Debug)]
pub struct FsPageStore {
    dir: PathBuf,
    buckets: u64,
    staging: AtomicU64,
}

impl FsPageStore {
    const DEFAULT_BUCKETS: u64 = 1000;

    /// Use the given directory as the page store root.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_buckets(dir, Self::DEFAULT_BUCKETS)
    }

    /// Use the given directory as the page store root with a custom bucket count.
    ///
    /// The bucket count must not change between restarts, or restored pages will not be found.
    pub fn open_with_buckets(dir: impl AsRef<Path>, buckets: u64) -> Result<Self> {
        if buckets == 0 {
            return Err(Error::new(ErrorKind::Config, "bucket count must be positive"));
        }
        let dir = dir.as_ref().to_path_buf();
        create_dir_all(dir.join(PAGES_DIR))?;
        create_dir_all(dir.join(TEMP_DIR))?;
        Ok(Self {
            dir,
            buckets,
            staging: AtomicU64::new(0),
        })
    }

    fn file_dir(&self, file_id: &str, temporary: bool) -> PathBuf {
        let encoded = encode_file_id(file_id);
        if temporary {
            self.dir.join(TEMP_DIR).join(encoded)
        } else {
            let mut hasher = XxHash64::with_seed(0);
            file_id.hash(&mut hasher);
            let bucket = hasher.finish() % self.buckets;
            self.dir.join(PAGES_DIR).join(bucket.to_string()).join(encoded)
        }
    }

    fn page_path(&self, page_id: &PageId, temporary: bool) -> PathBuf {
        self.file_dir(page_id.file_id(), temporary)
            .join(page_id.page_index().to_string())
    }

    fn open_page(&self, page_id: &PageId, temporary: bool) -> Result<File> {
        File::open(self.page_path(page_id, temporary)).map_err(|e| Error::io_error(e).with_context("page", page_id))
    }
}

impl PageStore for FsPageStore {
    fn write_page(&self, page_id: &PageId, temporary: bool, page: Bytes) -> Result<()> {
        let path = self.page_path(page_id, temporary);
        if let Some(parent) = path.parent() {
            create_dir_all(parent)?;
        }
        let staging = path.with_extension(format!(
            "{}{STAGING_SUFFIX}",
            self.staging.fetch_add(1, Ordering::Relaxed)
        ));
        let res = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&staging)
            .and_then(|mut file| file.write_all(&page))
            .and_then(|_| rename(&staging, &path));
        if let Err(e) = res {
            let _ = remove_file(&staging);
            return Err(Error::new(ErrorKind::Io, "write page failed")
                .with_context("page", page_id)
                .with_source(e));
        }
        Ok(())
    }

    fn read_page(&self, page_id: &PageId, temporary: bool, offset: usize, len: usize) -> Result<Bytes> {
        let mut file = self.open_page(page_id, temporary)?;
        let size = file.metadata()?.len() as usize;
        let range = clamp(size, offset, len);
        let mut buf = vec![0; range.len()];
        file.seek(SeekFrom::Start(range.start as u64))?;
        file.read_exact(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    fn delete_page(&self, page_id: &PageId, temporary: bool) -> Result<()> {
        remove_file(self.page_path(page_id, temporary)).map_err(|e| Error::io_error(e).with_context("page", page_id))
    }

    fn enumerate(&self, file_id: &str) -> Result<Vec<PageId>> {
        let dir = self.file_dir(file_id, false);
        if !dir.exists() {
            return Ok(vec![]);
        }
        let mut ids = vec![];
        for entry in read_dir(dir)? {
            if let Some(index) = parse_page_index(&entry?.path()) {
                ids.push(PageId::new(file_id, index));
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn commit_file(&self, file_id: &str) -> Result<()> {
        let from = self.file_dir(file_id, true);
        if !from.exists() {
            return Ok(());
        }
        let to = self.file_dir(file_id, false);
        create_dir_all(&to)?;
        for entry in read_dir(&from)? {
            let path = entry?.path();
            if let Some(index) = parse_page_index(&path) {
                rename(&path, to.join(index.to_string()))?;
            }
        }
        let _ = std::fs::remove_dir_all(&from);
        Ok(())
    }

    fn scan(&self) -> Result<Vec<StoredPage>> {
        let mut pages = vec![];

        let mut file_dirs = vec![];
        for bucket in read_dir(self.dir.join(PAGES_DIR))? {
            for file in read_dir(bucket?.path())? {
                file_dirs.push((file?.path(), false));
            }
        }
        for file in read_dir(self.dir.join(TEMP_DIR))? {
            file_dirs.push((file?.path(), true));
        }

        for (dir, temporary) in file_dirs {
            let Some(file_id) = dir.file_name().and_then(|name| name.to_str()).and_then(decode_file_id) else {
                tracing::warn!("[fs page store]: skip unrecognized directory: {dir:?}");
                continue;
            };
            for entry in read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                match parse_page_index(&path) {
                    Some(index) => pages.push(StoredPage {
                        page_id: PageId::new(file_id.as_str(), index),
                        size: entry.metadata()?.len(),
                        temporary,
                    }),
                    None => {
                        // Leftover of an interrupted write.
                        let _ = remove_file(&path);
                    }
                }
            }
        }

        Ok(pages.into_iter().sorted_by(|a, b| a.page_id.cmp(&b.page_id)).collect())
    }

    fn channel(&self, page_id: &PageId, temporary: bool, offset: usize, len: usize) -> Result<DataFileChannel> {
        let file = self.open_page(page_id, temporary)?;
        let size = file.metadata()?.len() as usize;
        let range = clamp(size, offset, len);
        Ok(DataFileChannel::File {
            file,
            offset: range.start as u64,
            len: range.len(),
        })
    }
}

fn parse_page_index(path: &Path) -> Option<u64> {
    path.file_name()?.to_str()?.parse().ok()
}

fn encode_file_id(file_id: &str) -> String {
    file_id.bytes().map(|b| format!("{b:02x}")).collect()
}

fn decode_file_id(encoded: &str) -> Option<String> {
    if encoded.len() % 2 != 0 {
        return None;
    }
    let bytes = (0..encoded.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(encoded.get(i..i + 2)?, 16).ok())
        .collect::<Option<Vec<_>>>()?;
    String::from_utf8(bytes).ok()
}
