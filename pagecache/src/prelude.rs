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

pub use pagecache_common::{
    error::{Error, ErrorKind, Result},
    metrics::Metrics,
    page::{CacheContext, CacheScope, PageId},
};

pub use crate::{
    builder::PageCacheBuilder,
    engine::{CacheState, CacheUsage, Loader, LocalPageCache, PageCache, RestoreMode},
    eviction::{Candidate, EvictionConfig, EvictionPolicy, Fifo, FifoConfig, Lru, LruConfig},
    flusher::{QueueFullPolicy, WriteBehindConfig},
    guard::GuardedPageCache,
    meta::{PageInfo, QuotaUsage, Rejection, WriteState},
    shadow::{ShadowCache, ShadowCacheConfig, ShadowPageCache, ShadowStats},
    store::{DataFileChannel, FsPageStore, MemoryPageStore, PageStore, StoredPage},
};
