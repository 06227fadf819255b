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

//! A local page cache for distributed storage clients.
//!
//! Remote file content is split into fixed-size pages addressed by [`PageId`]. Pages are cached in a
//! [`PageStore`] and charged to hierarchical [`CacheScope`]s with optional quotas. When space runs out, an
//! [`EvictionPolicy`] picks the pages to drop.
//!
//! The engine, [`LocalPageCache`], can be decorated by a [`ShadowPageCache`] estimating the hit ratio of a larger
//! cache, and by a [`GuardedPageCache`] turning every failure into a miss. [`PageCacheBuilder`] assembles them.

/// Page cache builder.
pub mod builder;
/// Page cache engine and the operation contract of all layers.
pub mod engine;
/// Eviction policies.
pub mod eviction;
/// Asynchronous write-behind.
pub mod flusher;
/// Fault-containment layer.
pub mod guard;
pub mod meta;
/// Re-exports of the commonly used types.
pub mod prelude;
pub mod shadow;
/// Physical page storage.
pub mod store;

#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

pub use prelude::*;
