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

use std::{fmt::Display, sync::Arc};

/// Identifier of a cached page: the remote file it belongs to and its index within that file.
///
/// Ordered by `(file_id, page_index)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId {
    file_id: Arc<str>,
    page_index: u64,
}

impl PageId {
    /// Create a page id.
    pub fn new(file_id: impl Into<Arc<str>>, page_index: u64) -> Self {
        Self {
            file_id: file_id.into(),
            page_index,
        }
    }

    /// Id of the file the page belongs to.
    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    /// Index of the page within its file.
    pub fn page_index(&self) -> u64 {
        self.page_index
    }
}

impl Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file_id, self.page_index)
    }
}

/// Hierarchical label used for quota accounting.
///
/// The global scope is `"."`. Other scopes are dot-separated paths such as `"db"`, `"db.table"` and
/// `"db.table.part"`. The parent of a single-component scope is the global scope.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheScope(Arc<str>);

impl CacheScope {
    const GLOBAL: &'static str = ".";
    const SEPARATOR: char = '.';

    /// The root scope. Its usage equals the total cache usage.
    pub fn global() -> Self {
        Self(Arc::from(Self::GLOBAL))
    }

    /// Create a scope from a dot-separated path.
    ///
    /// Empty components are dropped, so `""`, `"."` and `".."` all denote the global scope.
    pub fn new(path: impl AsRef<str>) -> Self {
        let normalized = path
            .as_ref()
            .split(Self::SEPARATOR)
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
            .join(".");
        if normalized.is_empty() {
            Self::global()
        } else {
            Self(Arc::from(normalized))
        }
    }

    /// Returns `true` for the root scope.
    pub fn is_global(&self) -> bool {
        &*self.0 == Self::GLOBAL
    }

    /// The enclosing scope, `None` for the global scope.
    pub fn parent(&self) -> Option<Self> {
        if self.is_global() {
            return None;
        }
        match self.0.rfind(Self::SEPARATOR) {
            Some(pos) => Some(Self(Arc::from(&self.0[..pos]))),
            None => Some(Self::global()),
        }
    }

    /// Number of components, `0` for the global scope.
    pub fn depth(&self) -> usize {
        if self.is_global() {
            0
        } else {
            self.0.split(Self::SEPARATOR).count()
        }
    }

    /// Returns `true` if `other` equals `self` or lies beneath it.
    pub fn contains(&self, other: &CacheScope) -> bool {
        if self.is_global() || self == other {
            return true;
        }
        other.0.len() > self.0.len()
            && other.0.starts_with(&*self.0)
            && other.0[self.0.len()..].starts_with(Self::SEPARATOR)
    }

    /// Iterate over `self` and all of its ancestors, ending with the global scope.
    pub fn ancestors(&self) -> impl Iterator<Item = CacheScope> {
        std::iter::successors(Some(self.clone()), |scope| scope.parent())
    }

    /// The scope path.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CacheScope {
    fn default() -> Self {
        Self::global()
    }
}

impl Display for CacheScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-request cache hints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheContext {
    scope: CacheScope,
    cacheable: bool,
    stats_only: bool,
    temporary: bool,
}

impl Default for CacheContext {
    fn default() -> Self {
        Self {
            scope: CacheScope::global(),
            cacheable: true,
            stats_only: false,
            temporary: false,
        }
    }
}

impl CacheContext {
    /// Scope the page is accounted to.
    pub fn with_scope(mut self, scope: CacheScope) -> Self {
        self.scope = scope;
        self
    }

    /// If `false`, the request bypasses the cache.
    pub fn with_cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    /// If `true`, the request only feeds the shadow cache and never materializes bytes.
    pub fn with_stats_only(mut self, stats_only: bool) -> Self {
        self.stats_only = stats_only;
        self
    }

    /// If `true`, the request targets pages of a file that has not been committed yet.
    pub fn with_temporary(mut self, temporary: bool) -> Self {
        self.temporary = temporary;
        self
    }

    /// Scope the page is accounted to.
    pub fn scope(&self) -> &CacheScope {
        &self.scope
    }

    /// Whether the request may touch the cache.
    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    /// Whether the request only feeds the shadow cache.
    pub fn is_stats_only(&self) -> bool {
        self.stats_only
    }

    /// Whether the request targets temporary pages.
    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    /// Whether the engine may store or serve bytes for this request.
    pub fn materializes(&self) -> bool {
        self.cacheable && !self.stats_only
    }
}
