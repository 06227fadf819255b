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

use std::sync::Arc;

use mixtrics::{metrics::BoxedRegistry, registry::noop::NoopMetricsRegistry};
use pagecache_common::{
    error::{Error, ErrorKind, Result},
    metrics::Metrics,
    page::CacheScope,
};

use crate::{
    engine::{LocalPageCache, LocalPageCacheConfig, PageCache, RestoreMode},
    eviction::EvictionConfig,
    flusher::WriteBehindConfig,
    guard::GuardedPageCache,
    meta::MetaConfig,
    shadow::{ShadowCache, ShadowCacheConfig, ShadowPageCache},
    store::PageStore,
};

/// Page cache builder.
pub struct PageCacheBuilder {
    name: String,
    capacity: u64,
    page_size: usize,
    quotas: Vec<(CacheScope, u64)>,
    shards: usize,
    retry_budget: usize,
    eviction_config: EvictionConfig,
    write_behind: Option<WriteBehindConfig>,
    shadow: Option<ShadowCacheConfig>,
    restore: RestoreMode,
    registry: BoxedRegistry,
}

impl PageCacheBuilder {
    /// Create a page cache builder with the total capacity in bytes.
    pub fn new(capacity: u64) -> Self {
        Self {
            name: "pagecache".to_string(),
            capacity,
            page_size: 1024 * 1024,
            quotas: vec![],
            shards: 64,
            retry_budget: 8,
            eviction_config: EvictionConfig::default(),
            write_behind: None,
            shadow: None,
            restore: RestoreMode::default(),
            registry: Box::new(NoopMetricsRegistry),
        }
    }

    /// Set the name of the page cache instance. The name labels the metrics.
    ///
    /// Default: `pagecache`.
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Set the maximum page size in bytes. Larger pages and appends are refused.
    ///
    /// Default: 1 MiB.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Bound the bytes charged to a scope and its descendants.
    ///
    /// Scopes without a quota are bounded only by their ancestors.
    pub fn with_quota(mut self, scope: CacheScope, capacity: u64) -> Self {
        self.quotas.push((scope, capacity));
        self
    }

    /// Set the shard count of the page metadata. Pages on different shards are admitted in parallel.
    ///
    /// Default: 64.
    pub fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }

    /// Set how many times a reservation racing with other admissions or evictions is retried.
    ///
    /// Default: 8.
    pub fn with_retry_budget(mut self, retry_budget: usize) -> Self {
        self.retry_budget = retry_budget;
        self
    }

    /// Set the eviction algorithm.
    ///
    /// Default: LRU.
    pub fn with_eviction_config(mut self, eviction_config: impl Into<EvictionConfig>) -> Self {
        self.eviction_config = eviction_config.into();
        self
    }

    /// Write pages asynchronously on background threads.
    ///
    /// Default: pages are written synchronously by `put`.
    pub fn with_write_behind(mut self, write_behind: WriteBehindConfig) -> Self {
        self.write_behind = Some(write_behind);
        self
    }

    /// Track accesses in a shadow cache. Only applies to [`PageCacheBuilder::build_guarded`].
    ///
    /// Default: no shadow cache.
    pub fn with_shadow(mut self, shadow: ShadowCacheConfig) -> Self {
        self.shadow = Some(shadow);
        self
    }

    /// Set whether the pages left in the page store are re-admitted on startup.
    ///
    /// Default: [`RestoreMode::Disabled`].
    pub fn with_restore(mut self, restore: RestoreMode) -> Self {
        self.restore = restore;
        self
    }

    /// Set the metrics registry.
    ///
    /// Default: metrics are dropped.
    pub fn with_metrics_registry(mut self, registry: BoxedRegistry) -> Self {
        self.registry = registry;
        self
    }

    fn validate(&self) -> Result<()> {
        let invalid = |message: &str| Err(Error::new(ErrorKind::Config, message));
        if self.page_size == 0 {
            return invalid("page size must be positive");
        }
        if self.shards == 0 {
            return invalid("shards must be positive");
        }
        if self.retry_budget == 0 {
            return invalid("retry budget must be positive");
        }
        if let Some(write_behind) = self.write_behind.as_ref() {
            if write_behind.threads == 0 || write_behind.queue_capacity == 0 {
                return invalid("write-behind threads and queue capacity must be positive");
            }
        }
        if let Some(shadow) = self.shadow.as_ref() {
            if shadow.filters == 0 || shadow.bits_per_filter == 0 || shadow.hashes == 0 {
                return invalid("shadow cache filters, bits and hashes must be positive");
            }
            if shadow.window.is_zero() {
                return invalid("shadow cache window must be positive");
            }
        }
        if let Some((scope, _)) = self.quotas.iter().find(|(scope, _)| scope.is_global()) {
            return Err(Error::new(ErrorKind::Config, "use the capacity to bound the global scope")
                .with_context("scope", scope));
        }
        Ok(())
    }

    fn open(self, store: Arc<dyn PageStore>) -> Result<(LocalPageCache, Option<ShadowCacheConfig>, Arc<Metrics>)> {
        self.validate()?;
        let metrics = Arc::new(Metrics::new(self.name.clone(), &self.registry));
        let cache = LocalPageCache::open(LocalPageCacheConfig {
            name: self.name,
            page_size: self.page_size,
            meta: MetaConfig {
                capacity: self.capacity,
                quotas: self.quotas,
                shards: self.shards,
                retry_budget: self.retry_budget,
            },
            policy: self.eviction_config.build(),
            store,
            write_behind: self.write_behind,
            restore: self.restore,
            metrics: metrics.clone(),
        })?;
        Ok((cache, self.shadow, metrics))
    }

    /// Build the page cache engine upon the page store.
    pub fn build(self, store: Arc<dyn PageStore>) -> Result<LocalPageCache> {
        self.open(store).map(|(cache, _, _)| cache)
    }

    /// Build the page cache engine, wrapped by the shadow cache if configured and by the fault-containment layer.
    pub fn build_guarded(self, store: Arc<dyn PageStore>) -> Result<GuardedPageCache<Arc<dyn PageCache>>> {
        let (cache, shadow, metrics) = self.open(store)?;
        let cache: Arc<dyn PageCache> = match shadow {
            Some(config) => {
                let shadow = Arc::new(ShadowCache::new(&config, metrics.clone()));
                Arc::new(ShadowPageCache::new(cache, shadow))
            }
            None => Arc::new(cache),
        };
        Ok(GuardedPageCache::new(cache, metrics))
    }
}
