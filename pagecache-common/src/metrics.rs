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

use std::borrow::Cow;

use mixtrics::metrics::{BoxedCounter, BoxedGauge, BoxedRegistry};

/// Metrics of a page cache instance, labelled by the cache name.
#[derive(Debug)]
pub struct Metrics {
    /* engine metrics */
    /// Pages admitted by `put`.
    pub put: BoxedCounter,
    /// `put` calls refused by state, quota or a failed write.
    pub put_rejected: BoxedCounter,
    /// Reads served from the cache.
    pub hit: BoxedCounter,
    /// Reads that found no resident page.
    pub miss: BoxedCounter,
    /// Reads that failed although the page was resident.
    pub read_error: BoxedCounter,
    /// Loader invocations after a miss.
    pub load: BoxedCounter,
    /// Pages removed by `delete`, file deletion or invalidation.
    pub delete: BoxedCounter,
    /// Pages evicted under capacity pressure.
    pub evict: BoxedCounter,
    /// Successful appends.
    pub append: BoxedCounter,
    /// Pages removed by `invalidate`.
    pub invalidate: BoxedCounter,

    /// Resident bytes.
    pub usage_bytes: BoxedGauge,
    /// Resident pages.
    pub resident_pages: BoxedGauge,

    /* write-behind metrics */
    /// Pages queued for a background write.
    pub async_enqueue: BoxedCounter,
    /// Pages written synchronously because the queue was full or closed.
    pub async_fallback: BoxedCounter,
    /// Background writes that failed.
    pub async_failure: BoxedCounter,

    /* containment metrics */
    /// Failures collapsed into a degraded result at the cache boundary.
    pub containment: BoxedCounter,

    /* shadow cache metrics */
    /// Pages read through the shadow cache.
    pub shadow_read_pages: BoxedCounter,
    /// Bytes read through the shadow cache.
    pub shadow_read_bytes: BoxedCounter,
    /// Pages that would have been hits in the shadow cache.
    pub shadow_hit_pages: BoxedCounter,
    /// Bytes that would have been hits in the shadow cache.
    pub shadow_hit_bytes: BoxedCounter,
    /// Estimated distinct pages within the shadow window.
    pub shadow_working_set_pages: BoxedGauge,
    /// Estimated distinct bytes within the shadow window.
    pub shadow_working_set_bytes: BoxedGauge,
}

impl Metrics {
    /// Create a new metric with the given name.
    pub fn new(name: impl Into<Cow<'static, str>>, registry: &BoxedRegistry) -> Self {
        let name = name.into();

        /* engine metrics */

        let pagecache_op_total = registry.register_counter_vec(
            "pagecache_op_total".into(),
            "page cache operations".into(),
            &["name", "op"],
        );
        let pagecache_usage =
            registry.register_gauge_vec("pagecache_usage".into(), "page cache usage".into(), &["name", "unit"]);

        let put = pagecache_op_total.counter(&[name.clone(), "put".into()]);
        let put_rejected = pagecache_op_total.counter(&[name.clone(), "put_rejected".into()]);
        let hit = pagecache_op_total.counter(&[name.clone(), "hit".into()]);
        let miss = pagecache_op_total.counter(&[name.clone(), "miss".into()]);
        let read_error = pagecache_op_total.counter(&[name.clone(), "read_error".into()]);
        let load = pagecache_op_total.counter(&[name.clone(), "load".into()]);
        let delete = pagecache_op_total.counter(&[name.clone(), "delete".into()]);
        let evict = pagecache_op_total.counter(&[name.clone(), "evict".into()]);
        let append = pagecache_op_total.counter(&[name.clone(), "append".into()]);
        let invalidate = pagecache_op_total.counter(&[name.clone(), "invalidate".into()]);

        let usage_bytes = pagecache_usage.gauge(&[name.clone(), "bytes".into()]);
        let resident_pages = pagecache_usage.gauge(&[name.clone(), "pages".into()]);

        /* write-behind metrics */

        let pagecache_async_write_total = registry.register_counter_vec(
            "pagecache_async_write_total".into(),
            "page cache write-behind operations".into(),
            &["name", "op"],
        );

        let async_enqueue = pagecache_async_write_total.counter(&[name.clone(), "enqueue".into()]);
        let async_fallback = pagecache_async_write_total.counter(&[name.clone(), "fallback".into()]);
        let async_failure = pagecache_async_write_total.counter(&[name.clone(), "failure".into()]);

        /* containment metrics */

        let pagecache_containment_total = registry.register_counter_vec(
            "pagecache_containment_total".into(),
            "page cache failures collapsed into degraded results".into(),
            &["name"],
        );

        let containment = pagecache_containment_total.counter(&[name.clone()]);

        /* shadow cache metrics */

        let pagecache_shadow_total = registry.register_counter_vec(
            "pagecache_shadow_total".into(),
            "shadow cache accesses".into(),
            &["name", "op", "unit"],
        );
        let pagecache_shadow_working_set = registry.register_gauge_vec(
            "pagecache_shadow_working_set".into(),
            "shadow cache estimated working set".into(),
            &["name", "unit"],
        );

        let shadow_read_pages = pagecache_shadow_total.counter(&[name.clone(), "read".into(), "pages".into()]);
        let shadow_read_bytes = pagecache_shadow_total.counter(&[name.clone(), "read".into(), "bytes".into()]);
        let shadow_hit_pages = pagecache_shadow_total.counter(&[name.clone(), "hit".into(), "pages".into()]);
        let shadow_hit_bytes = pagecache_shadow_total.counter(&[name.clone(), "hit".into(), "bytes".into()]);

        let shadow_working_set_pages = pagecache_shadow_working_set.gauge(&[name.clone(), "pages".into()]);
        let shadow_working_set_bytes = pagecache_shadow_working_set.gauge(&[name, "bytes".into()]);

        Self {
            put,
            put_rejected,
            hit,
            miss,
            read_error,
            load,
            delete,
            evict,
            append,
            invalidate,
            usage_bytes,
            resident_pages,
            async_enqueue,
            async_fallback,
            async_failure,
            containment,
            shadow_read_pages,
            shadow_read_bytes,
            shadow_hit_pages,
            shadow_hit_bytes,
            shadow_working_set_pages,
            shadow_working_set_bytes,
        }
    }

    /// Build noop metrics.
    ///
    /// Normally only used for tests or benches.
    pub fn noop() -> Self {
        use mixtrics::registry::noop::NoopMetricsRegistry;

        Self::new("test", &(Box::new(NoopMetricsRegistry) as BoxedRegistry))
    }
}
