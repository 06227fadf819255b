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
    sync::Arc,
    thread::JoinHandle,
    time::Duration,
};

use bytes::Bytes;
use flume::{SendTimeoutError, TrySendError};
use pagecache_common::{
    error::{Error, ErrorKind, Result},
    metrics::Metrics,
    page::PageId,
};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::{
    meta::{Flushed, PageMetadataStore},
    store::PageStore,
};

/// What `put` does when the write-behind queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueFullPolicy {
    /// Wait for a free slot up to the timeout, then write synchronously.
    Block(Duration),
    /// Write synchronously.
    Fallback,
    /// Roll the admission back. `put` returns `false`.
    Reject,
}

impl Default for QueueFullPolicy {
    fn default() -> Self {
        Self::Block(Duration::from_millis(10))
    }
}

/// Config of the asynchronous write-behind path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteBehindConfig {
    /// Count of flusher threads.
    pub threads: usize,
    /// Capacity of the bounded write-behind queue.
    pub queue_capacity: usize,
    /// Behavior when the queue is full.
    pub queue_full_policy: QueueFullPolicy,
}

impl Default for WriteBehindConfig {
    fn default() -> Self {
        Self {
            threads: 2,
            queue_capacity: 1024,
            queue_full_policy: QueueFullPolicy::default(),
        }
    }
}

/// A page admitted as pending, waiting to be written to the page store.
#[derive(Debug)]
pub struct Submission {
    /// Page id.
    pub page_id: PageId,
    /// Namespace of the page.
    pub temporary: bool,
    /// Admission order, tells a stale write from a current one.
    pub sequence: u64,
    /// Page bytes.
    pub page: Bytes,
}

/// Count of accepted but unfinished submissions.
#[derive(Debug, Default)]
struct Inflight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Inflight {
    fn inc(&self) {
        *self.count.lock() += 1;
    }

    fn dec(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.idle.wait(&mut count);
        }
    }
}

/// Background writers draining a bounded queue of pending pages into the page store.
pub struct Flusher {
    tx: RwLock<Option<flume::Sender<Submission>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    inflight: Arc<Inflight>,
    policy: QueueFullPolicy,
}

impl Debug for Flusher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flusher")
            .field("threads", &self.handles.lock().len())
            .field("inflight", &*self.inflight.count.lock())
            .field("policy", &self.policy)
            .finish()
    }
}

impl Flusher {
    /// Spawn the flusher threads.
    pub fn open(
        config: &WriteBehindConfig,
        meta: Arc<PageMetadataStore>,
        store: Arc<dyn PageStore>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let (tx, rx) = flume::bounded(config.queue_capacity);
        let inflight = Arc::new(Inflight::default());

        let handles = (0..config.threads.max(1))
            .map(|id| {
                let runner = Runner {
                    rx: rx.clone(),
                    meta: meta.clone(),
                    store: store.clone(),
                    metrics: metrics.clone(),
                    inflight: inflight.clone(),
                };
                std::thread::Builder::new()
                    .name(format!("pagecache-flusher-{id}"))
                    .spawn(move || runner.run())
                    .map_err(|e| Error::new(ErrorKind::Io, "spawn flusher failed").with_source(e))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            tx: RwLock::new(Some(tx)),
            handles: Mutex::new(handles),
            inflight,
            policy: config.queue_full_policy,
        })
    }

    /// The configured queue full policy.
    pub fn policy(&self) -> QueueFullPolicy {
        self.policy
    }

    /// Queue a pending page.
    ///
    /// Gives the submission back if the queue is full (after waiting when the policy says so) or closed.
    pub fn submit(&self, submission: Submission) -> std::result::Result<(), Submission> {
        let tx = self.tx.read();
        let Some(tx) = tx.as_ref() else {
            return Err(submission);
        };

        self.inflight.inc();
        let res = match self.policy {
            QueueFullPolicy::Block(timeout) => tx.send_timeout(submission, timeout).map_err(|e| match e {
                SendTimeoutError::Timeout(s) | SendTimeoutError::Disconnected(s) => s,
            }),
            QueueFullPolicy::Fallback | QueueFullPolicy::Reject => tx.try_send(submission).map_err(|e| match e {
                TrySendError::Full(s) | TrySendError::Disconnected(s) => s,
            }),
        };
        if res.is_err() {
            self.inflight.dec();
        }
        res
    }

    /// Wait until every accepted submission is written or dropped.
    pub fn wait(&self) {
        self.inflight.wait();
    }

    /// Stop accepting submissions, drain the queue and join the flusher threads.
    pub fn close(&self) {
        drop(self.tx.write().take());
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("[flusher]: flusher thread panicked");
            }
        }
    }
}

struct Runner {
    rx: flume::Receiver<Submission>,
    meta: Arc<PageMetadataStore>,
    store: Arc<dyn PageStore>,
    metrics: Arc<Metrics>,
    inflight: Arc<Inflight>,
}

impl Runner {
    fn run(self) {
        // Exits once all senders are gone and the queue is drained.
        while let Ok(submission) = self.rx.recv() {
            self.flush(submission);
            self.inflight.dec();
        }
        tracing::debug!("[flusher]: queue closed, exit");
    }

    #[cfg_attr(feature = "tracing", fastrace::trace(name = "pagecache::flusher::flush"))]
    fn flush(&self, submission: Submission) {
        let Submission {
            page_id,
            temporary,
            sequence,
            page,
        } = submission;

        let written = match self.store.write_page(&page_id, temporary, page) {
            Ok(()) => true,
            Err(e) => {
                self.metrics.async_failure.increase(1);
                tracing::warn!("[flusher]: write page {page_id} failed, drop it: {e}");
                false
            }
        };

        match self.meta.finish_flush(&page_id, sequence, written) {
            Flushed::Clean | Flushed::Dropped => {}
            Flushed::Gone => tracing::trace!("[flusher]: page {page_id} removed while pending, written bytes deleted"),
            Flushed::Superseded => tracing::warn!("[flusher]: write of page {page_id} matches no admission"),
        }
    }
}
